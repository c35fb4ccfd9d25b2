//! Session registry.
//!
//! Owns every [`Session`] and its at-most-one [`PendingRequest`]. The
//! correlator reads and mutates sessions only through these methods.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use iris_core::{RequestId, SessionId, UserProfile};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::errors::ClientError;
use crate::request::{Expectation, Outcome};

/// Snapshot of one session's state.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub profile: UserProfile,
    /// Most recent audio artifact. Only the latest is kept.
    pub last_artifact: Option<PathBuf>,
    pub transcript: Option<String>,
    pub awaiting: bool,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new(id: SessionId, profile: UserProfile) -> Self {
        Self {
            id,
            profile,
            last_artifact: None,
            transcript: None,
            awaiting: false,
            created_at: Utc::now(),
        }
    }

    /// Name the service addresses this session by.
    pub fn username(&self) -> &str {
        match self.profile.username() {
            "" => self.id.as_str(),
            name => name,
        }
    }
}

pub struct PendingRequest {
    pub request_id: RequestId,
    pub submitted_at: Instant,
    pub deadline: Instant,
    pub expects: Expectation,
    completion: oneshot::Sender<Outcome>,
}

/// Whether a reply may complete the session's pending request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Accept,
    NoWaiter,
    /// The reply echoes a different request id.
    Stale { pending: RequestId },
    /// The pending request waits for another kind of reply.
    Unexpected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    Released,
    NoWaiter,
}

struct Entry {
    session: Session,
    pending: Option<PendingRequest>,
}

impl Entry {
    fn snapshot(&self) -> Session {
        let mut session = self.session.clone();
        session.awaiting = self.pending.is_some();
        session
    }
}

pub struct SessionRegistry {
    entries: DashMap<SessionId, Entry>,
    default_profile: UserProfile,
}

impl SessionRegistry {
    pub fn new(default_profile: UserProfile) -> Self {
        Self {
            entries: DashMap::new(),
            default_profile,
        }
    }

    pub fn default_profile(&self) -> &UserProfile {
        &self.default_profile
    }

    /// Existing session, or a new one seeded with the default profile.
    pub fn get_or_create(&self, id: &SessionId) -> Session {
        self.entries
            .entry(id.clone())
            .or_insert_with(|| {
                debug!(session_id = %id, "session created");
                Entry {
                    session: Session::new(id.clone(), self.default_profile.clone()),
                    pending: None,
                }
            })
            .snapshot()
    }

    /// Fresh session whose username is its own id.
    pub fn start_session(&self) -> Session {
        let id = SessionId::new();
        let profile = self.default_profile.clone().with_username(id.as_str());
        self.register(id, profile)
    }

    /// Create or replace a session with an explicit profile.
    pub fn register(&self, id: SessionId, profile: UserProfile) -> Session {
        let mut entry = self.entries.entry(id.clone()).or_insert_with(|| Entry {
            session: Session::new(id.clone(), profile.clone()),
            pending: None,
        });
        entry.session.profile = profile;
        info!(session_id = %id, username = entry.session.username(), "session registered");
        entry.snapshot()
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.entries.get(id).map(|e| e.snapshot())
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn profile(&self, id: &SessionId) -> Option<UserProfile> {
        self.entries.get(id).map(|e| e.session.profile.clone())
    }

    /// Session addressed by `username`, matching either the profile username
    /// or the session id.
    pub fn find_by_username(&self, username: &str) -> Option<SessionId> {
        if username.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|e| e.session.username() == username || e.key().as_str() == username)
            .map(|e| e.key().clone())
    }

    /// Merge a profile update into the session addressed by `username`.
    /// Returns the updated profile, or `None` when no session matches or the
    /// merged profile is malformed.
    pub fn apply_profile_update(&self, username: &str, update: &Value) -> Option<(SessionId, UserProfile)> {
        let Some(id) = self.find_by_username(username) else {
            warn!(username, "ignoring profile update for unknown user");
            return None;
        };
        let mut entry = self.entries.get_mut(&id)?;
        match entry.session.profile.merged(update) {
            Ok(profile) => {
                entry.session.profile = profile.clone();
                info!(session_id = %id, "updated user profile");
                Some((id.clone(), profile))
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "rejected malformed profile update");
                None
            }
        }
    }

    /// Local profile edit from a front end; creates the session if needed.
    pub fn update_profile(&self, id: &SessionId, patch: &Value) -> Result<UserProfile, ClientError> {
        let mut entry = self.entries.entry(id.clone()).or_insert_with(|| Entry {
            session: Session::new(id.clone(), self.default_profile.clone().with_username(id.as_str())),
            pending: None,
        });
        let profile = entry
            .session
            .profile
            .merged(patch)
            .map_err(|e| ClientError::InvalidProfile(e.to_string()))?;
        entry.session.profile = profile.clone();
        debug!(session_id = %id, "profile edited");
        Ok(profile)
    }

    /// STT language for the session, falling back to `default_lang`.
    pub fn language_for(&self, id: &SessionId, default_lang: &str) -> String {
        self.entries
            .get(id)
            .map(|e| e.session.profile.speech.stt_language.clone())
            .filter(|lang| !lang.is_empty())
            .unwrap_or_else(|| default_lang.to_string())
    }

    /// Remember the newest artifact, replacing any earlier one.
    pub fn record_artifact(&self, id: &SessionId, artifact: PathBuf) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            if let Some(previous) = entry.session.last_artifact.replace(artifact) {
                debug!(session_id = %id, previous = %previous.display(), "artifact replaced");
            }
        }
    }

    pub fn record_transcript(&self, id: &SessionId, transcript: String) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.session.transcript = Some(transcript);
        }
    }

    pub fn take_transcript(&self, id: &SessionId) -> Option<String> {
        self.entries.get_mut(id).and_then(|mut e| e.session.transcript.take())
    }

    /// Register the pending request for `id` and return its completion signal.
    pub fn begin_request(
        &self,
        id: &SessionId,
        request_id: RequestId,
        expects: Expectation,
        timeout: Duration,
    ) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let pending = PendingRequest {
            request_id,
            submitted_at: now,
            deadline: now + timeout,
            expects,
            completion: tx,
        };
        let mut entry = self.entries.entry(id.clone()).or_insert_with(|| Entry {
            session: Session::new(id.clone(), self.default_profile.clone()),
            pending: None,
        });
        entry.session.transcript = None;
        if let Some(previous) = entry.pending.replace(pending) {
            warn!(
                session_id = %id,
                request_id = %previous.request_id,
                "replacing an unresolved pending request"
            );
        }
        rx
    }

    /// Check whether a reply of kind `reply` echoing `ident` belongs to the
    /// session's pending request.
    pub fn admit(&self, id: &SessionId, ident: Option<&str>, reply: &Expectation) -> Admission {
        let Some(entry) = self.entries.get(id) else {
            return Admission::NoWaiter;
        };
        let Some(pending) = &entry.pending else {
            return Admission::NoWaiter;
        };
        if let Some(ident) = ident {
            if ident != pending.request_id.as_str() {
                return Admission::Stale {
                    pending: pending.request_id.clone(),
                };
            }
        }
        if &pending.expects != reply {
            return Admission::Unexpected;
        }
        Admission::Accept
    }

    /// Release the session's waiter with `outcome`.
    pub fn complete(&self, id: &SessionId, outcome: Outcome) -> Completion {
        let pending = self.entries.get_mut(id).and_then(|mut e| e.pending.take());
        let Some(pending) = pending else {
            return Completion::NoWaiter;
        };
        let elapsed = pending.submitted_at.elapsed();
        match pending.completion.send(outcome) {
            Ok(()) => {
                debug!(
                    session_id = %id,
                    request_id = %pending.request_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "request completed"
                );
                Completion::Released
            }
            Err(_) => Completion::NoWaiter,
        }
    }

    /// Drop the pending request if it is still `request_id`.
    pub fn abandon(&self, id: &SessionId, request_id: &RequestId) -> bool {
        let Some(mut entry) = self.entries.get_mut(id) else {
            return false;
        };
        let matches = entry
            .pending
            .as_ref()
            .is_some_and(|p| &p.request_id == request_id);
        if matches {
            if let Some(pending) = entry.pending.take() {
                let overdue = Instant::now().saturating_duration_since(pending.deadline);
                debug!(
                    session_id = %id,
                    request_id = %request_id,
                    overdue_ms = overdue.as_millis() as u64,
                    "pending request abandoned"
                );
            }
        }
        matches
    }

    pub fn pending_request(&self, id: &SessionId) -> Option<RequestId> {
        self.entries
            .get(id)
            .and_then(|e| e.pending.as_ref().map(|p| p.request_id.clone()))
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}
