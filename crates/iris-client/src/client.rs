//! The client facade front ends talk to.
//!
//! One [`IrisClient`] owns one broker connection, one routing identity and
//! any number of sessions. Requests go through the [`Sequencer`]; replies
//! come back through a single drain task running the [`Correlator`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use iris_broker::{BrokerAdapter, ConnectionState, ConnectionSupervisor, Inbound};
use iris_core::{RequestId, RoutingIdentity, SessionId, UserProfile};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactCache;
use crate::correlator::{Ack, Channel, Correlator};
use crate::errors::ClientError;
use crate::handler::ResponseHandler;
use crate::request::{Outcome, Request};
use crate::sequencer::{RequestSink, Sequencer};
use crate::sessions::{Session, SessionRegistry};
use crate::settings::IrisSettings;

/// Publishes requests through the connection supervisor.
struct BrokerSink {
    supervisor: Arc<ConnectionSupervisor>,
    sessions: Arc<SessionRegistry>,
    correlator: Arc<Correlator>,
    request_queue: String,
    timeout: Duration,
}

#[async_trait]
impl RequestSink for BrokerSink {
    async fn dispatch(
        &self,
        session: &SessionId,
        request_id: &RequestId,
        request: &Request,
        waited: Duration,
    ) -> Result<oneshot::Receiver<Outcome>, ClientError> {
        let state = self.sessions.get_or_create(session);
        let body = self.correlator.encode_request(&state, request_id, request, waited)?;
        // Register before publishing so a fast reply finds its waiter.
        let rx = self
            .sessions
            .begin_request(session, request_id.clone(), request.expects(), self.timeout);
        if let Err(e) = self.supervisor.publish(&self.request_queue, body).await {
            self.sessions.abandon(session, request_id);
            warn!(
                session_id = %session,
                request_id = %request_id,
                error = %e,
                "failed to publish request"
            );
            return Err(e.into());
        }
        debug!(
            session_id = %session,
            request_id = %request_id,
            queue = %self.request_queue,
            msg_type = request.msg_type(),
            "request published"
        );
        Ok(rx)
    }

    fn abandon(&self, session: &SessionId, request_id: &RequestId) {
        self.sessions.abandon(session, request_id);
    }
}

pub struct IrisClient {
    settings: IrisSettings,
    identity: RoutingIdentity,
    supervisor: Arc<ConnectionSupervisor>,
    sessions: Arc<SessionRegistry>,
    artifacts: Arc<ArtifactCache>,
    sequencer: Sequencer,
    shutdown: CancellationToken,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl IrisClient {
    /// Connect with a freshly generated routing identity.
    pub async fn connect(
        settings: IrisSettings,
        adapter: Arc<dyn BrokerAdapter>,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<Self, ClientError> {
        Self::connect_with_identity(settings, adapter, handler, RoutingIdentity::new()).await
    }

    pub async fn connect_with_identity(
        settings: IrisSettings,
        adapter: Arc<dyn BrokerAdapter>,
        handler: Arc<dyn ResponseHandler>,
        identity: RoutingIdentity,
    ) -> Result<Self, ClientError> {
        let artifacts = Arc::new(ArtifactCache::new(settings.client.audio_cache_dir()));
        artifacts.ensure_root()?;
        let sessions = Arc::new(SessionRegistry::new(settings.user.clone()));
        let correlator = Arc::new(Correlator::new(
            identity.clone(),
            &settings.client,
            sessions.clone(),
            artifacts.clone(),
            handler,
        ));

        let (supervisor, inbound) = ConnectionSupervisor::new(adapter, settings.mq.broker_config());
        let supervisor = Arc::new(supervisor);
        let response_queue = settings
            .mq
            .response_queue
            .clone()
            .unwrap_or_else(|| identity.to_string());
        supervisor
            .subscribe(&response_queue, identity.as_str(), false)
            .await?;
        supervisor
            .subscribe(&settings.mq.error_queue, &settings.mq.error_queue, false)
            .await?;

        let shutdown = CancellationToken::new();
        let drain = tokio::spawn(drain_inbound(
            inbound,
            correlator.clone(),
            supervisor.clone(),
            response_queue.clone(),
            shutdown.clone(),
        ));

        let sink = Arc::new(BrokerSink {
            supervisor: supervisor.clone(),
            sessions: sessions.clone(),
            correlator,
            request_queue: settings.mq.request_queue.clone(),
            timeout: settings.client.response_timeout(),
        });
        let sequencer = Sequencer::new(sink, settings.client.response_timeout());

        info!(
            identity = %identity,
            broker = %supervisor.config().display_url(),
            response_queue = %response_queue,
            "client connected"
        );
        Ok(Self {
            settings,
            identity,
            supervisor,
            sessions,
            artifacts,
            sequencer,
            shutdown,
            drain: Mutex::new(Some(drain)),
        })
    }

    pub fn identity(&self) -> &RoutingIdentity {
        &self.identity
    }

    pub fn settings(&self) -> &IrisSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn artifacts(&self) -> &ArtifactCache {
        &self.artifacts
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn reconnects(&self) -> u64 {
        self.supervisor.reconnects()
    }

    /// New session with a generated id, addressed by that id.
    pub fn start_session(&self) -> Session {
        self.sessions.start_session()
    }

    pub fn register_session(&self, id: SessionId, profile: UserProfile) -> Session {
        self.sessions.register(id, profile)
    }

    /// Send typed input. `lang` defaults to the session's STT language.
    pub async fn send_utterance(
        &self,
        session: &SessionId,
        text: &str,
        lang: Option<&str>,
    ) -> Result<Outcome, ClientError> {
        let lang = self.resolve_lang(session, lang);
        self.submit(session, Request::utterance(text, lang)).await
    }

    /// Send spoken input.
    pub async fn send_audio(
        &self,
        session: &SessionId,
        audio: &[u8],
        lang: Option<&str>,
    ) -> Result<Outcome, ClientError> {
        let lang = self.resolve_lang(session, lang);
        self.submit(session, Request::audio(audio, lang)).await
    }

    pub async fn send_audio_file(
        &self,
        session: &SessionId,
        path: &Path,
        lang: Option<&str>,
    ) -> Result<Outcome, ClientError> {
        let audio = tokio::fs::read(path).await?;
        debug!(session_id = %session, path = %path.display(), bytes = audio.len(), "read audio file");
        self.send_audio(session, &audio, lang).await
    }

    /// Transcribe audio without running skills.
    pub async fn get_stt(
        &self,
        session: &SessionId,
        audio: &[u8],
        lang: Option<&str>,
    ) -> Result<Outcome, ClientError> {
        let lang = self.resolve_lang(session, lang);
        self.submit(session, Request::stt(audio, lang)).await
    }

    pub async fn get_tts(
        &self,
        session: &SessionId,
        text: &str,
        lang: Option<&str>,
    ) -> Result<Outcome, ClientError> {
        let lang = self.resolve_lang(session, lang);
        self.submit(session, Request::tts(text, lang)).await
    }

    pub async fn submit(&self, session: &SessionId, request: Request) -> Result<Outcome, ClientError> {
        if self.shutdown.is_cancelled() {
            return Err(ClientError::ShuttingDown);
        }
        let outcome = self.sequencer.submit(session, request).await?;
        debug!(session_id = %session, outcome = outcome.label(), "request finished");
        Ok(outcome)
    }

    pub fn update_profile(&self, session: &SessionId, patch: &Value) -> Result<UserProfile, ClientError> {
        self.sessions.update_profile(session, patch)
    }

    pub fn language_for(&self, session: &SessionId) -> String {
        self.sessions
            .language_for(session, &self.settings.client.default_lang)
    }

    fn resolve_lang(&self, session: &SessionId, lang: Option<&str>) -> String {
        match lang {
            Some(lang) if !lang.is_empty() => lang.to_string(),
            _ => self.language_for(session),
        }
    }

    /// Stop admitting requests, let dispatched ones finish or time out, then
    /// stop the drain task and close the connection.
    pub async fn shutdown(&self) {
        self.sequencer.close().await;
        self.shutdown.cancel();
        let drain = self.drain.lock().take();
        if let Some(drain) = drain {
            if let Err(e) = drain.await {
                warn!(error = %e, "drain task panicked");
            }
        }
        self.supervisor.close().await;
        info!(identity = %self.identity, "client shut down");
    }
}

async fn drain_inbound(
    mut inbound: mpsc::Receiver<Inbound>,
    correlator: Arc<Correlator>,
    supervisor: Arc<ConnectionSupervisor>,
    response_queue: String,
    shutdown: CancellationToken,
) {
    loop {
        let Inbound { queue, delivery } = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = inbound.recv() => match next {
                Some(inbound) => inbound,
                None => break,
            },
        };
        let channel = if queue == response_queue {
            Channel::Response
        } else {
            Channel::Error
        };
        let verdict = correlator.on_delivery(channel, &delivery.body);
        let settled = match verdict.ack {
            Ack::Ack => supervisor.ack(delivery.tag).await,
            Ack::Nack { requeue } => supervisor.nack(delivery.tag, requeue).await,
        };
        if let Err(e) = settled {
            debug!(
                queue = %queue,
                delivery_tag = delivery.tag,
                error = %e,
                "could not settle delivery"
            );
        }
    }
    debug!("inbound drain stopped");
}

