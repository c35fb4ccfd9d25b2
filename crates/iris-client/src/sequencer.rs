//! Per-session request lanes.
//!
//! Each session gets a worker task fed by an unbounded queue. The worker
//! dispatches one request, waits for its outcome or the response timeout,
//! and only then takes the next job. Lanes of different sessions run
//! independently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use iris_core::{RequestId, SessionId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::ClientError;
use crate::request::{Outcome, Request};

/// Where the sequencer hands requests to.
#[async_trait]
pub trait RequestSink: Send + Sync {
    /// Register the pending request and publish it. The receiver resolves
    /// when the matching reply arrives.
    async fn dispatch(
        &self,
        session: &SessionId,
        request_id: &RequestId,
        request: &Request,
        waited: Duration,
    ) -> Result<oneshot::Receiver<Outcome>, ClientError>;

    /// Forget a pending request that timed out.
    fn abandon(&self, session: &SessionId, request_id: &RequestId);
}

struct Job {
    request: Request,
    queued_at: Instant,
    reply: oneshot::Sender<Result<Outcome, ClientError>>,
}

struct Lane {
    tx: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

pub struct Sequencer {
    sink: Arc<dyn RequestSink>,
    timeout: Duration,
    lanes: DashMap<SessionId, Lane>,
    cancel: CancellationToken,
}

impl Sequencer {
    pub fn new(sink: Arc<dyn RequestSink>, timeout: Duration) -> Self {
        Self {
            sink,
            timeout,
            lanes: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn active_lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Queue `request` behind the session's earlier requests and wait for
    /// its outcome.
    pub async fn submit(&self, session: &SessionId, request: Request) -> Result<Outcome, ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::ShuttingDown);
        }
        let (tx, rx) = oneshot::channel();
        let job = Job {
            request,
            queued_at: Instant::now(),
            reply: tx,
        };
        {
            let lane = self
                .lanes
                .entry(session.clone())
                .or_insert_with(|| self.spawn_lane(session));
            lane.tx.send(job).map_err(|_| ClientError::ShuttingDown)?;
        }
        rx.await.unwrap_or(Err(ClientError::ShuttingDown))
    }

    fn spawn_lane(&self, session: &SessionId) -> Lane {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_lane(
            session.clone(),
            self.sink.clone(),
            self.timeout,
            rx,
            self.cancel.clone(),
        ));
        debug!(session_id = %session, "session lane started");
        Lane { tx, worker }
    }

    /// Stop admitting requests and wait for every lane to stop. A request
    /// already dispatched still gets its reply or times out; queued ones
    /// resolve with [`ClientError::ShuttingDown`].
    pub async fn close(&self) {
        self.cancel.cancel();
        let ids: Vec<SessionId> = self.lanes.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, lane)) = self.lanes.remove(&id) {
                drop(lane.tx);
                if let Err(e) = lane.worker.await {
                    warn!(session_id = %id, error = %e, "session lane panicked");
                }
            }
        }
    }
}

async fn run_lane(
    session: SessionId,
    sink: Arc<dyn RequestSink>,
    timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<Job>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let Job {
            request,
            queued_at,
            reply,
        } = job;
        let request_id = RequestId::new();
        let waited = queued_at.elapsed();
        let result = run_job(sink.as_ref(), &session, &request_id, &request, waited, timeout).await;
        let _ = reply.send(result);
    }

    rx.close();
    while let Ok(job) = rx.try_recv() {
        let _ = job.reply.send(Err(ClientError::ShuttingDown));
    }
    debug!(session_id = %session, "session lane stopped");
}

async fn run_job(
    sink: &dyn RequestSink,
    session: &SessionId,
    request_id: &RequestId,
    request: &Request,
    waited: Duration,
    timeout: Duration,
) -> Result<Outcome, ClientError> {
    debug!(
        session_id = %session,
        request_id = %request_id,
        msg_type = request.msg_type(),
        waited_ms = waited.as_millis() as u64,
        "dispatching request"
    );
    let rx = sink.dispatch(session, request_id, request, waited).await?;
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(_)) => {
            warn!(session_id = %session, request_id = %request_id, "pending request dropped");
            Ok(Outcome::TimedOut { after: timeout })
        }
        Err(_) => {
            sink.abandon(session, request_id);
            info!(
                session_id = %session,
                request_id = %request_id,
                request = %request.describe(),
                timeout_ms = timeout.as_millis() as u64,
                "no response"
            );
            Ok(Outcome::TimedOut { after: timeout })
        }
    }
}
