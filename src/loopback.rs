//! In-process broker plus echo service for trying the client offline.

use std::sync::Arc;

use iris_broker::{BrokerAdapter, MemoryBroker};
use iris_client::{ClientError, EchoResponder, IrisSettings};
use tracing::info;

pub struct Loopback {
    pub adapter: Arc<dyn BrokerAdapter>,
    responder: EchoResponder,
}

impl Loopback {
    pub async fn start(settings: &IrisSettings) -> Result<Self, ClientError> {
        let broker = MemoryBroker::new();
        let adapter: Arc<dyn BrokerAdapter> = Arc::new(broker);
        let responder = EchoResponder::start(
            adapter.clone(),
            &settings.mq.broker_config(),
            &settings.mq.request_queue,
        )
        .await?;
        info!(queue = %settings.mq.request_queue, "loopback responder running");
        Ok(Self { adapter, responder })
    }

    pub async fn stop(self) {
        self.responder.stop().await;
    }
}
