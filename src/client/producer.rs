//! Producer
//!
//! A `Producer` serializes values with its injected codec and publishes them
//! through the broker. Writes go straight into the in-memory log, so `send`
//! completes as soon as the append does and `flush` has nothing to wait for.
//!
//! Only capacity rejections are retried (up to `max_retries`, sleeping
//! `retry_backoff` in between): cleanup may free room in a full queue. All
//! other errors are returned immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::broker::message::{Headers, MessageInput, PublishResult};
use crate::client::serializer::Serializer;
use crate::utils::error::{BrokerError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    pub client_id: String,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client_id: format!("producer-{}", Uuid::new_v4()),
            max_retries: 0,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl ProducerConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    pub fn with_retries(mut self, max_retries: u32, retry_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = retry_backoff;
        self
    }
}

pub struct Producer<T> {
    broker: Arc<Broker>,
    config: ProducerConfig,
    serializer: Arc<dyn Serializer<T>>,
    closed: AtomicBool,
}

impl<T> std::fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("config", &self.config)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<T> Producer<T> {
    pub fn new(
        broker: Arc<Broker>,
        config: ProducerConfig,
        serializer: impl Serializer<T> + 'static,
    ) -> Self {
        Self {
            broker,
            config,
            serializer: Arc::new(serializer),
            closed: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Publish `value` to `category`. A closed producer fails the returned
    /// future.
    pub async fn send(
        &self,
        category: &str,
        key: Option<&str>,
        value: &T,
        headers: Option<Headers>,
    ) -> Result<PublishResult> {
        if self.is_closed() {
            return Err(BrokerError::ProducerClosed(self.config.client_id.clone()));
        }

        let payload = self.serializer.serialize(value)?;
        let input = MessageInput {
            category: category.to_string(),
            key: key.map(str::to_string),
            headers: headers.unwrap_or_default(),
        };

        let mut attempt = 0;
        loop {
            match self.broker.publish(payload.clone(), input.clone()) {
                Ok(result) => {
                    debug!(
                        producer = %self.config.client_id,
                        category,
                        queue = result.queue,
                        offset = result.offset,
                        "message sent"
                    );
                    return Ok(result);
                }
                Err(e) if e.is_retriable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        producer = %self.config.client_id,
                        category,
                        attempt,
                        "send rejected, retrying: {e}"
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Nothing is buffered: every `send` has already reached the log.
    pub async fn flush(&self) -> Result<()> {
        Ok(())
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(producer = %self.config.client_id, "producer closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
