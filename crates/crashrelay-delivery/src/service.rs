//! Delivery path
//!
//! Every envelope is sent immediately when possible. Failures are split in
//! two: drop-class outcomes (rate limited, disabled, rejected) discard the
//! envelope, the rest put it in the offline queue. A background flush drains
//! the queue while sends succeed and stops at the first failure.

use std::sync::Arc;
use std::time::Duration;

use crashrelay_core::domain::Envelope;
use crashrelay_core::ports::IEnvelopeTransport;
use crashrelay_store::OfflineQueue;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rate_limit::RateLimits;
use crate::DeliveryError;

pub struct DeliveryService {
    transport: Option<Arc<dyn IEnvelopeTransport>>,
    queue: Arc<OfflineQueue>,
    limits: RateLimits,
    /// Serializes queue drains
    flushing: Mutex<()>,
}

impl DeliveryService {
    /// `transport` is `None` when delivery is disabled
    pub fn new(transport: Option<Arc<dyn IEnvelopeTransport>>, queue: Arc<OfflineQueue>) -> Self {
        Self {
            transport,
            queue,
            limits: RateLimits::new(),
            flushing: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn rate_limits(&self) -> &RateLimits {
        &self.limits
    }

    /// One send attempt, without touching the queue
    pub async fn try_send(&self, envelope: &Envelope) -> Result<(), DeliveryError> {
        let Some(transport) = &self.transport else {
            return Err(DeliveryError::Disabled);
        };

        let categories = envelope.categories();
        if let Some(retry_after) = self.limits.all_limited(&categories) {
            return Err(DeliveryError::RateLimited {
                categories,
                retry_after,
            });
        }

        let body = envelope.to_bytes()?;
        let response = transport
            .send(body)
            .await
            .map_err(|e| DeliveryError::Network(format!("{e:#}")))?;
        self.limits.update(&response);

        match response.status {
            s if (200..300).contains(&s) => Ok(()),
            429 => {
                let retry_after = self
                    .limits
                    .all_limited(&categories)
                    .unwrap_or(crate::rate_limit::DEFAULT_RETRY_AFTER);
                Err(DeliveryError::RateLimited {
                    categories,
                    retry_after,
                })
            }
            s if s >= 500 => Err(DeliveryError::Server(s)),
            s => Err(DeliveryError::Rejected(s)),
        }
    }

    /// Sends now, or queues the envelope when the failure is retryable
    pub async fn send(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        match self.try_send(&envelope).await {
            Ok(()) => {
                debug!(event_id = ?envelope.header.event_id, "Envelope delivered");
                Ok(())
            }
            Err(e) if e.should_queue() => {
                warn!(error = %e, "Delivery failed, queueing envelope");
                self.queue.insert(&envelope).await;
                Err(e)
            }
            Err(e) => {
                debug!(error = %e, "Envelope dropped");
                Err(e)
            }
        }
    }

    /// Drains the queue until it is empty or a retryable failure occurs.
    ///
    /// The envelope that failed goes back to the head of the queue. Returns
    /// the number of envelopes delivered.
    pub async fn flush_queue(&self) -> usize {
        if self.transport.is_none() {
            return 0;
        }
        let _guard = self.flushing.lock().await;

        let mut delivered = 0;
        while let Some(envelope) = self.queue.pop().await {
            match self.try_send(&envelope).await {
                Ok(()) => delivered += 1,
                Err(e) if e.should_queue() => {
                    debug!(error = %e, "Queue flush stopped");
                    self.queue.unshift(&envelope).await;
                    break;
                }
                Err(e) => debug!(error = %e, "Queued envelope dropped"),
            }
        }

        if delivered > 0 {
            info!(delivered, "Flushed offline queue");
        }
        delivered
    }

    /// Flushes at startup, then every `interval` until cancelled
    pub async fn run_flush_loop(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_queue().await;
                }
                _ = shutdown.cancelled() => {
                    debug!("Queue flush loop stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use crashrelay_core::ports::TransportResponse;
    use crashrelay_store::QueueLimits;
    use serde_json::json;

    use super::*;

    /// Scripted transport: pops one outcome per send, succeeding once empty
    #[derive(Default)]
    pub(crate) struct FakeTransport {
        pub outcomes: StdMutex<VecDeque<Option<TransportResponse>>>,
        pub sent: StdMutex<Vec<Envelope>>,
    }

    impl FakeTransport {
        pub(crate) fn scripted(outcomes: Vec<Option<TransportResponse>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: StdMutex::new(outcomes.into()),
                sent: StdMutex::default(),
            })
        }

        pub(crate) fn sent(&self) -> Vec<Envelope> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl IEnvelopeTransport for FakeTransport {
        async fn send(&self, body: Vec<u8>) -> anyhow::Result<TransportResponse> {
            let outcome = self.outcomes.lock().unwrap().pop_front();
            match outcome {
                Some(None) => anyhow::bail!("connection refused"),
                Some(Some(response)) => {
                    if response.is_success() {
                        self.sent.lock().unwrap().push(Envelope::parse(&body)?);
                    }
                    Ok(response)
                }
                None => {
                    self.sent.lock().unwrap().push(Envelope::parse(&body)?);
                    Ok(TransportResponse::ok())
                }
            }
        }
    }

    fn status(code: u16) -> Option<TransportResponse> {
        Some(TransportResponse {
            status: code,
            ..TransportResponse::default()
        })
    }

    fn event(message: &str) -> Envelope {
        Envelope::from_event(json!({"message": message}), &[])
    }

    fn service(dir: &std::path::Path, transport: Arc<FakeTransport>) -> DeliveryService {
        let queue = Arc::new(OfflineQueue::new(dir, QueueLimits::default()));
        DeliveryService::new(Some(transport), queue)
    }

    #[tokio::test]
    async fn test_network_failure_queues() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::scripted(vec![None]);
        let service = service(dir.path(), transport.clone());

        let err = service.send(event("a")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Network(_)));
        assert_eq!(service.queue().len().await, 1);
    }

    #[tokio::test]
    async fn test_server_error_queues_and_client_error_drops() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::scripted(vec![status(503), status(400)]);
        let service = service(dir.path(), transport);

        assert!(matches!(service.send(event("a")).await, Err(DeliveryError::Server(503))));
        assert!(matches!(service.send(event("b")).await, Err(DeliveryError::Rejected(400))));
        assert_eq!(service.queue().len().await, 1);
    }

    #[tokio::test]
    async fn test_rate_limited_dropped_and_later_sends_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::scripted(vec![Some(TransportResponse {
            status: 429,
            rate_limits: Some("60:error:organization".into()),
            retry_after: None,
        })]);
        let service = service(dir.path(), transport.clone());

        assert!(matches!(
            service.send(event("a")).await,
            Err(DeliveryError::RateLimited { .. })
        ));
        // limited locally, never reaches the transport
        assert!(matches!(
            service.send(event("b")).await,
            Err(DeliveryError::RateLimited { .. })
        ));
        assert!(transport.outcomes.lock().unwrap().is_empty());
        assert!(transport.sent().is_empty());
        assert!(service.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_disabled_drops() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(OfflineQueue::new(dir.path(), QueueLimits::default()));
        let service = DeliveryService::new(None, queue);

        assert!(matches!(service.send(event("a")).await, Err(DeliveryError::Disabled)));
        assert!(service.queue().is_empty().await);
        assert_eq!(service.flush_queue().await, 0);
    }

    #[tokio::test]
    async fn test_flush_stops_on_first_failure_and_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::scripted(vec![None, None, None, None, status(200), None]);
        let service = service(dir.path(), transport.clone());

        for m in ["a", "b", "c"] {
            let _ = service.send(event(m)).await;
        }
        assert_eq!(service.queue().len().await, 3);

        // first queued envelope fails again
        assert_eq!(service.flush_queue().await, 0);
        assert_eq!(service.queue().len().await, 3);

        // "a" succeeds, "b" fails
        assert_eq!(service.flush_queue().await, 1);
        assert_eq!(service.queue().len().await, 2);

        // script exhausted: everything else succeeds, in order
        assert_eq!(service.flush_queue().await, 2);
        let messages: Vec<_> = transport
            .sent()
            .iter()
            .map(|e| e.items[0].payload_json().unwrap()["message"].clone())
            .collect();
        assert_eq!(messages, vec![json!("a"), json!("b"), json!("c")]);
    }
}
