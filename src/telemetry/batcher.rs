//! Batching queue in front of the logging endpoint.
//!
//! Events accumulate in a FIFO queue. A flush swaps the whole queue out
//! under the lock and delivers it on a spawned task, so concurrent flushes
//! never send the same event twice. A failed delivery puts its batch back
//! at the front, ahead of anything logged while it was in flight.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::event::{
    BatchMeta, LogBatch, LogEvent, LogType, Severity, generate_session_id, hash_user_agent,
    rfc3339, sanitize_data, sanitize_url,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{TelemetryConfig, parse_duration};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint answered {0}")]
    Status(u16),
}

/// Delivery seam between the batcher and the logging endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one batch, reporting failure so the batch can be re-queued.
    async fn send(&self, batch: &LogBatch) -> Result<(), TransportError>;

    /// Fire-and-forget delivery used on unload. Never retried.
    fn beacon(&self, batch: LogBatch);
}

/// Posts batches as JSON with `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    async fn post(
        client: &reqwest::Client,
        endpoint: &str,
        batch: &LogBatch,
    ) -> Result<(), TransportError> {
        let response = client
            .post(endpoint)
            .header("X-Requested-With", "XMLHttpRequest")
            .json(batch)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &LogBatch) -> Result<(), TransportError> {
        Self::post(&self.client, &self.endpoint, batch).await
    }

    fn beacon(&self, batch: LogBatch) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime for beacon, dropping {} events", batch.logs.len());
            return;
        };
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        handle.spawn(async move {
            if let Err(e) = Self::post(&client, &endpoint, &batch).await {
                debug!("Beacon delivery failed: {}", e);
            }
        });
    }
}

/// [`TelemetryConfig`] with durations resolved.
#[derive(Debug, Clone)]
pub struct BatcherSettings {
    pub max_queue: usize,
    pub flush_interval: Duration,
}

impl BatcherSettings {
    pub fn from_config(config: &TelemetryConfig) -> anyhow::Result<Self> {
        Ok(Self {
            max_queue: config.max_queue.max(1),
            flush_interval: parse_duration(&config.flush_interval)?,
        })
    }
}

impl Default for BatcherSettings {
    fn default() -> Self {
        Self {
            max_queue: 50,
            flush_interval: Duration::from_secs(30),
        }
    }
}

struct Inner {
    queue: Mutex<VecDeque<LogEvent>>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    max_queue: usize,
    session_id: String,
    page_url: Option<String>,
    user_agent: Option<String>,
    page_load_time: i64,
    unloaded: AtomicBool,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<LogEvent>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_all(&self) -> Vec<LogEvent> {
        self.lock().drain(..).collect()
    }

    /// Drop the oldest events beyond `max_queue`. Returns how many went.
    fn trim_to_capacity(&self) -> usize {
        let mut queue = self.lock();
        let excess = queue.len().saturating_sub(self.max_queue);
        queue.drain(..excess);
        excess
    }

    fn requeue_front(&self, batch: Vec<LogEvent>) {
        let mut queue = self.lock();
        for event in batch.into_iter().rev() {
            queue.push_front(event);
        }
    }

    fn meta(&self, reason: Option<&str>) -> BatchMeta {
        BatchMeta {
            timestamp: rfc3339(self.clock.now()),
            session_id: self.session_id.clone(),
            page_load_time: Some(self.page_load_time),
            reason: reason.map(|r| r.to_string()),
        }
    }

    async fn deliver(&self, logs: Vec<LogEvent>) -> Result<usize, TransportError> {
        let count = logs.len();
        let batch = LogBatch {
            logs,
            meta: self.meta(None),
        };

        match self.transport.send(&batch).await {
            Ok(()) => {
                debug!("Delivered {} telemetry events", count);
                Ok(count)
            }
            Err(e) => {
                warn!("Telemetry delivery failed, re-queueing {} events: {}", count, e);
                self.requeue_front(batch.logs);
                Err(e)
            }
        }
    }
}

/// Client-side event queue. Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct EventBatcher {
    inner: Arc<Inner>,
}

impl EventBatcher {
    pub fn new(transport: Arc<dyn Transport>, settings: &BatcherSettings) -> Self {
        Self::with_clock(transport, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        transport: Arc<dyn Transport>,
        settings: &BatcherSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let page_load_time = clock.now().timestamp_millis();
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(settings.max_queue)),
                transport,
                clock,
                max_queue: settings.max_queue.max(1),
                session_id: generate_session_id(),
                page_url: None,
                user_agent: None,
                page_load_time,
                unloaded: AtomicBool::new(false),
            }),
        }
    }

    /// Attach the page URL and user agent reported with every event.
    ///
    /// Only valid before the batcher is shared.
    pub fn with_page(mut self, page_url: Option<&str>, user_agent: Option<&str>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.page_url = sanitize_url(page_url);
            inner.user_agent = user_agent.map(hash_user_agent);
        }
        self
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Snapshot of the queued events, oldest first.
    pub fn queued(&self) -> Vec<LogEvent> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Queue an event. Never blocks on the network and never fails.
    ///
    /// A `High`/`Critical` severity or a full queue starts a flush.
    pub fn log_event(&self, log_type: LogType, event: &str, data: &Value, severity: Severity) {
        let inner = &self.inner;
        let entry = LogEvent {
            log_type,
            event: event.to_string(),
            data: sanitize_data(data),
            severity,
            timestamp: rfc3339(inner.clock.now()),
            session_id: inner.session_id.clone(),
            url: inner.page_url.clone(),
            user_agent: inner.user_agent.clone(),
            event_id: uuid::Uuid::new_v4().to_string(),
        };

        let full = {
            let mut queue = inner.lock();
            queue.push_back(entry);
            queue.len() >= inner.max_queue
        };

        if severity.flushes_immediately() || full {
            self.trigger_flush();
        }
    }

    pub fn log_security_event(&self, event: &str, data: &Value, severity: Severity) {
        self.log_event(LogType::Security, event, data, severity);
    }

    /// Swap the queue out now and deliver it in the background.
    ///
    /// Without a runtime the queue is kept for the next flush, capped at
    /// `max_queue` by dropping the oldest events.
    pub fn trigger_flush(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            let dropped = self.inner.trim_to_capacity();
            if dropped > 0 {
                warn!(dropped, "No runtime, dropped oldest telemetry events");
            } else {
                debug!("No runtime, deferring telemetry flush");
            }
            return;
        };

        let batch = self.inner.take_all();
        if batch.is_empty() {
            return;
        }

        let inner = self.inner.clone();
        handle.spawn(async move {
            let _ = inner.deliver(batch).await;
        });
    }

    /// Swap the queue out and deliver it, waiting for the outcome.
    ///
    /// Returns the number of events delivered. On failure the batch is
    /// back at the front of the queue.
    pub async fn flush(&self) -> Result<usize, TransportError> {
        let batch = self.inner.take_all();
        if batch.is_empty() {
            return Ok(0);
        }
        self.inner.deliver(batch).await
    }

    /// Hand whatever is queued to the transport's beacon. At most once.
    pub fn unload(&self) {
        if self.inner.unloaded.swap(true, Ordering::SeqCst) {
            return;
        }

        let logs = self.inner.take_all();
        if logs.is_empty() {
            return;
        }

        self.inner.transport.beacon(LogBatch {
            logs,
            meta: self.inner.meta(Some("page_unload")),
        });
    }

    /// Flush every `interval` until the batcher is dropped.
    pub fn start_auto_flush(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let batch = inner.take_all();
                if !batch.is_empty() {
                    let _ = inner.deliver(batch).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::{Notify, mpsc};

    fn settings(max_queue: usize) -> BatcherSettings {
        BatcherSettings {
            max_queue,
            flush_interval: Duration::from_secs(30),
        }
    }

    fn events(batcher: &EventBatcher) -> Vec<String> {
        batcher.queued().into_iter().map(|e| e.event).collect()
    }

    /// Records every batch and fails while `fail` is set.
    struct RecordingTransport {
        sent: mpsc::UnboundedSender<LogBatch>,
        beacons: Mutex<Vec<LogBatch>>,
        fail: AtomicBool,
    }

    impl RecordingTransport {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LogBatch>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Arc::new(Self {
                sent: tx,
                beacons: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            });
            (transport, rx)
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, batch: &LogBatch) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Status(503));
            }
            let _ = self.sent.send(batch.clone());
            Ok(())
        }

        fn beacon(&self, batch: LogBatch) {
            self.beacons.lock().unwrap().push(batch);
        }
    }

    /// Holds every send until released, then fails it.
    struct GatedTransport {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn send(&self, _batch: &LogBatch) -> Result<(), TransportError> {
            self.entered.notify_one();
            self.release.notified().await;
            Err(TransportError::Status(500))
        }

        fn beacon(&self, _batch: LogBatch) {}
    }

    #[tokio::test]
    async fn full_queue_flushes_and_never_exceeds_max() {
        let (transport, mut rx) = RecordingTransport::new();
        let batcher = EventBatcher::new(transport, &settings(5));

        for i in 0..4 {
            batcher.log_event(LogType::Event, &format!("e{}", i), &json!({}), Severity::Low);
            assert!(batcher.queue_len() <= 5);
        }
        assert_eq!(batcher.queue_len(), 4);

        batcher.log_event(LogType::Event, "e4", &json!({}), Severity::Low);
        assert_eq!(batcher.queue_len(), 0);

        let batch = rx.recv().await.unwrap();
        let names: Vec<_> = batch.logs.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, ["e0", "e1", "e2", "e3", "e4"]);
        assert_eq!(batch.meta.session_id, batcher.session_id());
        assert!(batch.meta.reason.is_none());
    }

    #[tokio::test]
    async fn high_severity_flushes_immediately() {
        let (transport, mut rx) = RecordingTransport::new();
        let batcher = EventBatcher::new(transport, &settings(50));

        batcher.log_event(LogType::Event, "page_view", &json!({}), Severity::Low);
        batcher.log_security_event("script_injection_attempt", &json!({"src": "x"}), Severity::High);
        assert_eq!(batcher.queue_len(), 0);

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.logs.len(), 2);
        assert_eq!(batch.logs[1].severity, Severity::High);
    }

    #[tokio::test]
    async fn flush_empties_queue() {
        let (transport, mut rx) = RecordingTransport::new();
        let batcher = EventBatcher::new(transport, &settings(50));

        batcher.log_event(LogType::Performance, "page_performance", &json!({"duration": 12}), Severity::Low);
        batcher.log_event(LogType::Error, "javascript_error", &json!({"message": "x"}), Severity::Medium);

        assert_eq!(batcher.flush().await.unwrap(), 2);
        assert_eq!(batcher.queue_len(), 0);
        assert_eq!(rx.recv().await.unwrap().logs.len(), 2);

        // Nothing queued, nothing sent
        assert_eq!(batcher.flush().await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_flush_requeues_in_order() {
        let (transport, _rx) = RecordingTransport::new();
        transport.fail.store(true, Ordering::SeqCst);
        let batcher = EventBatcher::new(transport.clone(), &settings(50));

        batcher.log_event(LogType::Event, "a", &json!({}), Severity::Low);
        batcher.log_event(LogType::Event, "b", &json!({}), Severity::Low);

        assert!(batcher.flush().await.is_err());
        assert_eq!(events(&batcher), ["a", "b"]);
    }

    #[tokio::test]
    async fn events_logged_during_failed_send_stay_behind_batch() {
        let transport = Arc::new(GatedTransport {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let batcher = EventBatcher::new(transport.clone(), &settings(50));

        batcher.log_event(LogType::Event, "a", &json!({}), Severity::Low);
        batcher.log_event(LogType::Event, "b", &json!({}), Severity::Low);

        let flushing = {
            let batcher = batcher.clone();
            tokio::spawn(async move { batcher.flush().await })
        };
        transport.entered.notified().await;

        // In flight: the queue was swapped out
        assert_eq!(batcher.queue_len(), 0);
        batcher.log_event(LogType::Event, "c", &json!({}), Severity::Low);

        transport.release.notify_one();
        assert!(flushing.await.unwrap().is_err());

        let queued = batcher.queued();
        assert_eq!(
            queued.iter().map(|e| e.event.as_str()).collect::<Vec<_>>(),
            ["a", "b", "c"]
        );
        // No duplicates
        let mut ids: Vec<_> = queued.iter().map(|e| e.event_id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn unload_uses_beacon_once_and_never_requeues() {
        let (transport, mut rx) = RecordingTransport::new();
        let batcher = EventBatcher::new(transport.clone(), &settings(50));

        batcher.log_event(LogType::Event, "a", &json!({}), Severity::Low);
        batcher.unload();
        batcher.unload();

        assert_eq!(batcher.queue_len(), 0);
        let beacons = transport.beacons.lock().unwrap();
        assert_eq!(beacons.len(), 1);
        assert_eq!(beacons[0].logs.len(), 1);
        assert_eq!(beacons[0].meta.reason.as_deref(), Some("page_unload"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unload_with_empty_queue_sends_nothing() {
        let (transport, _rx) = RecordingTransport::new();
        let batcher = EventBatcher::new(transport.clone(), &settings(50));
        batcher.unload();
        assert!(transport.beacons.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_carry_sanitized_context() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .times(1)
            .withf(|batch: &LogBatch| {
                let e = &batch.logs[0];
                e.url.as_deref() == Some("https://example.com/pricing")
                    && e.user_agent.as_ref().is_some_and(|ua| ua.len() == 20)
                    && e.data["note"].as_str().is_some_and(|n| n.len() == 500)
                    && e.session_id.len() == 32
            })
            .returning(|_| Ok(()));

        let batcher = EventBatcher::new(Arc::new(mock), &settings(50)).with_page(
            Some("https://example.com/pricing?utm_source=ad"),
            Some("Mozilla/5.0"),
        );
        batcher.log_event(LogType::Event, "cta_click", &json!({"note": "n".repeat(800)}), Severity::Low);

        assert_eq!(batcher.flush().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn without_transport_success_nothing_is_lost() {
        let mut mock = MockTransport::new();
        mock.expect_send()
            .times(2)
            .returning(|_| Err(TransportError::Status(502)));

        let batcher = EventBatcher::new(Arc::new(mock), &settings(50));
        batcher.log_event(LogType::Event, "a", &json!({}), Severity::Low);

        assert!(batcher.flush().await.is_err());
        assert!(batcher.flush().await.is_err());
        assert_eq!(batcher.queue_len(), 1);
    }

    #[tokio::test]
    async fn auto_flush_runs_on_interval() {
        let (transport, mut rx) = RecordingTransport::new();
        let batcher = EventBatcher::new(transport, &settings(50));
        let handle = batcher.start_auto_flush(Duration::from_millis(50));

        batcher.log_event(LogType::Event, "tick", &json!({}), Severity::Low);

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.logs[0].event, "tick");
        assert_eq!(batcher.queue_len(), 0);
        handle.abort();
    }

    #[test]
    fn no_runtime_defers_flush() {
        let (transport, _rx) = RecordingTransport::new();
        let batcher = EventBatcher::new(transport, &settings(2));

        batcher.log_event(LogType::Event, "a", &json!({}), Severity::Low);
        batcher.log_event(LogType::Event, "b", &json!({}), Severity::Low);
        assert_eq!(batcher.queue_len(), 2);

        for name in ["c", "d", "e"] {
            batcher.log_event(LogType::Event, name, &json!({}), Severity::Low);
            assert_eq!(batcher.queue_len(), 2);
        }
        let kept: Vec<String> = batcher.queued().into_iter().map(|e| e.event).collect();
        assert_eq!(kept, ["d", "e"]);
    }

    #[test]
    fn settings_from_config() {
        let settings = BatcherSettings::from_config(&TelemetryConfig::default()).unwrap();
        assert_eq!(settings.max_queue, 50);
        assert_eq!(settings.flush_interval, Duration::from_secs(30));
    }
}
