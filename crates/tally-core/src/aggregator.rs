//! Periodic window flush.
//!
//! The [`Aggregator`] wakes once per flush interval and runs one cycle:
//!
//! 1. Read the distinct count and the registered endpoints from the store
//! 2. Publish the count downstream, or log it when no queue is connected
//! 3. Notify every registered endpoint of the count
//! 4. Clear the window
//!
//! Publish and notify failures are logged and never stop the clear. A
//! failure of the whole cycle is logged by [`Aggregator::run`] and the loop
//! carries on with the next tick.
//!
//! # Flush modes
//!
//! With [`FlushMode::ReadThenClear`] the read (step 1) and the clear
//! (step 4) are separate store calls. Any id added between them is deleted
//! without ever being counted. [`FlushMode::Atomic`] reads and deletes in
//! one store transaction instead, so late writes land in the next window.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::notifier::Notifier;
use crate::publisher::CountPublisher;
use crate::store::{WindowSnapshot, WindowStore};
use crate::{Error, Result};

/// Default flush interval: one minute.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// How a cycle reads and clears the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlushMode {
    /// Separate read and clear calls; writes in between are dropped.
    #[default]
    ReadThenClear,
    /// Read and clear in one transaction.
    Atomic,
}

impl FromStr for FlushMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read-then-clear" => Ok(Self::ReadThenClear),
            "atomic" => Ok(Self::Atomic),
            other => Err(Error::Config(format!("unknown flush mode '{other}'"))),
        }
    }
}

impl fmt::Display for FlushMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadThenClear => f.write_str("read-then-clear"),
            Self::Atomic => f.write_str("atomic"),
        }
    }
}

/// Aggregator settings.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Time between flushes.
    pub flush_interval: Duration,

    /// How the window is read and cleared.
    pub flush_mode: FlushMode,

    /// Clear the window even when reading it failed.
    ///
    /// Off by default: ids that could not be read stay in the store and are
    /// counted with the next window.
    pub clear_on_read_failure: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_mode: FlushMode::default(),
            clear_on_read_failure: false,
        }
    }
}

/// Where a cycle's count ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    /// Delivered to the queue.
    Published,
    /// No queue connected; written to the log.
    Logged,
    /// A queue is connected but the publish failed.
    PublishFailed,
}

impl Sink {
    fn label(self) -> &'static str {
        match self {
            Self::Published => "queue",
            Self::Logged => "log",
            Self::PublishFailed => "failed",
        }
    }
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Distinct ids in the flushed window.
    pub count: u64,
    /// Where the count was sent.
    pub sink: Sink,
    /// Endpoints notified successfully.
    pub notified: usize,
    /// Endpoints whose notification failed.
    pub failed_endpoints: Vec<String>,
    /// Whether the window was cleared.
    pub cleared: bool,
}

/// Flushes the current window on a fixed interval.
pub struct Aggregator {
    store: Arc<dyn WindowStore>,
    publisher: Option<Arc<dyn CountPublisher>>,
    notifier: Notifier,
    config: AggregatorConfig,
}

impl Aggregator {
    /// Create an aggregator. `publisher` is `None` when no queue is connected.
    pub fn new(
        store: Arc<dyn WindowStore>,
        publisher: Option<Arc<dyn CountPublisher>>,
        notifier: Notifier,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            notifier,
            config,
        }
    }

    /// Run a single flush cycle.
    ///
    /// Returns an error only when the window could not be read. Whether the
    /// window is cleared in that case follows
    /// [`AggregatorConfig::clear_on_read_failure`].
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let snapshot = match self.read_window().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if self.config.clear_on_read_failure {
                    tracing::warn!("window read failed, clearing anyway");
                    self.clear().await;
                }
                return Err(e);
            }
        };

        let count = snapshot.count;
        metrics::gauge!("aggregator_last_count").set(count as f64);

        let sink = self.emit(count).await;

        let deliveries = self.notifier.notify(&snapshot.endpoints, count).await;
        let notified = deliveries.iter().filter(|d| d.is_success()).count();
        let failed_endpoints: Vec<String> = deliveries
            .into_iter()
            .filter(|d| !d.is_success())
            .map(|d| d.url)
            .collect();

        let cleared = match self.config.flush_mode {
            FlushMode::ReadThenClear => self.clear().await,
            FlushMode::Atomic => true,
        };

        Ok(CycleReport {
            count,
            sink,
            notified,
            failed_endpoints,
            cleared,
        })
    }

    async fn read_window(&self) -> Result<WindowSnapshot> {
        match self.config.flush_mode {
            FlushMode::ReadThenClear => {
                let count = self.store.count_identifiers().await?;
                let endpoints = self.store.list_endpoints().await?;
                Ok(WindowSnapshot { count, endpoints })
            }
            FlushMode::Atomic => self.store.take_window().await,
        }
    }

    /// Send the count to the queue, or to the log when there is none.
    async fn emit(&self, count: u64) -> Sink {
        let sink = match &self.publisher {
            Some(publisher) => match publisher.publish(count.to_string().as_bytes()).await {
                Ok(()) => Sink::Published,
                Err(e) => {
                    tracing::error!(count, error = %e, "failed to publish count");
                    Sink::PublishFailed
                }
            },
            None => {
                tracing::info!(count, "Unique ID count for the last minute: {}", count);
                Sink::Logged
            }
        };
        metrics::counter!("publish_total", "sink" => sink.label()).increment(1);
        sink
    }

    async fn clear(&self) -> bool {
        match self.store.clear_window().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "failed to clear window");
                false
            }
        }
    }

    /// Flush once per interval until `shutdown` is set to `true`.
    ///
    /// The loop sleeps a full interval after each cycle finishes, so a slow
    /// cycle pushes later flushes back rather than shortening the next gap.
    /// Cycle errors are logged and never end the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.config.flush_interval.as_secs(),
            mode = %self.config.flush_mode,
            queue = self.publisher.is_some(),
            "aggregator started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.flush_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            metrics::counter!("aggregator_cycles_total").increment(1);
            match self.run_cycle().await {
                Ok(report) => tracing::debug!(?report, "aggregation cycle complete"),
                Err(e) => {
                    metrics::counter!("aggregator_cycle_errors_total").increment(1);
                    tracing::error!(error = %e, "Error in interval of aggregator run");
                }
            }
        }

        tracing::info!("aggregator stopped");
    }

    /// Run the loop on a background task.
    pub fn spawn(self: Arc<Self>) -> AggregatorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        AggregatorHandle { shutdown_tx, task }
    }
}

/// Handle to a spawned aggregator loop.
pub struct AggregatorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AggregatorHandle {
    /// Signal the loop to stop and wait for it. An in-flight cycle finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "aggregator task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::DEFAULT_TIMEOUT;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Publisher that records bodies and can misbehave on request.
    #[derive(Default)]
    struct RecordingPublisher {
        messages: Mutex<Vec<String>>,
        fail: bool,
        /// Id written to this store during publish, i.e. after the read and
        /// before the clear.
        late_writer: Option<(Arc<MemoryStore>, i64)>,
        /// Time each publish takes after the body is recorded.
        delay: Option<Duration>,
    }

    #[async_trait]
    impl CountPublisher for RecordingPublisher {
        async fn publish(&self, message: &[u8]) -> Result<()> {
            if let Some((store, id)) = &self.late_writer {
                store.add_identifier(*id).await?;
            }
            if self.fail {
                return Err(Error::QueueUnavailable("simulated broker outage".to_string()));
            }
            self.messages
                .lock()
                .push(String::from_utf8_lossy(message).into_owned());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }
    }

    fn aggregator(
        store: &Arc<MemoryStore>,
        publisher: Option<Arc<RecordingPublisher>>,
        config: AggregatorConfig,
    ) -> Aggregator {
        Aggregator::new(
            store.clone(),
            publisher.map(|p| p as Arc<dyn CountPublisher>),
            Notifier::new(DEFAULT_TIMEOUT).unwrap(),
            config,
        )
    }

    // =========================================================================
    // Single cycles
    // =========================================================================

    #[tokio::test]
    async fn test_cycle_publishes_distinct_count_and_clears() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let agg = aggregator(&store, Some(publisher.clone()), AggregatorConfig::default());

        for id in [42, 42, 42, 1, 2] {
            store.add_identifier(id).await.unwrap();
        }

        let report = agg.run_cycle().await.unwrap();
        assert_eq!(report.count, 3);
        assert_eq!(report.sink, Sink::Published);
        assert!(report.cleared);
        assert_eq!(publisher.messages.lock().as_slice(), &["3".to_string()]);
        assert_eq!(store.count_identifiers().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consecutive_windows_counted_independently() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let agg = aggregator(&store, Some(publisher.clone()), AggregatorConfig::default());

        for id in [1, 2, 3] {
            store.add_identifier(id).await.unwrap();
        }
        agg.run_cycle().await.unwrap();

        for id in [1, 2] {
            store.add_identifier(id).await.unwrap();
        }
        agg.run_cycle().await.unwrap();

        assert_eq!(
            publisher.messages.lock().as_slice(),
            &["3".to_string(), "2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_no_publisher_logs_every_cycle() {
        let store = Arc::new(MemoryStore::new());
        let agg = aggregator(&store, None, AggregatorConfig::default());

        for round in 0..3 {
            store.add_identifier(round).await.unwrap();
            let report = agg.run_cycle().await.unwrap();
            assert_eq!(report.sink, Sink::Logged);
            assert_eq!(report.count, 1);
        }
    }

    #[tokio::test]
    async fn test_empty_window_still_emits_zero() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let agg = aggregator(&store, Some(publisher.clone()), AggregatorConfig::default());

        let report = agg.run_cycle().await.unwrap();
        assert_eq!(report.count, 0);
        assert_eq!(publisher.messages.lock().as_slice(), &["0".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_and_notify_failures_still_clear() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher {
            fail: true,
            ..Default::default()
        });
        let agg = aggregator(&store, Some(publisher), AggregatorConfig::default());

        store.add_identifier(1).await.unwrap();
        store
            .add_endpoint("http://127.0.0.1:1/unreachable")
            .await
            .unwrap();

        let report = agg.run_cycle().await.unwrap();
        assert_eq!(report.sink, Sink::PublishFailed);
        assert_eq!(report.notified, 0);
        assert_eq!(
            report.failed_endpoints,
            vec!["http://127.0.0.1:1/unreachable".to_string()]
        );
        assert!(report.cleared);
        assert_eq!(store.count_identifiers().await.unwrap(), 0);
        assert!(store.list_endpoints().await.unwrap().is_empty());
    }

    // =========================================================================
    // Read failure policy
    // =========================================================================

    #[tokio::test]
    async fn test_read_failure_keeps_window_by_default() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let agg = aggregator(&store, Some(publisher.clone()), AggregatorConfig::default());

        store.add_identifier(9).await.unwrap();
        store.set_unavailable(true);
        assert!(matches!(
            agg.run_cycle().await,
            Err(Error::StoreUnavailable(_))
        ));

        store.set_unavailable(false);
        assert_eq!(store.count_identifiers().await.unwrap(), 1);
        assert!(publisher.messages.lock().is_empty());

        // The unread id is flushed with the next window.
        let report = agg.run_cycle().await.unwrap();
        assert_eq!(report.count, 1);
    }

    /// Store whose reads fail while writes and clears succeed.
    #[derive(Default)]
    struct UnreadableStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl WindowStore for UnreadableStore {
        async fn add_identifier(&self, id: i64) -> Result<()> {
            self.inner.add_identifier(id).await
        }
        async fn add_endpoint(&self, url: &str) -> Result<()> {
            self.inner.add_endpoint(url).await
        }
        async fn count_identifiers(&self) -> Result<u64> {
            Err(Error::StoreUnavailable("read timed out".to_string()))
        }
        async fn list_endpoints(&self) -> Result<Vec<String>> {
            self.inner.list_endpoints().await
        }
        async fn clear_window(&self) -> Result<()> {
            self.inner.clear_window().await
        }
        async fn take_window(&self) -> Result<WindowSnapshot> {
            Err(Error::StoreUnavailable("read timed out".to_string()))
        }
    }

    #[tokio::test]
    async fn test_read_failure_clears_when_configured() {
        let store = Arc::new(UnreadableStore::default());
        store.add_identifier(9).await.unwrap();
        store.add_endpoint("http://a.example").await.unwrap();

        let agg = Aggregator::new(
            store.clone(),
            None,
            Notifier::new(DEFAULT_TIMEOUT).unwrap(),
            AggregatorConfig {
                clear_on_read_failure: true,
                ..Default::default()
            },
        );

        assert!(agg.run_cycle().await.is_err());
        assert_eq!(store.inner.count_identifiers().await.unwrap(), 0);
        assert!(store.inner.list_endpoints().await.unwrap().is_empty());
    }

    // =========================================================================
    // Read/clear race
    // =========================================================================

    #[tokio::test]
    async fn test_read_then_clear_drops_write_between_read_and_clear() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher {
            late_writer: Some((store.clone(), 1000)),
            ..Default::default()
        });
        let agg = aggregator(&store, Some(publisher.clone()), AggregatorConfig::default());

        store.add_identifier(1).await.unwrap();
        store.add_identifier(2).await.unwrap();

        let report = agg.run_cycle().await.unwrap();
        assert_eq!(report.count, 2);

        // Id 1000 arrived after the read and was wiped by the clear.
        assert_eq!(store.count_identifiers().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_atomic_flush_keeps_write_for_next_window() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher {
            late_writer: Some((store.clone(), 1000)),
            ..Default::default()
        });
        let agg = aggregator(
            &store,
            Some(publisher.clone()),
            AggregatorConfig {
                flush_mode: FlushMode::Atomic,
                ..Default::default()
            },
        );

        store.add_identifier(1).await.unwrap();
        store.add_identifier(2).await.unwrap();

        let report = agg.run_cycle().await.unwrap();
        assert_eq!(report.count, 2);
        assert!(report.cleared);
        assert_eq!(store.count_identifiers().await.unwrap(), 1);
    }

    // =========================================================================
    // Loop
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_loop_flushes_once_per_interval() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let agg = Arc::new(aggregator(
            &store,
            Some(publisher.clone()),
            AggregatorConfig::default(),
        ));

        store.add_identifier(5).await.unwrap();
        let handle = agg.spawn();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(publisher.messages.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(publisher.messages.lock().as_slice(), &["1".to_string()]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(publisher.messages.lock().len(), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycle_delays_next_flush() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let agg = Arc::new(aggregator(
            &store,
            Some(publisher.clone()),
            AggregatorConfig::default(),
        ));

        let handle = agg.spawn();

        // First cycle starts at 60s and runs until 90s; the next one is due
        // a full interval later at 150s, not at 120s.
        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(publisher.messages.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(publisher.messages.lock().len(), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_failing_cycles() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let agg = Arc::new(aggregator(
            &store,
            Some(publisher.clone()),
            AggregatorConfig::default(),
        ));

        store.set_unavailable(true);
        let handle = agg.spawn();

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(publisher.messages.lock().is_empty());

        store.set_unavailable(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(publisher.messages.lock().len(), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_loop() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let agg = Arc::new(aggregator(
            &store,
            Some(publisher.clone()),
            AggregatorConfig::default(),
        ));

        let handle = agg.spawn();
        handle.shutdown().await;

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(publisher.messages.lock().is_empty());
    }

    #[test]
    fn test_flush_mode_parse() {
        assert_eq!(
            "read-then-clear".parse::<FlushMode>().unwrap(),
            FlushMode::ReadThenClear
        );
        assert_eq!(" Atomic ".parse::<FlushMode>().unwrap(), FlushMode::Atomic);
        assert!(matches!(
            "sometimes".parse::<FlushMode>(),
            Err(Error::Config(_))
        ));
        assert_eq!(FlushMode::Atomic.to_string(), "atomic");
    }
}
