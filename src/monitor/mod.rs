// src/monitor/mod.rs — Heap usage watchdog
//
// Samples heap usage on an interval and fires a callback once per
// overage. The callback is expected to pause the pipeline, which stops
// the watcher.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::infra::config::MemoryConfig;

/// Reading from the legacy synchronous heap accessor.
#[derive(Debug, Clone, Copy)]
pub struct HeapSnapshot {
    pub used_bytes: u64,
    pub heap_limit_bytes: u64,
}

/// Source of heap measurements. The modern asynchronous API is preferred;
/// the legacy synchronous accessor is the fallback. A host may support
/// neither.
#[async_trait]
pub trait MemoryProbe: Send + Sync {
    /// Asynchronous measurement in bytes; `None` when unsupported.
    async fn measure_bytes(&self) -> Option<u64>;

    /// Synchronous heap snapshot; `None` when unsupported.
    fn heap_snapshot(&self) -> Option<HeapSnapshot>;
}

/// One sample, normalized from whichever probe path responded.
#[derive(Debug, Clone, Copy)]
enum Sample {
    Measured { used_bytes: u64, heap_limit: Option<u64> },
    Unsupported,
}

/// Overage rule: strictly above the configured limit, or strictly above
/// the heap's own limit when the probe reports one. Equality is not an
/// overage.
fn over_limit(used_bytes: u64, heap_limit: Option<u64>, limit_bytes: u64) -> bool {
    used_bytes > limit_bytes || heap_limit.is_some_and(|l| used_bytes > l)
}

pub struct MemoryWatch {
    probe: Arc<dyn MemoryProbe>,
    limit_bytes: u64,
    poll_interval: Duration,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
}

impl MemoryWatch {
    pub fn new(probe: Arc<dyn MemoryProbe>, config: &MemoryConfig) -> Self {
        Self {
            probe,
            limit_bytes: config.memory_limit_bytes,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            shutdown_tx: Mutex::new(None),
        }
    }

    async fn sample(probe: &dyn MemoryProbe) -> Sample {
        if let Some(used_bytes) = probe.measure_bytes().await {
            return Sample::Measured {
                used_bytes,
                heap_limit: None,
            };
        }
        if let Some(snapshot) = probe.heap_snapshot() {
            return Sample::Measured {
                used_bytes: snapshot.used_bytes,
                heap_limit: Some(snapshot.heap_limit_bytes),
            };
        }
        Sample::Unsupported
    }

    /// Start polling. A watcher already running is left alone.
    pub fn start(&self, callback: impl Fn(u64) + Send + Sync + 'static) {
        let mut shutdown_slot = match self.shutdown_tx.lock() {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if shutdown_slot.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        *shutdown_slot = Some(shutdown_tx);

        let probe = Arc::clone(&self.probe);
        let limit_bytes = self.limit_bytes;
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let mut in_overage = false;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {
                        match Self::sample(probe.as_ref()).await {
                            Sample::Unsupported => {
                                tracing::info!("No memory measurement API available, monitoring disabled");
                                break;
                            }
                            Sample::Measured { used_bytes, heap_limit } => {
                                if over_limit(used_bytes, heap_limit, limit_bytes) {
                                    if !in_overage {
                                        in_overage = true;
                                        tracing::warn!(
                                            used_bytes,
                                            limit_bytes,
                                            "Memory limit exceeded"
                                        );
                                        callback(used_bytes);
                                    }
                                } else {
                                    in_overage = false;
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        if let Ok(mut slot) = self.shutdown_tx.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    struct ScriptedProbe {
        readings: Vec<u64>,
        next: AtomicUsize,
        supports_async: bool,
    }

    impl ScriptedProbe {
        fn new(readings: Vec<u64>) -> Arc<Self> {
            Arc::new(Self {
                readings,
                next: AtomicUsize::new(0),
                supports_async: true,
            })
        }

        fn reading(&self) -> Option<u64> {
            let i = self.next.fetch_add(1, Ordering::SeqCst);
            let i = i.min(self.readings.len().saturating_sub(1));
            self.readings.get(i).copied()
        }
    }

    #[async_trait]
    impl MemoryProbe for ScriptedProbe {
        async fn measure_bytes(&self) -> Option<u64> {
            if self.supports_async {
                self.reading()
            } else {
                None
            }
        }

        fn heap_snapshot(&self) -> Option<HeapSnapshot> {
            None
        }
    }

    struct UnsupportedProbe;

    #[async_trait]
    impl MemoryProbe for UnsupportedProbe {
        async fn measure_bytes(&self) -> Option<u64> {
            None
        }
        fn heap_snapshot(&self) -> Option<HeapSnapshot> {
            None
        }
    }

    #[test]
    fn test_over_limit_strict() {
        assert!(!over_limit(100, None, 100)); // equal is not an overage
        assert!(over_limit(101, None, 100));
        assert!(!over_limit(99, None, 100));
    }

    #[test]
    fn test_over_heap_limit_strict() {
        assert!(!over_limit(50, Some(50), 100));
        assert!(over_limit(51, Some(50), 100));
    }

    #[tokio::test]
    async fn test_fires_once_per_overage() {
        let probe = ScriptedProbe::new(vec![10, 200, 250, 10, 300]);
        let config = MemoryConfig {
            memory_limit_bytes: 100,
            poll_interval_ms: 5,
        };
        let watch = MemoryWatch::new(probe, &config);

        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);
        watch.start(move |_used| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        watch.stop();

        // Two distinct overages: 200/250 counts once, 300 counts again.
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsupported_probe_inert() {
        let config = MemoryConfig {
            memory_limit_bytes: 100,
            poll_interval_ms: 5,
        };
        let watch = MemoryWatch::new(Arc::new(UnsupportedProbe), &config);

        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);
        watch.start(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sync_fallback_used() {
        struct SyncOnlyProbe;

        #[async_trait]
        impl MemoryProbe for SyncOnlyProbe {
            async fn measure_bytes(&self) -> Option<u64> {
                None
            }
            fn heap_snapshot(&self) -> Option<HeapSnapshot> {
                Some(HeapSnapshot {
                    used_bytes: 500,
                    heap_limit_bytes: 400,
                })
            }
        }

        let config = MemoryConfig {
            memory_limit_bytes: 1_000, // configured limit not exceeded
            poll_interval_ms: 5,
        };
        let watch = MemoryWatch::new(Arc::new(SyncOnlyProbe), &config);

        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);
        watch.start(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        watch.stop();

        // used > heap limit fires even under the configured limit.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_double_start_keeps_single_watcher() {
        let probe = ScriptedProbe::new(vec![500]);
        let config = MemoryConfig {
            memory_limit_bytes: 100,
            poll_interval_ms: 5,
        };
        let watch = MemoryWatch::new(probe, &config);

        let fired = Arc::new(AtomicU64::new(0));
        let f1 = Arc::clone(&fired);
        watch.start(move |_| {
            f1.fetch_add(1, Ordering::SeqCst);
        });
        let f2 = Arc::clone(&fired);
        watch.start(move |_| {
            f2.fetch_add(10, Ordering::SeqCst);
        });
        assert!(watch.is_running());

        tokio::time::sleep(Duration::from_millis(50)).await;
        watch.stop();
        assert!(!watch.is_running());

        // Only the first watcher ran; sustained overage fires once.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
