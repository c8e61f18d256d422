//! Buffered, out-of-band span sink.
//!
//! `emit` never blocks the run: spans go into a bounded queue and a
//! background flusher batches them into the store. Store failures are
//! retried once, then logged; they never affect the run that emitted the
//! span.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::{Span, TracingStore};

const QUEUE_CAPACITY: usize = 4096;
const BATCH_SIZE: usize = 64;
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Cheap cloneable handle for span emission.
#[derive(Clone)]
pub struct TracingCollectorHandle {
    tx: mpsc::Sender<Span>,
    dropped: Arc<AtomicU64>,
}

impl TracingCollectorHandle {
    /// Enqueues a span without blocking. On a full queue the span is
    /// dropped and counted; a closed queue (collector shut down, or the
    /// disabled handle) discards silently.
    pub fn emit(&self, span: Span) {
        match self.tx.try_send(span) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped = n, "span queue full; span dropped");
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// A handle that discards every span; for tests and minimal setups.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Owns the background flusher task.
pub struct TracingCollector {
    handle: TracingCollectorHandle,
    flusher: tokio::task::JoinHandle<()>,
}

impl TracingCollector {
    /// Spawns the flusher and returns the collector.
    pub fn start(store: Arc<dyn TracingStore>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Span>(QUEUE_CAPACITY);
        let dropped = Arc::new(AtomicU64::new(0));
        let flusher = tokio::spawn(async move {
            let mut batch: Vec<Span> = Vec::with_capacity(BATCH_SIZE);
            let mut tick = tokio::time::interval(FLUSH_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(span) => {
                            batch.push(span);
                            if batch.len() >= BATCH_SIZE {
                                Self::flush(store.as_ref(), &mut batch).await;
                            }
                        }
                        None => {
                            Self::flush(store.as_ref(), &mut batch).await;
                            break;
                        }
                    },
                    _ = tick.tick() => {
                        Self::flush(store.as_ref(), &mut batch).await;
                    }
                }
            }
        });
        Self {
            handle: TracingCollectorHandle { tx, dropped },
            flusher,
        }
    }

    pub fn handle(&self) -> TracingCollectorHandle {
        self.handle.clone()
    }

    /// Closes the queue and waits for the flusher to drain.
    pub async fn shutdown(self) {
        let TracingCollector { handle, flusher } = self;
        drop(handle);
        let _ = flusher.await;
    }

    async fn flush(store: &dyn TracingStore, batch: &mut Vec<Span>) {
        if batch.is_empty() {
            return;
        }
        let spans = std::mem::take(batch);
        if let Err(first) = store.put_batch(&spans).await {
            tracing::warn!(error = %first, "span flush failed; retrying once");
            if let Err(second) = store.put_batch(&spans).await {
                tracing::warn!(error = %second, count = spans.len(), "span flush failed twice; batch dropped");
            }
        }
    }
}
