//! Bounded, drop-on-full conduit of sample batches.
//!
//! The producer side is called from the driver's real-time callback and must
//! never block: when the pipe is full the offered batch is discarded and a
//! counter is bumped. The consumer side blocks (async or sync) until a batch
//! arrives or every writer is gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

/// One callback's worth of interleaved PCM samples, owned independently of
/// the driver buffer it was copied from.
pub type SampleBatch = Vec<f32>;

// 默认容量：采集 → 上行，下行 → 重定向输出
pub const CAPTURE_PIPE_CAPACITY: usize = 1024;
pub const REDIRECT_PIPE_CAPACITY: usize = 8;

#[derive(Debug, Default)]
struct PipeCounters {
    accepted: AtomicU64,
    dropped: AtomicU64,
}

/// Read-only view of a pipe's counters that outlives both halves.
#[derive(Debug, Clone)]
pub struct PipeStats(Arc<PipeCounters>);

impl PipeStats {
    pub fn accepted(&self) -> u64 {
        self.0.accepted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.0.dropped.load(Ordering::Relaxed)
    }
}

/// Create a pipe holding at most `capacity` batches.
pub fn sample_pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let counters = Arc::new(PipeCounters::default());
    (
        PipeWriter {
            tx,
            counters: counters.clone(),
        },
        PipeReader { rx, counters },
    )
}

/// Producer half. Cheap to clone; the pipe closes once every clone is dropped.
#[derive(Debug, Clone)]
pub struct PipeWriter {
    tx: mpsc::Sender<SampleBatch>,
    counters: Arc<PipeCounters>,
}

impl PipeWriter {
    /// Offer a batch without blocking. Returns `false` if it was dropped
    /// because the pipe is full or closed.
    pub fn offer(&self, batch: SampleBatch) -> bool {
        match self.tx.try_send(batch) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn stats(&self) -> PipeStats {
        PipeStats(self.counters.clone())
    }
}

/// Consumer half. Each batch is delivered exactly once.
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::Receiver<SampleBatch>,
    counters: Arc<PipeCounters>,
}

impl PipeReader {
    /// Wait for the next batch. `None` once the pipe is closed and drained.
    pub async fn recv(&mut self) -> Option<SampleBatch> {
        self.rx.recv().await
    }

    /// Blocking variant for plain threads. Must not be called from an async
    /// context.
    pub fn blocking_recv(&mut self) -> Option<SampleBatch> {
        self.rx.blocking_recv()
    }

    // 输出回调使用，不阻塞
    pub fn try_recv(&mut self) -> Option<SampleBatch> {
        match self.rx.try_recv() {
            Ok(batch) => Some(batch),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Refuse further batches; already queued ones can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn accepted(&self) -> u64 {
        self.counters.accepted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}
