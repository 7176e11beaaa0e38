use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Live counters for both directions of a session.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub(crate) batches_sent: AtomicU64,
    pub(crate) samples_sent: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) send_failures: AtomicU64,
    pub(crate) batches_gated: AtomicU64,
    pub(crate) input_sound: AtomicBool,

    pub(crate) packets_received: AtomicU64,
    pub(crate) frames_decoded: AtomicU64,
    pub(crate) decode_errors: AtomicU64,
    pub(crate) transient_errors: AtomicU64,
    pub(crate) archive_errors: AtomicU64,
    pub(crate) archived_bytes: AtomicU64,
    pub(crate) output_sound: AtomicBool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub batches_sent: u64,
    pub samples_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    /// Batches discarded before the session was configured or while the
    /// transport was not writable.
    pub batches_gated: u64,
    /// Batches dropped by the capture pipe.
    pub batches_dropped: u64,
    pub input_sound: bool,

    pub packets_received: u64,
    pub frames_decoded: u64,
    pub decode_errors: u64,
    pub transient_errors: u64,
    pub archive_errors: u64,
    pub archived_bytes: u64,
    pub output_sound: bool,
}

impl SessionStats {
    pub(crate) fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, batches_dropped: u64) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            batches_sent: get(&self.batches_sent),
            samples_sent: get(&self.samples_sent),
            bytes_sent: get(&self.bytes_sent),
            send_failures: get(&self.send_failures),
            batches_gated: get(&self.batches_gated),
            batches_dropped,
            input_sound: self.input_sound.load(Ordering::Relaxed),
            packets_received: get(&self.packets_received),
            frames_decoded: get(&self.frames_decoded),
            decode_errors: get(&self.decode_errors),
            transient_errors: get(&self.transient_errors),
            archive_errors: get(&self.archive_errors),
            archived_bytes: get(&self.archived_bytes),
            output_sound: self.output_sound.load(Ordering::Relaxed),
        }
    }
}
