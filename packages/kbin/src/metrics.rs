//! Hooks for the host's metrics sink.
//!
//! The engine emits counters and timings through these hooks; the host
//! decides what to do with them. The contract is fire-and-forget -- a sink
//! must never fail and must never block the calling thread for long.

use crate::error::ErrorKind;
use std::time::Duration;


#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MetricEvent {
    /// A parse invocation completed successfully.
    Parsed,
    /// A serialize invocation completed successfully.
    Serialized,
    /// An invocation failed, classified by error kind.
    Errored(ErrorKind),
    /// Bytes consumed by a parse invocation.
    BytesRead(u64),
    /// Bytes produced by a serialize invocation.
    BytesWritten(u64),
}

pub trait MetricsSink: Send + Sync {
    fn event(&self, event: MetricEvent);

    /// Per-invocation wall time. `what` is `"parse"` or `"serialize"`.
    fn duration(&self, what: &'static str, elapsed: Duration) {
        let _ = (what, elapsed);
    }
}


#[cfg(test)]
pub(crate) mod test_sink {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<MetricEvent>>,
    }

    impl MetricsSink for RecordingSink {
        fn event(&self, event: MetricEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
