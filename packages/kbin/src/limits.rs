//! Work limits and cooperative cancellation.

use crate::error::{ensure, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};


/// Caps on schema-driven work, so a hostile schema cannot pin the process.
#[derive(Debug, Copy, Clone)]
pub struct Limits {
    /// Most elements a single repeat loop may produce.
    pub max_elements: u64,
    /// Deepest nesting of user-type parses plus instance forcing.
    pub max_depth: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_elements: 1 << 20,
            max_depth: 1024,
        }
    }
}

impl Limits {
    pub(crate) fn check_elements(&self, count: u64) -> Result<()> {
        ensure!(
            count <= self.max_elements,
            LimitExceeded,
            "repeat produced {} elements, limit is {}",
            count,
            self.max_elements,
        );
        Ok(())
    }

    pub(crate) fn check_depth(&self, depth: u32) -> Result<()> {
        ensure!(
            depth <= self.max_depth,
            LimitExceeded,
            "nesting depth {} exceeds limit {}",
            depth,
            self.max_depth,
        );
        Ok(())
    }
}


/// Cancellation token polled between seq steps and at the head of instance
/// evaluation. Cloning shares the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<()> {
        ensure!(!self.is_cancelled(), Cancelled, "operation cancelled");
        Ok(())
    }
}


#[test]
fn test_cancel_token_shares_flag() {
    let a = CancelToken::new();
    let b = a.clone();
    assert!(a.check().is_ok());
    b.cancel();
    assert!(a.is_cancelled());
    assert_eq!(
        a.check().unwrap_err().kind(),
        crate::error::ErrorKind::Cancelled,
    );
}

#[test]
fn test_limits_defaults() {
    let limits = Limits::default();
    assert!(limits.check_elements(1 << 20).is_ok());
    assert!(limits.check_elements((1 << 20) + 1).is_err());
    assert!(limits.check_depth(1024).is_ok());
    assert!(limits.check_depth(1025).is_err());
}
