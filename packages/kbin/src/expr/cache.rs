//! Process-wide cache of compiled expressions, keyed by source text.
//!
//! Entries are immutable once inserted and never evicted; the population is
//! bounded by the schemas the process loads. Failed compiles are not cached.

use crate::error::Result;
use super::{ast::Expr, parser};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock, RwLock,
    },
};


static CACHE: OnceLock<RwLock<HashMap<String, Arc<Expr>>>> = OnceLock::new();
static HITS: AtomicU64 = AtomicU64::new(0);
static MISSES: AtomicU64 = AtomicU64::new(0);

pub(crate) fn compile(src: &str) -> Result<Arc<Expr>> {
    let cache = CACHE.get_or_init(Default::default);
    if let Some(hit) = cache.read().unwrap().get(src) {
        HITS.fetch_add(1, Ordering::Relaxed);
        return Ok(hit.clone());
    }
    let compiled = Arc::new(parser::parse(src)?);
    MISSES.fetch_add(1, Ordering::Relaxed);
    let mut map = cache.write().unwrap();
    Ok(map.entry(src.to_owned()).or_insert(compiled).clone())
}

/// Lifetime hit/miss counters of the compiled-expression cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

pub fn cache_stats() -> CacheStats {
    CacheStats {
        hits: HITS.load(Ordering::Relaxed),
        misses: MISSES.load(Ordering::Relaxed),
    }
}


#[test]
fn test_compile_caches_by_source() {
    let a = compile("1 + cache_test_marker").unwrap();
    let before = cache_stats();
    let b = compile("1 + cache_test_marker").unwrap();
    let after = cache_stats();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(after.hits > before.hits);
    assert!(compile("1 +").is_err());
}
