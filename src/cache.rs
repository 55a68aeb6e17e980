//! Cache Handles
//!
//! A [`Cache`] materialises a sub-computation into the store without
//! surfacing it as a graph output. Compiling `cache.apply(..)` inserts the
//! transformed sub-graph, registers its unique delay vertex on the handle,
//! and adds the sub-graph's terminal vertices to `run_no_output` so every
//! step updates the state. User code reads the committed Z-set through the
//! handle after `inc`.

use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::ir::Path;
use crate::store::Store;
use crate::zset::{Datum, ZSet};

/// A user-visible handle onto a cached sub-computation's delay vertex.
#[derive(Clone, Default)]
pub struct Cache {
    registered: Arc<RwLock<Option<Path>>>,
}

impl Cache {
    pub fn new() -> Cache {
        Cache::default()
    }

    /// Bind the handle to its delay vertex. Called by the compiler; a
    /// handle compiled into two graphs keeps the last registration.
    pub(crate) fn register(&self, path: Path) {
        if let Ok(mut slot) = self.registered.write() {
            *slot = Some(path);
        }
    }

    /// The cached Z-set as of the last committed step.
    pub fn zset<S: Store>(&self, store: &S) -> Result<ZSet> {
        let path = self
            .registered
            .read()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| Error::runtime("cache handle was never compiled into a graph"))?;
        match store.get(&path)? {
            Datum::ZSet(z) => Ok(z),
            other => Err(Error::runtime(format!(
                "cache cell holds a non-Z-set value: {other}"
            ))),
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = self.registered.read().ok().and_then(|slot| slot.clone());
        f.debug_struct("Cache").field("registered", &path).finish()
    }
}
