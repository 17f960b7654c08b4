//! Prepared-Statement Registry: maps frontend statement ID → backend
//! statement + classified SQL + cached parameter/column metadata. Grounded
//! on `database/mysql/statement.go`'s `mysqlStmt` cache fields (`params`,
//! `prepareColumns`, `columns`).
//!
//! Per-session only, reachable from a single task — a plain `HashMap`, not a
//! concurrent structure (`spec.md` §9 redesign note, §5).

use crate::backend::conn::PreparedMeta;
use crate::session::classifier::Statement;
use crate::session::router::RouteTarget;
use hashbrown::HashMap;

#[derive(Debug, Clone)]
pub struct PreparedEntry {
    pub classified: Statement,
    pub meta: PreparedMeta,
    /// Which backend connection this statement was prepared on — statement
    /// IDs are scoped to one backend connection, so every execute against
    /// this entry must reuse the same one rather than re-running the read
    /// predicate.
    pub target: RouteTarget,
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<u32, PreparedEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        frontend_id: u32,
        classified: Statement,
        meta: PreparedMeta,
        target: RouteTarget,
    ) {
        self.entries.insert(
            frontend_id,
            PreparedEntry {
                classified,
                meta,
                target,
            },
        );
    }

    pub fn get(&self, frontend_id: u32) -> Option<&PreparedEntry> {
        self.entries.get(&frontend_id)
    }

    /// `spec.md` §8 "Close idempotence": removing an unknown ID is a no-op.
    pub fn remove(&mut self, frontend_id: u32) -> Option<PreparedEntry> {
        self.entries.remove(&frontend_id)
    }

    /// A backend-side fatal error invalidates every entry bound to it
    /// (`spec.md` §5 "Cancellation and timeouts") — this proxy binds exactly
    /// one backend pair per session, so a backend failure invalidates the
    /// whole registry.
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
