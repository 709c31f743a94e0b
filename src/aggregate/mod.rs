//! Deferred write-back of aggregate containers.
//!
//! An aggregate container is one row holding a whole denormalized collection
//! for a tenant (all roles of a realm, all groups of a realm, ...). Writing
//! it is expensive, so within one unit of work every mutation is applied to
//! an in-memory copy and the row is written back at most once, when the unit
//! of work completes.
//!
//! Per tenant the cache moves through: unloaded -> loaded/clean (first
//! access) -> loaded/dirty (any mutation, tenant recorded as changed). A
//! tenant marked deleted is never written back. Commit flushes changed and
//! not-deleted tenants; commit and abort both clear all cached state.

pub mod client_scopes;
pub mod groups;
pub mod roles;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StoreError, StoreResult};
use crate::storage::{ConditionalWrite, Database, DatabaseError, RowKey, Table};
use crate::uow::UnitOfWork;

pub use client_scopes::{ClientScopeStore, ClientScopeValue, RealmClientScopes};
pub use groups::{GroupStore, GroupValue, RealmGroups};
pub use roles::{RealmRoles, RoleStore, RoleValue};

/// A denormalized per-tenant container.
pub trait Aggregate: Serialize + DeserializeOwned + Clone + Send + 'static {
    const TABLE: Table;
    const KIND: &'static str;

    /// Container used when the tenant has no stored row yet.
    fn empty(tenant_id: &str) -> Self;
}

struct Cached<A> {
    value: A,
    /// Row version observed at load, `None` if the row did not exist.
    version: Option<u64>,
}

struct CoordinatorState<A> {
    loaded: HashMap<String, Cached<A>>,
    changed: HashSet<String>,
    deleted: HashSet<String>,
}

impl<A> Default for CoordinatorState<A> {
    fn default() -> Self {
        Self {
            loaded: HashMap::new(),
            changed: HashSet::new(),
            deleted: HashSet::new(),
        }
    }
}

/// Write-back coordinator for one aggregate kind within one unit of work.
///
/// Closures passed to [`read`](Self::read) and [`update`](Self::update) run
/// while the coordinator is locked and must not call back into it.
pub struct AggregateStore<A: Aggregate> {
    db: Database,
    linearizable: bool,
    state: Arc<Mutex<CoordinatorState<A>>>,
}

impl<A: Aggregate> Clone for AggregateStore<A> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            linearizable: self.linearizable,
            state: Arc::clone(&self.state),
        }
    }
}

impl<A: Aggregate> AggregateStore<A> {
    /// Create a coordinator bound to `uow`: it flushes when the unit of work
    /// completes and clears itself when it aborts.
    pub fn attach(db: Database, uow: &dyn UnitOfWork, linearizable: bool) -> Self {
        let store = Self {
            db,
            linearizable,
            state: Arc::new(Mutex::new(CoordinatorState::default())),
        };

        let flushing = store.clone();
        uow.on_complete(Box::new(move || {
            let result = flushing.flush();
            flushing.close();
            result.map(|_| ())
        }));

        let closing = store.clone();
        uow.on_abort(Box::new(move || closing.close()));

        store
    }

    fn key(tenant_id: &str) -> RowKey {
        RowKey::single(tenant_id)
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState<A>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load<'s>(
        &self,
        state: &'s mut CoordinatorState<A>,
        tenant_id: &str,
    ) -> StoreResult<&'s mut Cached<A>> {
        if !state.loaded.contains_key(tenant_id) {
            let cached = match self.db.get(A::TABLE, &Self::key(tenant_id))? {
                Some(row) => Cached {
                    value: row.decode()?,
                    version: Some(row.version),
                },
                None => Cached {
                    value: A::empty(tenant_id),
                    version: None,
                },
            };
            tracing::trace!(kind = A::KIND, tenant_id = %tenant_id, "Aggregate loaded");
            state.loaded.insert(tenant_id.to_string(), cached);
        }

        state
            .loaded
            .get_mut(tenant_id)
            .ok_or_else(|| StoreError::invalid(format!("{} {tenant_id} not cached", A::KIND)))
    }

    /// Snapshot of the tenant's container, loading it on first access.
    pub fn get(&self, tenant_id: &str) -> StoreResult<A> {
        self.read(tenant_id, A::clone)
    }

    pub fn read<R>(&self, tenant_id: &str, f: impl FnOnce(&A) -> R) -> StoreResult<R> {
        let mut state = self.lock();
        let cached = self.load(&mut state, tenant_id)?;
        Ok(f(&cached.value))
    }

    /// Mutate the cached container and mark the tenant changed.
    pub fn update<R>(&self, tenant_id: &str, f: impl FnOnce(&mut A) -> R) -> StoreResult<R> {
        self.try_update(tenant_id, |value| Ok(f(value)))
    }

    /// Like [`update`](Self::update), but the tenant is only marked changed
    /// when `f` succeeds. `f` must leave the container untouched on error.
    pub fn try_update<R>(
        &self,
        tenant_id: &str,
        f: impl FnOnce(&mut A) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let mut state = self.lock();
        let cached = self.load(&mut state, tenant_id)?;
        let result = f(&mut cached.value)?;
        state.changed.insert(tenant_id.to_string());
        Ok(result)
    }

    pub fn mark_changed(&self, tenant_id: &str) {
        self.lock().changed.insert(tenant_id.to_string());
    }

    /// Suppress any write-back for the tenant in this unit of work.
    pub fn mark_deleted(&self, tenant_id: &str) {
        self.lock().deleted.insert(tenant_id.to_string());
    }

    /// Delete the stored container now and suppress its write-back.
    pub fn delete(&self, tenant_id: &str) -> StoreResult<bool> {
        let deleted = self.db.delete(A::TABLE, &Self::key(tenant_id))?;
        let mut state = self.lock();
        state.loaded.remove(tenant_id);
        state.deleted.insert(tenant_id.to_string());
        tracing::debug!(kind = A::KIND, tenant_id = %tenant_id, "Aggregate deleted");
        Ok(deleted)
    }

    /// Tenants that would be written back if the unit of work completed now.
    pub fn pending_writes(&self) -> Vec<String> {
        let state = self.lock();
        let mut pending: Vec<String> = state
            .changed
            .iter()
            .filter(|t| !state.deleted.contains(*t) && state.loaded.contains_key(*t))
            .cloned()
            .collect();
        pending.sort();
        pending
    }

    /// Write every changed, not-deleted container once. Returns the number of
    /// rows written.
    pub fn flush(&self) -> StoreResult<usize> {
        let mut state = self.lock();
        let mut tenants: Vec<String> = state.changed.drain().collect();
        tenants.sort();

        let mut written = 0;
        for tenant_id in tenants {
            if state.deleted.contains(&tenant_id) {
                continue;
            }
            let Some(cached) = state.loaded.get_mut(&tenant_id) else {
                continue;
            };

            let data = rmp_serde::to_vec_named(&cached.value).map_err(DatabaseError::from)?;
            let key = Self::key(&tenant_id);
            if self.linearizable {
                match self
                    .db
                    .put_if_version(A::TABLE, &key, &data, cached.version, None)?
                {
                    ConditionalWrite::Applied { version } => cached.version = Some(version),
                    ConditionalWrite::Rejected { current } => {
                        tracing::warn!(
                            kind = A::KIND,
                            tenant_id = %tenant_id,
                            expected = ?cached.version,
                            current = ?current,
                            "Aggregate write-back lost a version race"
                        );
                        return Err(StoreError::ConcurrentModification {
                            kind: A::KIND,
                            key: tenant_id,
                        });
                    }
                }
            } else {
                cached.version = Some(self.db.put(A::TABLE, &key, &data, None)?);
            }
            written += 1;
            tracing::debug!(kind = A::KIND, tenant_id = %tenant_id, "Aggregate written back");
        }
        Ok(written)
    }

    /// End of the unit of work: drop every cached container and flag.
    pub fn close(&self) {
        let mut state = self.lock();
        state.loaded.clear();
        state.changed.clear();
        state.deleted.clear();
    }
}

/// Apply `first`/`max` pagination after filtering.
pub fn paginate<T>(
    items: impl IntoIterator<Item = T>,
    first: Option<usize>,
    max: Option<usize>,
) -> Vec<T> {
    items
        .into_iter()
        .skip(first.unwrap_or(0))
        .take(max.unwrap_or(usize::MAX))
        .collect()
}

/// Case-insensitive substring match; `None` matches everything.
pub fn matches_search(value: &str, search: Option<&str>) -> bool {
    match search {
        Some(s) if !s.is_empty() => value.to_lowercase().contains(&s.to_lowercase()),
        _ => true,
    }
}
