use std::collections::BTreeMap;

use crate::error::StoreResult;
use crate::storage::models::SingleUseObject;
use crate::storage::{Database, DatabaseError, RowKey, Table};
use crate::ttl::{put_expirable, ttl_for};

pub type Notes = BTreeMap<String, String>;

/// One-time tokens keyed by an opaque string, each living for a fixed
/// lifespan from when it was put.
#[derive(Debug, Clone)]
pub struct SingleUseObjectRepository {
    db: Database,
}

impl SingleUseObjectRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn key(key: &str) -> RowKey {
        RowKey::single(key)
    }

    fn object(&self, key: &str, lifespan_seconds: i64, notes: Notes) -> SingleUseObject {
        SingleUseObject {
            key: key.to_string(),
            notes,
            expiration: Some(
                self.db
                    .now_millis()
                    .saturating_add(lifespan_seconds.saturating_mul(1000)),
            ),
        }
    }

    pub fn put(&self, key: &str, lifespan_seconds: i64, notes: Notes) -> StoreResult<()> {
        let object = self.object(key, lifespan_seconds, notes);
        put_expirable(&self.db, Table::SingleUseObjects, &Self::key(key), &object)?;
        Ok(())
    }

    /// Insert only if no live object holds `key`. Returns whether it was inserted.
    pub fn put_if_absent(&self, key: &str, lifespan_seconds: i64) -> StoreResult<bool> {
        let object = self.object(key, lifespan_seconds, Notes::new());
        let data = rmp_serde::to_vec_named(&object).map_err(DatabaseError::from)?;
        let ttl = ttl_for(object.expiration, self.db.now_millis());
        Ok(self
            .db
            .put_if_absent(Table::SingleUseObjects, &Self::key(key), &data, ttl)?)
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<Notes>> {
        Ok(self
            .db
            .get_record::<SingleUseObject>(Table::SingleUseObjects, &Self::key(key))?
            .map(|object| object.notes))
    }

    pub fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self
            .db
            .get(Table::SingleUseObjects, &Self::key(key))?
            .is_some())
    }

    /// Replace the notes of a live object, keeping its original expiration.
    pub fn replace(&self, key: &str, notes: Notes) -> StoreResult<bool> {
        let Some(mut object) = self
            .db
            .get_record::<SingleUseObject>(Table::SingleUseObjects, &Self::key(key))?
        else {
            return Ok(false);
        };
        object.notes = notes;
        put_expirable(&self.db, Table::SingleUseObjects, &Self::key(key), &object)?;
        Ok(true)
    }

    /// Consume an object: delete it and return its notes in one step, so a
    /// token can only be redeemed once.
    pub fn remove(&self, key: &str) -> StoreResult<Option<Notes>> {
        match self.db.take(Table::SingleUseObjects, &Self::key(key))? {
            Some(row) => Ok(Some(row.decode::<SingleUseObject>()?.notes)),
            None => Ok(None),
        }
    }
}
