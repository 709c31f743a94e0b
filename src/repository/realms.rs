use crate::cache::{QueryCache, QueryKey};
use crate::error::{StoreError, StoreResult};
use crate::expiration::RealmTimeouts;
use crate::index::{AttributeIndex, REALM_INDEX};
use crate::storage::models::Realm;
use crate::storage::{Database, DatabaseError, RowKey, Table};

use super::new_id;

/// Realms are not scoped to anything; their index rows share one scope.
const SCOPE: &str = "realms";
const NAME: &str = "$name";

#[derive(Debug)]
pub struct RealmRepository {
    db: Database,
    index: AttributeIndex,
    lookups: QueryCache<Option<Realm>>,
}

impl RealmRepository {
    pub fn new(db: Database, cache_enabled: bool) -> Self {
        Self {
            index: AttributeIndex::new(db.clone(), REALM_INDEX),
            db,
            lookups: QueryCache::new(cache_enabled),
        }
    }

    fn key(id: &str) -> RowKey {
        RowKey::single(id)
    }

    fn holds_name(&self, id: &str, name: &str) -> StoreResult<bool> {
        Ok(self
            .db
            .get_record::<Realm>(Table::Realms, &Self::key(id))?
            .is_some_and(|realm| realm.name == name))
    }

    /// Create a realm with default timeouts. The name is claimed before the
    /// record is written.
    pub fn create(&self, id: Option<&str>, name: &str) -> StoreResult<Realm> {
        let realm = Realm {
            id: id.map_or_else(new_id, str::to_string),
            name: name.to_string(),
            enabled: true,
            timeouts: RealmTimeouts::default(),
            ..Default::default()
        };
        self.lookups.invalidate_all();

        let key = Self::key(&realm.id);
        if self.db.get(Table::Realms, &key)?.is_some() {
            return Err(StoreError::duplicate("realm id", realm.id));
        }
        self.index
            .claim_unique("realm", SCOPE, &realm.id, NAME, name, None, |owner| {
                self.holds_name(owner, name)
            })?;

        let data = rmp_serde::to_vec_named(&realm).map_err(DatabaseError::from)?;
        if !self.db.put_if_absent(Table::Realms, &key, &data, None)? {
            // lost a race on the id; a winner with the same name shares our claim row
            if !self.holds_name(&realm.id, name)? {
                self.index.release_claim(SCOPE, &realm.id, NAME, name)?;
            }
            return Err(StoreError::duplicate("realm id", realm.id));
        }
        self.index
            .commit_unique(SCOPE, &realm.id, NAME, Some(name), None)?;

        tracing::debug!(realm_id = %realm.id, name = %name, "Realm created");
        Ok(realm)
    }

    pub fn find_by_id(&self, id: &str) -> StoreResult<Option<Realm>> {
        self.lookups.get_or_load(QueryKey::new("find_by_id", [id]), || -> StoreResult<_> {
            Ok(self.db.get_record(Table::Realms, &Self::key(id))?)
        })
    }

    pub fn find_by_name(&self, name: &str) -> StoreResult<Option<Realm>> {
        self.lookups.get_or_load(QueryKey::new("find_by_name", [name]), || -> StoreResult<_> {
            match self.index.find_unique_by_attribute(SCOPE, NAME, name)? {
                Some(id) => Ok(self
                    .db
                    .get_record::<Realm>(Table::Realms, &Self::key(&id))?
                    .filter(|realm| realm.name == name)),
                None => Ok(None),
            }
        })
    }

    pub fn list(&self) -> StoreResult<Vec<Realm>> {
        let mut realms = self
            .db
            .scan_table(Table::Realms)?
            .into_iter()
            .map(|(_, row)| row.decode())
            .collect::<Result<Vec<Realm>, _>>()?;
        realms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(realms)
    }

    /// Persist changes to a realm, re-indexing its name on rename.
    pub fn update(&self, realm: &Realm) -> StoreResult<bool> {
        self.lookups.invalidate_all();
        let Some(previous) = self
            .db
            .get_record::<Realm>(Table::Realms, &Self::key(&realm.id))?
        else {
            return Ok(false);
        };

        if previous.name == realm.name {
            self.db
                .put_record(Table::Realms, &Self::key(&realm.id), realm, None)?;
            return Ok(true);
        }

        self.index
            .claim_unique("realm", SCOPE, &realm.id, NAME, &realm.name, None, |owner| {
                self.holds_name(owner, &realm.name)
            })?;
        if let Err(err) = self
            .db
            .put_record(Table::Realms, &Self::key(&realm.id), realm, None)
        {
            self.index.release_claim(SCOPE, &realm.id, NAME, &realm.name)?;
            return Err(err.into());
        }
        self.index
            .commit_unique(SCOPE, &realm.id, NAME, Some(&realm.name), None)?;
        Ok(true)
    }

    /// Remove the realm record and its index rows. Realm-scoped data is
    /// cascaded by the caller.
    pub fn remove(&self, id: &str) -> StoreResult<bool> {
        self.lookups.invalidate_all();
        let removed = self.db.delete(Table::Realms, &Self::key(id))?;
        self.index.remove_all_attributes_of(SCOPE, id)?;
        if removed {
            tracing::debug!(realm_id = %id, "Realm removed");
        }
        Ok(removed)
    }
}
