//! Hand-maintained secondary indexes.
//!
//! Every indexed attribute is stored twice:
//!
//! - a forward row `(scope, entity_id) / name -> [values]`, the pre-image
//!   used to find which reverse rows must be retracted, and
//! - one reverse row per value `(scope, name, value) / entity_id`, the
//!   lookup-by-value path.
//!
//! The two are written as separate physical writes. A failure between them
//! leaves the index transiently inconsistent: a stale reverse row resolves to
//! an entity that no longer carries the value (callers drop it on
//! resolution), a missing reverse row hides the entity from that value until
//! the next write. Nothing repairs this automatically.

use std::collections::BTreeMap;

use crate::error::{StoreError, StoreResult};
use crate::storage::{composite, Database, DatabaseError, RowKey, Table};

/// Claims younger than this are never dropped as stale: their owner may still
/// be between taking the claim and writing its record.
pub const CLAIM_GRACE_MILLIS: i64 = 30_000;

/// Forward/reverse table pair for one indexed entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexTables {
    pub forward: Table,
    pub reverse: Table,
}

pub const REALM_INDEX: IndexTables = IndexTables {
    forward: Table::RealmAttributes,
    reverse: Table::AttributeRealms,
};

pub const CLIENT_INDEX: IndexTables = IndexTables {
    forward: Table::ClientAttributes,
    reverse: Table::AttributeClients,
};

pub const USER_INDEX: IndexTables = IndexTables {
    forward: Table::UserAttributes,
    reverse: Table::AttributeUsers,
};

pub const USER_SESSION_INDEX: IndexTables = IndexTables {
    forward: Table::UserSessionAttributes,
    reverse: Table::AttributeUserSessions,
};

#[derive(Debug, Clone)]
pub struct AttributeIndex {
    db: Database,
    tables: IndexTables,
}

impl AttributeIndex {
    pub fn new(db: Database, tables: IndexTables) -> Self {
        Self { db, tables }
    }

    fn forward_key(scope: &str, entity_id: &str, name: &str) -> RowKey {
        RowKey::new(composite(&[scope, entity_id]), name)
    }

    fn reverse_key(scope: &str, name: &str, value: &str, entity_id: &str) -> RowKey {
        RowKey::new(composite(&[scope, name, value]), entity_id)
    }

    /// Current values of one attribute (the forward row).
    pub fn values_of(
        &self,
        scope: &str,
        entity_id: &str,
        name: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let key = Self::forward_key(scope, entity_id, name);
        Ok(self
            .db
            .get_record::<Vec<String>>(self.tables.forward, &key)?
            .unwrap_or_default())
    }

    /// Replace the values of an attribute.
    ///
    /// Stale reverse rows are retracted before the new ones are written;
    /// values present both before and after are simply rewritten. An empty
    /// value set removes the attribute.
    pub fn set_attribute(
        &self,
        scope: &str,
        entity_id: &str,
        name: &str,
        values: &[String],
        ttl_seconds: Option<i32>,
    ) -> Result<(), DatabaseError> {
        let values = dedup(values);
        if values.is_empty() {
            self.remove_attribute(scope, entity_id, name)?;
            return Ok(());
        }

        let previous = self.values_of(scope, entity_id, name)?;

        let forward = Self::forward_key(scope, entity_id, name);
        self.db
            .put_record(self.tables.forward, &forward, &values, ttl_seconds)?;

        for stale in previous.iter().filter(|v| !values.contains(v)) {
            self.db.delete(
                self.tables.reverse,
                &Self::reverse_key(scope, name, stale, entity_id),
            )?;
        }

        for value in &values {
            self.db.put(
                self.tables.reverse,
                &Self::reverse_key(scope, name, value, entity_id),
                &[],
                ttl_seconds,
            )?;
        }
        Ok(())
    }

    /// Remove an attribute and every reverse row named by its pre-image.
    pub fn remove_attribute(
        &self,
        scope: &str,
        entity_id: &str,
        name: &str,
    ) -> Result<bool, DatabaseError> {
        let previous = self.values_of(scope, entity_id, name)?;
        let removed = self.db.delete(
            self.tables.forward,
            &Self::forward_key(scope, entity_id, name),
        )?;

        for value in &previous {
            self.db.delete(
                self.tables.reverse,
                &Self::reverse_key(scope, name, value, entity_id),
            )?;
        }
        Ok(removed)
    }

    /// Ids of every entity claiming `name = value`. Ids are not resolved;
    /// callers fetch the forward entity and drop ids that no longer resolve.
    pub fn find_by_attribute(
        &self,
        scope: &str,
        name: &str,
        value: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let partition = composite(&[scope, name, value]);
        Ok(self
            .db
            .scan_partition(self.tables.reverse, &partition)?
            .into_iter()
            .map(|(key, _)| key.clustering)
            .collect())
    }

    /// Lookup of a value that must belong to at most one entity.
    pub fn find_unique_by_attribute(
        &self,
        scope: &str,
        name: &str,
        value: &str,
    ) -> StoreResult<Option<String>> {
        let mut owners = self.find_by_attribute(scope, name, value)?;
        match owners.len() {
            0 => Ok(None),
            1 => Ok(owners.pop()),
            _ => {
                tracing::error!(
                    scope = %scope,
                    attribute = %name,
                    value = %value,
                    owners = ?owners,
                    "Unique attribute claimed by more than one entity"
                );
                Err(StoreError::IndexInconsistency {
                    attribute: name.to_string(),
                    value: value.to_string(),
                    owners,
                })
            }
        }
    }

    /// Take the reverse row for a unique value without moving the forward row.
    ///
    /// A conflicting claim is dropped when it is older than
    /// [`CLAIM_GRACE_MILLIS`] and `holds` reports that its owner no longer
    /// carries the value; the claim is then retried once.
    pub fn claim_unique(
        &self,
        kind: &'static str,
        scope: &str,
        entity_id: &str,
        name: &str,
        value: &str,
        ttl_seconds: Option<i32>,
        holds: impl Fn(&str) -> StoreResult<bool>,
    ) -> StoreResult<()> {
        let claim = Self::reverse_key(scope, name, value, entity_id);
        let claimed_at = rmp_serde::to_vec(&self.db.now_millis()).map_err(DatabaseError::from)?;

        for attempt in 0..2 {
            if self.db.put_if_partition_vacant(
                self.tables.reverse,
                &claim,
                &claimed_at,
                ttl_seconds,
            )? {
                return Ok(());
            }
            if attempt > 0 || !self.drop_stale_claims(scope, entity_id, name, value, &holds)? {
                break;
            }
        }
        Err(StoreError::duplicate(kind, value))
    }

    /// Delete every conflicting claim on `value`, or none if any is still
    /// within its grace period or held.
    fn drop_stale_claims(
        &self,
        scope: &str,
        entity_id: &str,
        name: &str,
        value: &str,
        holds: &impl Fn(&str) -> StoreResult<bool>,
    ) -> StoreResult<bool> {
        let now = self.db.now_millis();
        let partition = composite(&[scope, name, value]);
        let mut conflicts = Vec::new();
        for (key, row) in self.db.scan_partition(self.tables.reverse, &partition)? {
            if key.clustering == entity_id {
                continue;
            }
            // rows without a timestamp predate claim stamping
            let claimed_at = row.decode::<i64>().unwrap_or(i64::MIN);
            if now.saturating_sub(claimed_at) < CLAIM_GRACE_MILLIS || holds(&key.clustering)? {
                return Ok(false);
            }
            conflicts.push(key);
        }

        for key in &conflicts {
            tracing::warn!(
                scope = %scope,
                attribute = %name,
                value = %value,
                owner = %key.clustering,
                "Dropping stale unique claim"
            );
            self.db.delete(self.tables.reverse, key)?;
        }
        Ok(true)
    }

    /// Release a claim taken by [`claim_unique`](Self::claim_unique) that
    /// will not be committed.
    pub fn release_claim(
        &self,
        scope: &str,
        entity_id: &str,
        name: &str,
        value: &str,
    ) -> Result<bool, DatabaseError> {
        self.db.delete(
            self.tables.reverse,
            &Self::reverse_key(scope, name, value, entity_id),
        )
    }

    /// Point the forward row at an already claimed value and retract the
    /// values held before. `None` removes the attribute.
    pub fn commit_unique(
        &self,
        scope: &str,
        entity_id: &str,
        name: &str,
        value: Option<&str>,
        ttl_seconds: Option<i32>,
    ) -> Result<(), DatabaseError> {
        let Some(value) = value else {
            self.remove_attribute(scope, entity_id, name)?;
            return Ok(());
        };

        let previous = self.values_of(scope, entity_id, name)?;
        let values = vec![value.to_string()];
        self.db.put_record(
            self.tables.forward,
            &Self::forward_key(scope, entity_id, name),
            &values,
            ttl_seconds,
        )?;

        for stale in previous.iter().filter(|v| v.as_str() != value) {
            self.db.delete(
                self.tables.reverse,
                &Self::reverse_key(scope, name, stale, entity_id),
            )?;
        }
        Ok(())
    }

    /// Every attribute of an entity (scan of its forward partition).
    pub fn find_all_attributes_of(
        &self,
        scope: &str,
        entity_id: &str,
    ) -> Result<BTreeMap<String, Vec<String>>, DatabaseError> {
        let partition = composite(&[scope, entity_id]);
        self.db
            .scan_partition(self.tables.forward, &partition)?
            .into_iter()
            .map(|(key, row)| Ok((key.clustering, row.decode::<Vec<String>>()?)))
            .collect()
    }

    /// Cascade for entity deletion: retract every reverse row, then the
    /// forward partition.
    pub fn remove_all_attributes_of(
        &self,
        scope: &str,
        entity_id: &str,
    ) -> Result<usize, DatabaseError> {
        let attributes = self.find_all_attributes_of(scope, entity_id)?;
        for (name, values) in &attributes {
            for value in values {
                self.db.delete(
                    self.tables.reverse,
                    &Self::reverse_key(scope, name, value, entity_id),
                )?;
            }
        }
        self.db
            .delete_partition(self.tables.forward, &composite(&[scope, entity_id]))?;
        Ok(attributes.len())
    }

    /// Rewrite every attribute row of an entity with a new TTL, so index rows
    /// live exactly as long as the record they point at.
    pub fn refresh_ttl(
        &self,
        scope: &str,
        entity_id: &str,
        ttl_seconds: Option<i32>,
    ) -> Result<(), DatabaseError> {
        for (name, values) in self.find_all_attributes_of(scope, entity_id)? {
            self.set_attribute(scope, entity_id, &name, &values, ttl_seconds)?;
        }
        Ok(())
    }
}

fn dedup(values: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        if !unique.contains(value) {
            unique.push(value.clone());
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::setup_db;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn held(_owner: &str) -> StoreResult<bool> {
        Ok(true)
    }

    fn abandoned(_owner: &str) -> StoreResult<bool> {
        Ok(false)
    }

    #[test]
    fn test_changed_value_moves_reverse_row() {
        let (db, _clock, _temp) = setup_db();
        let index = AttributeIndex::new(db, USER_INDEX);

        index
            .set_attribute("r1", "user1", "email", &strings(&["a@example.com"]), None)
            .unwrap();
        index
            .set_attribute("r1", "user1", "email", &strings(&["b@example.com"]), None)
            .unwrap();

        assert!(index
            .find_by_attribute("r1", "email", "a@example.com")
            .unwrap()
            .is_empty());
        assert_eq!(
            index.find_by_attribute("r1", "email", "b@example.com").unwrap(),
            vec!["user1"]
        );
    }

    #[test]
    fn test_multi_valued_attribute_is_reachable_by_every_value() {
        let (db, _clock, _temp) = setup_db();
        let index = AttributeIndex::new(db, USER_INDEX);

        index
            .set_attribute("r1", "u1", "team", &strings(&["red", "blue", "red"]), None)
            .unwrap();
        index
            .set_attribute("r1", "u2", "team", &strings(&["blue"]), None)
            .unwrap();

        assert_eq!(index.values_of("r1", "u1", "team").unwrap(), strings(&["red", "blue"]));
        assert_eq!(index.find_by_attribute("r1", "team", "red").unwrap(), vec!["u1"]);
        assert_eq!(
            index.find_by_attribute("r1", "team", "blue").unwrap(),
            vec!["u1", "u2"]
        );

        index.set_attribute("r1", "u1", "team", &strings(&["blue"]), None).unwrap();
        assert!(index.find_by_attribute("r1", "team", "red").unwrap().is_empty());
    }

    #[test]
    fn test_empty_values_remove_attribute() {
        let (db, _clock, _temp) = setup_db();
        let index = AttributeIndex::new(db, USER_INDEX);

        index.set_attribute("r1", "u1", "nick", &strings(&["bob"]), None).unwrap();
        index.set_attribute("r1", "u1", "nick", &[], None).unwrap();

        assert!(index.values_of("r1", "u1", "nick").unwrap().is_empty());
        assert!(index.find_by_attribute("r1", "nick", "bob").unwrap().is_empty());
    }

    #[test]
    fn test_scopes_are_isolated() {
        let (db, _clock, _temp) = setup_db();
        let index = AttributeIndex::new(db, USER_INDEX);

        index.set_attribute("r1", "u1", "dept", &strings(&["ops"]), None).unwrap();
        assert!(index.find_by_attribute("r2", "dept", "ops").unwrap().is_empty());
    }

    #[test]
    fn test_remove_all_attributes_cascades_to_reverse_rows() {
        let (db, _clock, _temp) = setup_db();
        let index = AttributeIndex::new(db, USER_INDEX);

        index.set_attribute("r1", "u1", "a", &strings(&["1"]), None).unwrap();
        index.set_attribute("r1", "u1", "b", &strings(&["2", "3"]), None).unwrap();

        let attributes = index.find_all_attributes_of("r1", "u1").unwrap();
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes["b"], strings(&["2", "3"]));

        assert_eq!(index.remove_all_attributes_of("r1", "u1").unwrap(), 2);
        assert!(index.find_all_attributes_of("r1", "u1").unwrap().is_empty());
        assert!(index.find_by_attribute("r1", "b", "3").unwrap().is_empty());
    }

    #[test]
    fn test_unique_attribute_rejects_second_claimant() {
        let (db, _clock, _temp) = setup_db();
        let index = AttributeIndex::new(db, USER_INDEX);
        let set = |entity_id: &str, value: &str| -> StoreResult<()> {
            index.claim_unique("username", "r1", entity_id, "$username", value, None, held)?;
            Ok(index.commit_unique("r1", entity_id, "$username", Some(value), None)?)
        };

        set("u1", "alice").unwrap();
        let err = set("u2", "alice").unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { kind: "username", .. }));

        // Renaming releases the old value
        set("u1", "alicia").unwrap();
        set("u2", "alice").unwrap();
        assert_eq!(
            index.find_unique_by_attribute("r1", "$username", "alice").unwrap(),
            Some("u2".to_string())
        );
        assert_eq!(index.values_of("r1", "u1", "$username").unwrap(), strings(&["alicia"]));
    }

    #[test]
    fn test_abandoned_claim_is_reclaimed_after_grace() {
        let (db, clock, _temp) = setup_db();
        let index = AttributeIndex::new(db, USER_INDEX);

        // u1 claims the value but never commits it
        index
            .claim_unique("username", "r1", "u1", "$username", "alice", None, held)
            .unwrap();
        assert!(matches!(
            index.claim_unique("username", "r1", "u2", "$username", "alice", None, abandoned),
            Err(StoreError::DuplicateKey { .. })
        ));

        clock.advance_secs(CLAIM_GRACE_MILLIS / 1000 + 1);
        assert!(matches!(
            index.claim_unique("username", "r1", "u2", "$username", "alice", None, held),
            Err(StoreError::DuplicateKey { .. })
        ));
        index
            .claim_unique("username", "r1", "u2", "$username", "alice", None, abandoned)
            .unwrap();
        assert_eq!(
            index.find_unique_by_attribute("r1", "$username", "alice").unwrap(),
            Some("u2".to_string())
        );
    }

    #[test]
    fn test_released_claim_frees_value() {
        let (db, _clock, _temp) = setup_db();
        let index = AttributeIndex::new(db, USER_INDEX);

        index
            .claim_unique("email", "r1", "u1", "$email", "x@y", None, held)
            .unwrap();
        assert!(index.release_claim("r1", "u1", "$email", "x@y").unwrap());
        index
            .claim_unique("email", "r1", "u2", "$email", "x@y", None, held)
            .unwrap();
        index.commit_unique("r1", "u2", "$email", Some("x@y"), None).unwrap();
        assert_eq!(index.values_of("r1", "u2", "$email").unwrap(), strings(&["x@y"]));
    }

    #[test]
    fn test_unique_lookup_reports_inconsistency() {
        let (db, _clock, _temp) = setup_db();
        let index = AttributeIndex::new(db, USER_INDEX);

        // Non-conditional writes can still produce a double claim
        index.set_attribute("r1", "u1", "$email", &strings(&["x@y"]), None).unwrap();
        index.set_attribute("r1", "u2", "$email", &strings(&["x@y"]), None).unwrap();

        let err = index.find_unique_by_attribute("r1", "$email", "x@y").unwrap_err();
        match err {
            StoreError::IndexInconsistency { owners, .. } => assert_eq!(owners, vec!["u1", "u2"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_index_rows_follow_owner_ttl() {
        let (db, clock, _temp) = setup_db();
        let index = AttributeIndex::new(db, USER_SESSION_INDEX);

        index.set_attribute("r1", "s1", "user_id", &strings(&["u1"]), Some(30)).unwrap();
        clock.advance_secs(20);
        index.refresh_ttl("r1", "s1", Some(30)).unwrap();

        clock.advance_secs(20);
        assert_eq!(index.find_by_attribute("r1", "user_id", "u1").unwrap(), vec!["s1"]);

        clock.advance_secs(20);
        assert!(index.find_by_attribute("r1", "user_id", "u1").unwrap().is_empty());
    }
}
