use redb::{ReadableTable, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::db::{Database, DatabaseError};
use super::expiry::expiry_key;
use super::tables::{Table, ROW_EXPIRY};

/// Separates the partition from the clustering key in an encoded row key.
/// Partition keys must not contain it.
const PARTITION_END: char = '\u{0}';

/// Separates the parts of a composite partition key.
const PART_SEPARATOR: char = '\u{1f}';

/// Address of a physical row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub partition: String,
    pub clustering: String,
}

impl RowKey {
    pub fn new(partition: impl Into<String>, clustering: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            clustering: clustering.into(),
        }
    }

    /// A partition holding exactly one row.
    pub fn single(partition: impl Into<String>) -> Self {
        Self::new(partition, "")
    }

    pub fn encode(&self) -> String {
        format!("{}{PARTITION_END}{}", self.partition, self.clustering)
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        let (partition, clustering) = encoded.split_once(PARTITION_END)?;
        Some(Self::new(partition, clustering))
    }

    fn partition_prefix(partition: &str) -> String {
        format!("{partition}{PARTITION_END}")
    }
}

/// Join several parts into one partition key.
pub fn composite(parts: &[&str]) -> String {
    let mut key = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(PART_SEPARATOR);
        }
        key.push_str(part);
    }
    key
}

/// Envelope stored for every row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Absolute deadline (epoch ms) derived from the per-write TTL.
    pub expires_at: Option<i64>,
    /// Incremented on every write to the key.
    pub version: u64,
    pub payload: Vec<u8>,
}

impl Row {
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at.is_none_or(|at| at > now_ms)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DatabaseError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalWrite {
    Applied { version: u64 },
    Rejected { current: Option<u64> },
}

impl ConditionalWrite {
    pub fn applied(&self) -> bool {
        matches!(self, ConditionalWrite::Applied { .. })
    }
}

// ============================================================================
// Transaction-level helpers
// ============================================================================

fn load_row(txn: &WriteTransaction, table: Table, key: &str) -> Result<Option<Row>, DatabaseError> {
    let t = txn.open_table(table.definition())?;
    let row = match t.get(key)? {
        Some(data) => Some(rmp_serde::from_slice::<Row>(data.value())?),
        None => None,
    };
    Ok(row)
}

fn store_row(
    txn: &WriteTransaction,
    table: Table,
    key: &str,
    row: &Row,
    previous: Option<&Row>,
) -> Result<(), DatabaseError> {
    {
        let mut t = txn.open_table(table.definition())?;
        let data = rmp_serde::to_vec_named(row)?;
        t.insert(key, data.as_slice())?;
    }

    let mut expiry_table = txn.open_table(ROW_EXPIRY)?;
    if let Some(at) = previous.and_then(|p| p.expires_at) {
        expiry_table.remove(expiry_key(at, table, key).as_str())?;
    }
    if let Some(at) = row.expires_at {
        expiry_table.insert(expiry_key(at, table, key).as_str(), "")?;
    }
    Ok(())
}

fn remove_row(
    txn: &WriteTransaction,
    table: Table,
    key: &str,
) -> Result<Option<Row>, DatabaseError> {
    let removed = {
        let mut t = txn.open_table(table.definition())?;
        let result = match t.remove(key)? {
            Some(data) => Some(rmp_serde::from_slice::<Row>(data.value())?),
            None => None,
        };
        result
    };

    if let Some(at) = removed.as_ref().and_then(|r| r.expires_at) {
        let mut expiry_table = txn.open_table(ROW_EXPIRY)?;
        expiry_table.remove(expiry_key(at, table, key).as_str())?;
    }
    Ok(removed)
}

/// Encoded keys of every row in `partition`, live or not.
fn partition_keys(
    txn: &WriteTransaction,
    table: Table,
    partition: &str,
) -> Result<Vec<(String, Row)>, DatabaseError> {
    let prefix = RowKey::partition_prefix(partition);
    let t = txn.open_table(table.definition())?;
    let mut rows = Vec::new();
    for entry in t.range::<&str>(prefix.as_str()..)? {
        let (key, value) = entry?;
        let key = key.value();
        if !key.starts_with(prefix.as_str()) {
            break;
        }
        rows.push((key.to_string(), rmp_serde::from_slice::<Row>(value.value())?));
    }
    Ok(rows)
}

impl Database {
    fn new_row(&self, previous: Option<&Row>, payload: &[u8], ttl_seconds: Option<i32>) -> Row {
        let now = self.now_millis();
        Row {
            expires_at: ttl_seconds.map(|ttl| now.saturating_add(i64::from(ttl) * 1000)),
            version: previous.map_or(1, |p| p.version + 1),
            payload: payload.to_vec(),
        }
    }

    // ========================================================================
    // Unconditional writes
    // ========================================================================

    /// Upsert a row. `ttl_seconds` of `None` writes without expiry; a TTL of
    /// zero or less yields a row that is already expired.
    pub fn put(
        &self,
        table: Table,
        key: &RowKey,
        payload: &[u8],
        ttl_seconds: Option<i32>,
    ) -> Result<u64, DatabaseError> {
        let encoded = key.encode();
        let write_txn = self.begin_write()?;
        let previous = load_row(&write_txn, table, &encoded)?;
        let row = self.new_row(previous.as_ref(), payload, ttl_seconds);
        store_row(&write_txn, table, &encoded, &row, previous.as_ref())?;
        write_txn.commit()?;
        Ok(row.version)
    }

    /// Delete a row. Returns whether a live row was removed.
    pub fn delete(&self, table: Table, key: &RowKey) -> Result<bool, DatabaseError> {
        Ok(self.take(table, key)?.is_some())
    }

    /// Delete a row and return its live contents, in one linearizable step.
    pub fn take(&self, table: Table, key: &RowKey) -> Result<Option<Row>, DatabaseError> {
        let now = self.now_millis();
        let write_txn = self.begin_write()?;
        let removed = remove_row(&write_txn, table, &key.encode())?;
        write_txn.commit()?;
        Ok(removed.filter(|r| r.is_live(now)))
    }

    /// Delete every row of a partition. Returns the number of live rows removed.
    pub fn delete_partition(&self, table: Table, partition: &str) -> Result<usize, DatabaseError> {
        let now = self.now_millis();
        let write_txn = self.begin_write()?;
        let mut deleted = 0;
        for (key, row) in partition_keys(&write_txn, table, partition)? {
            remove_row(&write_txn, table, &key)?;
            if row.is_live(now) {
                deleted += 1;
            }
        }
        write_txn.commit()?;
        Ok(deleted)
    }

    // ========================================================================
    // Conditional (linearizable) writes
    // ========================================================================

    /// Insert only when no live row exists at `key`.
    pub fn put_if_absent(
        &self,
        table: Table,
        key: &RowKey,
        payload: &[u8],
        ttl_seconds: Option<i32>,
    ) -> Result<bool, DatabaseError> {
        Ok(self
            .put_if_version(table, key, payload, None, ttl_seconds)?
            .applied())
    }

    /// Write only when the live row's version equals `expected`
    /// (`None` meaning the row must be absent or expired).
    pub fn put_if_version(
        &self,
        table: Table,
        key: &RowKey,
        payload: &[u8],
        expected: Option<u64>,
        ttl_seconds: Option<i32>,
    ) -> Result<ConditionalWrite, DatabaseError> {
        let now = self.now_millis();
        let encoded = key.encode();
        let write_txn = self.begin_write()?;
        let previous = load_row(&write_txn, table, &encoded)?;
        let current = previous.as_ref().filter(|r| r.is_live(now)).map(|r| r.version);

        if current != expected {
            write_txn.abort()?;
            return Ok(ConditionalWrite::Rejected { current });
        }

        let row = self.new_row(previous.as_ref(), payload, ttl_seconds);
        store_row(&write_txn, table, &encoded, &row, previous.as_ref())?;
        write_txn.commit()?;
        Ok(ConditionalWrite::Applied {
            version: row.version,
        })
    }

    /// Insert only when no other live row exists in the key's partition.
    /// Rewriting the row already held at `key` is allowed.
    pub fn put_if_partition_vacant(
        &self,
        table: Table,
        key: &RowKey,
        payload: &[u8],
        ttl_seconds: Option<i32>,
    ) -> Result<bool, DatabaseError> {
        let now = self.now_millis();
        let encoded = key.encode();
        let write_txn = self.begin_write()?;

        let rows = partition_keys(&write_txn, table, &key.partition)?;
        let occupied = rows
            .iter()
            .any(|(k, row)| k != &encoded && row.is_live(now));
        if occupied {
            write_txn.abort()?;
            return Ok(false);
        }

        let previous = rows.into_iter().find(|(k, _)| k == &encoded).map(|(_, r)| r);
        let row = self.new_row(previous.as_ref(), payload, ttl_seconds);
        store_row(&write_txn, table, &encoded, &row, previous.as_ref())?;
        write_txn.commit()?;
        Ok(true)
    }

    // ========================================================================
    // Reads (expired rows are invisible)
    // ========================================================================

    pub fn get(&self, table: Table, key: &RowKey) -> Result<Option<Row>, DatabaseError> {
        let now = self.now_millis();
        let read_txn = self.begin_read()?;
        let t = read_txn.open_table(table.definition())?;

        let row = match t.get(key.encode().as_str())? {
            Some(data) => Some(rmp_serde::from_slice::<Row>(data.value())?),
            None => None,
        };
        Ok(row.filter(|r| r.is_live(now)))
    }

    /// Every live row in a partition, ordered by clustering key.
    pub fn scan_partition(
        &self,
        table: Table,
        partition: &str,
    ) -> Result<Vec<(RowKey, Row)>, DatabaseError> {
        let now = self.now_millis();
        let prefix = RowKey::partition_prefix(partition);
        let read_txn = self.begin_read()?;
        let t = read_txn.open_table(table.definition())?;

        let mut rows = Vec::new();
        for entry in t.range::<&str>(prefix.as_str()..)? {
            let (key, value) = entry?;
            let key = key.value();
            if !key.starts_with(prefix.as_str()) {
                break;
            }
            let row: Row = rmp_serde::from_slice(value.value())?;
            if let (true, Some(row_key)) = (row.is_live(now), RowKey::decode(key)) {
                rows.push((row_key, row));
            }
        }
        Ok(rows)
    }

    /// Every live row in a table.
    pub fn scan_table(&self, table: Table) -> Result<Vec<(RowKey, Row)>, DatabaseError> {
        let now = self.now_millis();
        let read_txn = self.begin_read()?;
        let t = read_txn.open_table(table.definition())?;

        let mut rows = Vec::new();
        for entry in t.iter()? {
            let (key, value) = entry?;
            let row: Row = rmp_serde::from_slice(value.value())?;
            if let (true, Some(row_key)) = (row.is_live(now), RowKey::decode(key.value())) {
                rows.push((row_key, row));
            }
        }
        Ok(rows)
    }

    // ========================================================================
    // Typed helpers
    // ========================================================================

    pub fn put_record<T: Serialize>(
        &self,
        table: Table,
        key: &RowKey,
        record: &T,
        ttl_seconds: Option<i32>,
    ) -> Result<u64, DatabaseError> {
        let data = rmp_serde::to_vec_named(record)?;
        self.put(table, key, &data, ttl_seconds)
    }

    pub fn get_record<T: DeserializeOwned>(
        &self,
        table: Table,
        key: &RowKey,
    ) -> Result<Option<T>, DatabaseError> {
        self.get(table, key)?.map(|row| row.decode()).transpose()
    }

    pub fn scan_records<T: DeserializeOwned>(
        &self,
        table: Table,
        partition: &str,
    ) -> Result<Vec<T>, DatabaseError> {
        self.scan_partition(table, partition)?
            .into_iter()
            .map(|(_, row)| row.decode())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::Clock;
    use crate::testutil::setup_db;

    use super::*;

    #[test]
    fn test_row_key_round_trips_through_encoding() {
        let key = RowKey::new(composite(&["realm", "email", "a@b"]), "user-1");
        assert_eq!(RowKey::decode(&key.encode()), Some(key));
    }

    #[test]
    fn test_put_get_delete() {
        let (db, _clock, _temp) = setup_db();
        let key = RowKey::new("realm-1", "u1");

        assert_eq!(db.put(Table::Users, &key, b"one", None).unwrap(), 1);
        assert_eq!(db.put(Table::Users, &key, b"two", None).unwrap(), 2);

        let row = db.get(Table::Users, &key).unwrap().unwrap();
        assert_eq!(row.payload, b"two");
        assert_eq!(row.version, 2);
        assert_eq!(row.expires_at, None);

        assert!(db.delete(Table::Users, &key).unwrap());
        assert!(!db.delete(Table::Users, &key).unwrap());
        assert!(db.get(Table::Users, &key).unwrap().is_none());
    }

    #[test]
    fn test_ttl_hides_row_once_deadline_passes() {
        let (db, clock, _temp) = setup_db();
        let key = RowKey::single("obj");

        db.put(Table::SingleUseObjects, &key, b"x", Some(10)).unwrap();
        let row = db.get(Table::SingleUseObjects, &key).unwrap().unwrap();
        assert_eq!(row.expires_at, Some(clock.now_millis() + 10_000));

        clock.advance_secs(9);
        assert!(db.get(Table::SingleUseObjects, &key).unwrap().is_some());

        clock.advance_secs(1);
        assert!(db.get(Table::SingleUseObjects, &key).unwrap().is_none());
    }

    #[test]
    fn test_non_positive_ttl_is_written_already_expired() {
        let (db, _clock, _temp) = setup_db();
        let key = RowKey::single("late");

        db.put(Table::SingleUseObjects, &key, b"x", Some(0)).unwrap();
        assert!(db.get(Table::SingleUseObjects, &key).unwrap().is_none());

        db.put(Table::SingleUseObjects, &key, b"x", Some(-5)).unwrap();
        assert!(db.get(Table::SingleUseObjects, &key).unwrap().is_none());
    }

    #[test]
    fn test_scan_partition_does_not_leak_into_prefixed_partitions() {
        let (db, _clock, _temp) = setup_db();
        db.put(Table::Users, &RowKey::new("r", "a"), b"1", None).unwrap();
        db.put(Table::Users, &RowKey::new("r", "b"), b"2", None).unwrap();
        db.put(Table::Users, &RowKey::new("r2", "c"), b"3", None).unwrap();

        let rows = db.scan_partition(Table::Users, "r").unwrap();
        let clustering: Vec<&str> = rows.iter().map(|(k, _)| k.clustering.as_str()).collect();
        assert_eq!(clustering, vec!["a", "b"]);

        assert_eq!(db.delete_partition(Table::Users, "r").unwrap(), 2);
        assert!(db.scan_partition(Table::Users, "r").unwrap().is_empty());
        assert_eq!(db.scan_partition(Table::Users, "r2").unwrap().len(), 1);
    }

    #[test]
    fn test_put_if_absent_treats_expired_rows_as_absent() {
        let (db, clock, _temp) = setup_db();
        let key = RowKey::single("code");

        assert!(db.put_if_absent(Table::SingleUseObjects, &key, b"a", Some(5)).unwrap());
        assert!(!db.put_if_absent(Table::SingleUseObjects, &key, b"b", Some(5)).unwrap());

        clock.advance_secs(6);
        assert!(db.put_if_absent(Table::SingleUseObjects, &key, b"c", Some(5)).unwrap());
        let row = db.get(Table::SingleUseObjects, &key).unwrap().unwrap();
        assert_eq!(row.payload, b"c");
    }

    #[test]
    fn test_put_if_version_rejects_stale_writers() {
        let (db, _clock, _temp) = setup_db();
        let key = RowKey::single("realm-1");

        let first = db.put_if_version(Table::RealmRoles, &key, b"v1", None, None).unwrap();
        assert_eq!(first, ConditionalWrite::Applied { version: 1 });

        let stale = db.put_if_version(Table::RealmRoles, &key, b"x", None, None).unwrap();
        assert_eq!(stale, ConditionalWrite::Rejected { current: Some(1) });

        let second = db
            .put_if_version(Table::RealmRoles, &key, b"v2", Some(1), None)
            .unwrap();
        assert_eq!(second, ConditionalWrite::Applied { version: 2 });
    }

    #[test]
    fn test_put_if_partition_vacant() {
        let (db, _clock, _temp) = setup_db();
        let owner = RowKey::new("realm\u{1f}username\u{1f}alice", "u1");
        let intruder = RowKey::new("realm\u{1f}username\u{1f}alice", "u2");

        assert!(db.put_if_partition_vacant(Table::AttributeUsers, &owner, b"", None).unwrap());
        // The owner may rewrite its own claim
        assert!(db.put_if_partition_vacant(Table::AttributeUsers, &owner, b"", None).unwrap());
        assert!(!db.put_if_partition_vacant(Table::AttributeUsers, &intruder, b"", None).unwrap());

        db.delete(Table::AttributeUsers, &owner).unwrap();
        assert!(db.put_if_partition_vacant(Table::AttributeUsers, &intruder, b"", None).unwrap());
    }

    #[test]
    fn test_take_returns_live_contents_once() {
        let (db, _clock, _temp) = setup_db();
        let key = RowKey::single("once");
        db.put(Table::SingleUseObjects, &key, b"notes", Some(60)).unwrap();

        let taken = db.take(Table::SingleUseObjects, &key).unwrap().unwrap();
        assert_eq!(taken.payload, b"notes");
        assert!(db.take(Table::SingleUseObjects, &key).unwrap().is_none());
    }
}
