use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::tables::{Table, ROW_EXPIRY};

const SEPARATOR: char = '\u{1e}';

/// Expiry index key. Zero-padded so that lexicographic order is deadline order.
pub(crate) fn expiry_key(deadline_ms: i64, table: Table, row_key: &str) -> String {
    format!(
        "{:020}{SEPARATOR}{}{SEPARATOR}{row_key}",
        deadline_ms.max(0),
        table.name()
    )
}

/// Split an expiry index key back into (deadline, table, encoded row key).
pub(crate) fn parse_expiry_key(key: &str) -> Option<(i64, Table, &str)> {
    let mut parts = key.splitn(3, SEPARATOR);
    let deadline = parts.next()?.parse().ok()?;
    let table = Table::from_name(parts.next()?)?;
    let row_key = parts.next()?;
    Some((deadline, table, row_key))
}

impl Database {
    /// Physically remove rows whose TTL deadline has passed, walking the
    /// expiration index in deadline order (no full table scans).
    ///
    /// Reads already hide expired rows; this only reclaims space.
    pub fn delete_expired_rows(&self) -> Result<usize, DatabaseError> {
        let now_ms = self.now_millis();

        // Phase 1: read the expiration index to collect expired entries
        let expired: Vec<String> = {
            let read_txn = self.begin_read()?;
            let table = read_txn.open_table(ROW_EXPIRY)?;
            let mut result = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                let key_str = key.value().to_string();
                match parse_expiry_key(&key_str) {
                    Some((deadline, _, _)) if deadline <= now_ms => result.push(key_str),
                    Some(_) => break,
                    None => {
                        tracing::warn!(key = %key_str, "Dropping malformed expiry index entry");
                        result.push(key_str);
                    }
                }
            }
            result
        };

        if expired.is_empty() {
            return Ok(0);
        }

        // Phase 2: delete the rows that are still expired, then the index entries
        let write_txn = self.begin_write()?;
        let mut deleted = 0;

        for expiry_key_val in &expired {
            if let Some((_, table, row_key)) = parse_expiry_key(expiry_key_val) {
                let mut t = write_txn.open_table(table.definition())?;
                let still_expired = match t.get(row_key)? {
                    Some(data) => rmp_serde::from_slice::<super::rows::Row>(data.value())?
                        .expires_at
                        .is_some_and(|at| at <= now_ms),
                    None => false,
                };
                if still_expired {
                    t.remove(row_key)?;
                    deleted += 1;
                }
            }

            let mut expiry_table = write_txn.open_table(ROW_EXPIRY)?;
            expiry_table.remove(expiry_key_val.as_str())?;
        }

        write_txn.commit()?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RowKey;
    use crate::testutil::setup_db;

    #[test]
    fn test_expiry_key_orders_by_deadline() {
        let early = expiry_key(999, Table::UserSessions, "a");
        let late = expiry_key(1_000, Table::AuthSessions, "a");
        assert!(early < late);

        assert_eq!(
            parse_expiry_key(&late),
            Some((1_000, Table::AuthSessions, "a"))
        );
    }

    #[test]
    fn test_negative_deadline_clamps_to_zero() {
        let key = expiry_key(-50, Table::SingleUseObjects, "k");
        assert_eq!(parse_expiry_key(&key).map(|(d, _, _)| d), Some(0));
    }

    #[test]
    fn test_sweep_removes_only_expired_rows() {
        let (db, clock, _temp) = setup_db();
        db.put(Table::SingleUseObjects, &RowKey::single("short"), b"1", Some(5))
            .unwrap();
        db.put(Table::SingleUseObjects, &RowKey::single("long"), b"2", Some(50))
            .unwrap();
        db.put(Table::SingleUseObjects, &RowKey::single("forever"), b"3", None)
            .unwrap();

        assert_eq!(db.delete_expired_rows().unwrap(), 0);

        clock.advance_secs(10);
        assert_eq!(db.delete_expired_rows().unwrap(), 1);
        assert_eq!(db.scan_table(Table::SingleUseObjects).unwrap().len(), 2);

        clock.advance_secs(100);
        assert_eq!(db.delete_expired_rows().unwrap(), 1);
        assert_eq!(db.delete_expired_rows().unwrap(), 0);
    }

    #[test]
    fn test_sweep_skips_rows_rewritten_with_later_deadline() {
        let (db, clock, _temp) = setup_db();
        let key = RowKey::single("session");
        db.put(Table::UserSessions, &key, b"1", Some(5)).unwrap();
        db.put(Table::UserSessions, &key, b"2", Some(60)).unwrap();

        clock.advance_secs(10);
        assert_eq!(db.delete_expired_rows().unwrap(), 0);
        assert!(db.get(Table::UserSessions, &key).unwrap().is_some());
    }
}
