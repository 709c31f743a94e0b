use crate::error::StoreResult;
use crate::storage::models::LoginFailure;
use crate::storage::{Database, RowKey, Table};

/// Brute-force counters, one row per (realm, user). Rows do not expire;
/// they are cleared on successful login or removed with the user.
#[derive(Debug, Clone)]
pub struct LoginFailureRepository {
    db: Database,
}

impl LoginFailureRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn key(realm_id: &str, user_id: &str) -> RowKey {
        RowKey::new(realm_id, user_id)
    }

    pub fn get(&self, realm_id: &str, user_id: &str) -> StoreResult<Option<LoginFailure>> {
        Ok(self
            .db
            .get_record(Table::LoginFailures, &Self::key(realm_id, user_id))?)
    }

    /// Count one failed login from `ip_address`, creating the row if needed.
    pub fn record_failure(
        &self,
        realm_id: &str,
        user_id: &str,
        ip_address: Option<&str>,
    ) -> StoreResult<LoginFailure> {
        let mut failure = self.get(realm_id, user_id)?.unwrap_or_else(|| LoginFailure {
            realm_id: realm_id.to_string(),
            user_id: user_id.to_string(),
            ..Default::default()
        });
        failure.num_failures = failure.num_failures.saturating_add(1);
        failure.last_failure = self.db.now_millis();
        failure.last_ip_failure = ip_address.map(str::to_string);

        self.db.put_record(
            Table::LoginFailures,
            &Self::key(realm_id, user_id),
            &failure,
            None,
        )?;
        tracing::debug!(
            realm_id = %realm_id,
            user_id = %user_id,
            failures = failure.num_failures,
            "Login failure recorded"
        );
        Ok(failure)
    }

    /// Lock the user out until `not_before` (epoch milliseconds).
    pub fn set_failed_login_not_before(
        &self,
        realm_id: &str,
        user_id: &str,
        not_before: i64,
    ) -> StoreResult<bool> {
        let Some(mut failure) = self.get(realm_id, user_id)? else {
            return Ok(false);
        };
        failure.failed_login_not_before = not_before;
        self.db.put_record(
            Table::LoginFailures,
            &Self::key(realm_id, user_id),
            &failure,
            None,
        )?;
        Ok(true)
    }

    /// Reset every counter but keep the row.
    pub fn clear(&self, realm_id: &str, user_id: &str) -> StoreResult<bool> {
        let Some(failure) = self.get(realm_id, user_id)? else {
            return Ok(false);
        };
        let cleared = LoginFailure {
            realm_id: failure.realm_id,
            user_id: failure.user_id,
            ..Default::default()
        };
        self.db.put_record(
            Table::LoginFailures,
            &Self::key(realm_id, user_id),
            &cleared,
            None,
        )?;
        Ok(true)
    }

    pub fn remove(&self, realm_id: &str, user_id: &str) -> StoreResult<bool> {
        Ok(self
            .db
            .delete(Table::LoginFailures, &Self::key(realm_id, user_id))?)
    }

    pub fn remove_all(&self, realm_id: &str) -> StoreResult<usize> {
        Ok(self.db.delete_partition(Table::LoginFailures, realm_id)?)
    }
}
