//! Shared test helpers, available to all `#[cfg(test)]` modules in the crate.

use std::sync::Arc;

use tempfile::TempDir;

use crate::clock::ManualClock;
use crate::config::Config;
use crate::expiration::RealmTimeouts;
use crate::provider::IdentityStore;
use crate::storage::models::{Client, Realm, UserSession};
use crate::storage::Database;

/// Epoch milliseconds every test clock starts at.
pub const TEST_EPOCH_MILLIS: i64 = 1_700_000_000_000;

/// Open a fresh database in a temporary directory, driven by a manual clock.
///
/// The caller must keep the `TempDir` alive for the duration of the test.
pub fn setup_db() -> (Database, Arc<ManualClock>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(TEST_EPOCH_MILLIS));
    let db = Database::open_with_clock(temp_dir.path(), clock.clone()).unwrap();
    (db, clock, temp_dir)
}

/// A store over [`setup_db`] with linearizable write-back and the query
/// cache enabled.
pub fn setup_store() -> (IdentityStore, Arc<ManualClock>, TempDir) {
    let (db, clock, temp_dir) = setup_db();
    let config = Config {
        linearizable_aggregates: true,
        ..Config::default()
    };
    (IdentityStore::with_database(db, config), clock, temp_dir)
}

/// An enabled realm with default timeouts, named after its id.
pub fn make_realm(id: &str) -> Realm {
    Realm {
        id: id.to_string(),
        name: id.to_string(),
        enabled: true,
        duplicate_emails_allowed: false,
        timeouts: RealmTimeouts::default(),
        ..Default::default()
    }
}

pub fn make_client(realm_id: &str, client_id: &str) -> Client {
    Client {
        realm_id: realm_id.to_string(),
        id: uuid::Uuid::new_v4().to_string(),
        client_id: client_id.to_string(),
        enabled: true,
        ..Default::default()
    }
}

/// A password login for `user_id`; the repository assigns the id.
pub fn make_user_session(user_id: &str) -> UserSession {
    UserSession {
        user_id: user_id.to_string(),
        login_username: format!("{user_id}-login"),
        auth_method: "password".to_string(),
        ..Default::default()
    }
}
