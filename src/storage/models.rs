use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::expiration::RealmTimeouts;
use crate::ttl::Expirable;

/// A tenant. Every other record is scoped to one realm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Realm {
    pub id: String,
    /// Unique across realms
    pub name: String,
    pub enabled: bool,
    pub duplicate_emails_allowed: bool,
    pub timeouts: RealmTimeouts,
    pub attributes: BTreeMap<String, String>,
}

/// An application registered in a realm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub realm_id: String,
    /// Internal id
    pub id: String,
    /// Public identifier, unique per realm
    pub client_id: String,
    pub enabled: bool,
    pub attributes: BTreeMap<String, String>,
    pub redirect_uris: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub realm_id: String,
    pub id: String,
    /// Stored lowercased
    pub username: String,
    /// Stored lowercased
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub enabled: bool,
    pub email_verified: bool,
    /// Epoch milliseconds
    pub created_timestamp: i64,
    pub federation_link: Option<String>,
    pub service_account_client_link: Option<String>,
    pub required_actions: BTreeSet<String>,
    /// Directly granted role ids (realm and client roles)
    pub role_ids: BTreeSet<String>,
    pub group_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Started,
    LoggedIn,
    LoggingOut,
    LoggedOut,
}

/// A user's SSO session. Client sessions are referenced by id only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserSession {
    pub realm_id: String,
    pub id: String,
    pub user_id: String,
    pub login_username: String,
    pub ip_address: Option<String>,
    pub auth_method: String,
    pub remember_me: bool,
    /// Session start, epoch milliseconds
    pub started: i64,
    /// Epoch milliseconds
    pub last_session_refresh: i64,
    pub state: SessionState,
    pub broker_session_id: Option<String>,
    pub broker_user_id: Option<String>,
    pub offline: bool,
    pub notes: BTreeMap<String, String>,
    /// Client (internal id) -> client session id
    pub client_sessions: BTreeMap<String, String>,
    /// Absolute deadline, epoch milliseconds
    pub expiration: Option<i64>,
}

/// A user session's state for one client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSession {
    pub realm_id: String,
    pub id: String,
    pub user_session_id: String,
    pub client_id: String,
    /// Last refresh by this client, epoch milliseconds
    pub timestamp: i64,
    pub auth_method: Option<String>,
    pub redirect_uri: Option<String>,
    pub action: Option<String>,
    pub offline: bool,
    pub notes: BTreeMap<String, String>,
    pub expiration: Option<i64>,
}

/// An in-progress login in one browser tab.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationSession {
    pub tab_id: String,
    pub client_id: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub action: Option<String>,
    pub protocol: Option<String>,
    pub redirect_uri: Option<String>,
    pub auth_user_id: Option<String>,
    pub client_notes: BTreeMap<String, String>,
    pub auth_notes: BTreeMap<String, String>,
    pub required_actions: BTreeSet<String>,
    pub execution_status: BTreeMap<String, String>,
}

/// All in-progress logins of one browser, keyed by tab id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootAuthenticationSession {
    pub realm_id: String,
    pub id: String,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub sessions: BTreeMap<String, AuthenticationSession>,
    pub expiration: Option<i64>,
}

/// Brute-force detection counters for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginFailure {
    pub realm_id: String,
    pub user_id: String,
    /// Epoch milliseconds
    pub failed_login_not_before: i64,
    pub num_failures: u32,
    /// Epoch milliseconds
    pub last_failure: i64,
    pub last_ip_failure: Option<String>,
}

/// A one-time token (action tokens, authorization codes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SingleUseObject {
    pub key: String,
    pub notes: BTreeMap<String, String>,
    pub expiration: Option<i64>,
}

impl Expirable for UserSession {
    fn expiration(&self) -> Option<i64> {
        self.expiration
    }
}

impl Expirable for ClientSession {
    fn expiration(&self) -> Option<i64> {
        self.expiration
    }
}

impl Expirable for RootAuthenticationSession {
    fn expiration(&self) -> Option<i64> {
        self.expiration
    }
}

impl Expirable for SingleUseObject {
    fn expiration(&self) -> Option<i64> {
        self.expiration
    }
}
