//! Entry point for hosts: one [`IdentityStore`] per process, one
//! [`StoreContext`] per unit of work.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::aggregate::{ClientScopeStore, GroupStore, GroupValue, RoleStore, RoleValue};
use crate::config::Config;
use crate::error::StoreResult;
use crate::expiration::start_expiration_cleaner;
use crate::repository::{
    AuthSessionRepository, ClientRepository, LoginFailureRepository, RealmRepository,
    SingleUseObjectRepository, UserRepository, UserSessionRepository,
};
use crate::storage::models::{Realm, User};
use crate::storage::{Database, DatabaseError};
use crate::uow::Transaction;

#[derive(Debug, Clone)]
pub struct IdentityStore {
    db: Database,
    config: Config,
}

impl IdentityStore {
    /// Open the database under `config.storage.data_dir`.
    pub fn open(config: Config) -> Result<Self, DatabaseError> {
        let db = Database::open(&config.storage.data_dir)?;
        Ok(Self { db, config })
    }

    pub fn with_database(db: Database, config: Config) -> Self {
        Self { db, config }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the background TTL sweeper.
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        start_expiration_cleaner(
            self.db.clone(),
            Duration::from_secs(self.config.storage.cleanup_interval_seconds),
        )
    }

    /// Begin a unit of work.
    pub fn begin(&self) -> StoreContext {
        let transaction = Transaction::begin();
        let linearizable = self.config.linearizable_aggregates;
        let cache = self.config.query_cache_enabled;
        let db = &self.db;

        StoreContext {
            roles: RoleStore::attach(db.clone(), &transaction, linearizable),
            groups: GroupStore::attach(db.clone(), &transaction, linearizable),
            client_scopes: ClientScopeStore::attach(db.clone(), &transaction, linearizable),
            realms: RealmRepository::new(db.clone(), cache),
            clients: ClientRepository::new(db.clone(), cache),
            users: UserRepository::new(db.clone(), cache),
            user_sessions: UserSessionRepository::new(db.clone(), cache),
            auth_sessions: AuthSessionRepository::new(db.clone()),
            login_failures: LoginFailureRepository::new(db.clone()),
            single_use: SingleUseObjectRepository::new(db.clone()),
            transaction,
        }
    }
}

/// Everything one unit of work touches. Aggregate mutations are written
/// back on [`commit`](Self::commit); dropping the context without
/// committing discards them.
pub struct StoreContext {
    transaction: Transaction,
    pub roles: RoleStore,
    pub groups: GroupStore,
    pub client_scopes: ClientScopeStore,
    pub realms: RealmRepository,
    pub clients: ClientRepository,
    pub users: UserRepository,
    pub user_sessions: UserSessionRepository,
    pub auth_sessions: AuthSessionRepository,
    pub login_failures: LoginFailureRepository,
    pub single_use: SingleUseObjectRepository,
}

impl StoreContext {
    pub fn id(&self) -> Uuid {
        self.transaction.id()
    }

    pub fn commit(self) -> StoreResult<()> {
        self.transaction.commit()
    }

    pub fn abort(self) {
        self.transaction.abort();
    }

    /// Remove a realm and everything scoped to it.
    pub fn remove_realm(&self, realm_id: &str) -> StoreResult<bool> {
        let Some(realm) = self.realms.find_by_id(realm_id)? else {
            return Ok(false);
        };

        let sessions = self.user_sessions.remove_all(realm_id)?;
        let auth_sessions = self.auth_sessions.remove_all(realm_id)?;
        let failures = self.login_failures.remove_all(realm_id)?;
        let users = self.users.remove_all(realm_id)?;
        let clients = self.clients.remove_all(realm_id)?;
        self.roles.delete(realm_id)?;
        self.groups.delete(realm_id)?;
        self.client_scopes.delete(realm_id)?;
        self.realms.remove(realm_id)?;

        tracing::info!(
            realm_id = %realm_id,
            name = %realm.name,
            users,
            clients,
            sessions,
            auth_sessions,
            failures,
            "Realm removed"
        );
        Ok(true)
    }

    /// Remove a client with its roles, detaching it from every session.
    pub fn remove_client(&self, realm: &Realm, id: &str) -> StoreResult<bool> {
        if self.clients.find_by_id(&realm.id, id)?.is_none() {
            return Ok(false);
        }
        self.roles.remove_client_roles(&realm.id, id)?;
        self.user_sessions.detach_client_everywhere(realm, id)?;
        self.clients.remove(&realm.id, id)
    }

    /// Remove a user with their sessions and login failures.
    pub fn remove_user(&self, realm_id: &str, id: &str) -> StoreResult<bool> {
        self.user_sessions.remove_by_user(realm_id, id)?;
        self.login_failures.remove(realm_id, id)?;
        self.users.remove(realm_id, id)
    }

    /// Groups the user belongs to; memberships of removed groups are skipped.
    pub fn user_groups(&self, realm_id: &str, user: &User) -> StoreResult<Vec<GroupValue>> {
        self.groups.resolve_groups(realm_id, &user.group_ids)
    }

    /// Directly granted roles that still exist.
    pub fn user_role_mappings(&self, realm_id: &str, user: &User) -> StoreResult<Vec<RoleValue>> {
        self.roles.resolve(realm_id, &user.role_ids)
    }

    /// Whether the user holds `role_id` directly, through a composite, or
    /// through a group or one of its ancestors.
    pub fn user_has_role(&self, realm_id: &str, user: &User, role_id: &str) -> StoreResult<bool> {
        let mut granted: BTreeSet<String> = user.role_ids.clone();
        granted.extend(self.groups.inherited_role_ids(realm_id, &user.group_ids)?);
        self.roles.has_role(realm_id, &granted, role_id)
    }
}
