//! User sessions and their per-client sessions.
//!
//! Every write recomputes the session's absolute expiration from the realm
//! (and, for client sessions, the client) timeout policy, and the physical
//! TTL of the row and of its index rows is derived from it. An offline copy
//! of a session keeps the online session's id and is stored under its own
//! key.

use crate::cache::{QueryCache, QueryKey};
use crate::error::{StoreError, StoreResult};
use crate::expiration::{session_expiration, SessionTimes};
use crate::index::{AttributeIndex, USER_SESSION_INDEX};
use crate::storage::models::{Client, ClientSession, Realm, UserSession};
use crate::storage::{composite, Database, RowKey, Table};
use crate::ttl::put_expirable;

use super::new_id;

const USER_ID: &str = "user_id";
const BROKER_SESSION_ID: &str = "broker_session_id";
const BROKER_USER_ID: &str = "broker_user_id";
const CLIENT_ID: &str = "client_id";

const OFFLINE: &str = "offline";

#[derive(Debug)]
pub struct UserSessionRepository {
    db: Database,
    index: AttributeIndex,
    lookups: QueryCache<Option<UserSession>>,
}

impl UserSessionRepository {
    pub fn new(db: Database, cache_enabled: bool) -> Self {
        Self {
            index: AttributeIndex::new(db.clone(), USER_SESSION_INDEX),
            db,
            lookups: QueryCache::new(cache_enabled),
        }
    }

    /// Clustering key of a session row; also the entity id in the index.
    fn entity(id: &str, offline: bool) -> String {
        if offline {
            composite(&[id, OFFLINE])
        } else {
            id.to_string()
        }
    }

    fn key(realm_id: &str, entity: &str) -> RowKey {
        RowKey::new(realm_id, entity)
    }

    fn client_session_key(realm_id: &str, id: &str) -> RowKey {
        RowKey::new(realm_id, id)
    }

    fn load(&self, realm_id: &str, id: &str, offline: bool) -> StoreResult<Option<UserSession>> {
        Ok(self
            .db
            .get_record(Table::UserSessions, &Self::key(realm_id, &Self::entity(id, offline)))?)
    }

    fn resolve(&self, realm_id: &str, entities: Vec<String>) -> StoreResult<Vec<UserSession>> {
        let mut sessions = Vec::with_capacity(entities.len());
        for entity in entities {
            if let Some(session) = self
                .db
                .get_record::<UserSession>(Table::UserSessions, &Self::key(realm_id, &entity))?
            {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    fn find_indexed(
        &self,
        realm_id: &str,
        name: &str,
        value: &str,
        offline: bool,
    ) -> StoreResult<Vec<UserSession>> {
        let entities = self.index.find_by_attribute(realm_id, name, value)?;
        let mut sessions: Vec<UserSession> = self
            .resolve(realm_id, entities)?
            .into_iter()
            .filter(|s| s.offline == offline)
            .collect();
        sessions.sort_by(|a, b| a.started.cmp(&b.started).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    /// Recompute expiration, then write the session and its index rows with
    /// the resulting TTL.
    fn write(&self, realm: &Realm, mut session: UserSession) -> StoreResult<UserSession> {
        self.lookups.invalidate_all();
        session.expiration = Some(session_expiration(
            &realm.timeouts,
            None,
            SessionTimes {
                started: session.started,
                last_refresh: session.last_session_refresh,
                remember_me: session.remember_me,
                offline: session.offline,
            },
        ));

        let entity = Self::entity(&session.id, session.offline);
        let ttl = put_expirable(
            &self.db,
            Table::UserSessions,
            &Self::key(&realm.id, &entity),
            &session,
        )?;

        let indexed: [(&str, Vec<String>); 4] = [
            (USER_ID, vec![session.user_id.clone()]),
            (BROKER_SESSION_ID, session.broker_session_id.iter().cloned().collect()),
            (BROKER_USER_ID, session.broker_user_id.iter().cloned().collect()),
            (CLIENT_ID, session.client_sessions.keys().cloned().collect()),
        ];
        for (name, values) in &indexed {
            self.index
                .set_attribute(&realm.id, &entity, name, values, ttl)?;
        }
        Ok(session)
    }

    /// Start a session. `started` and `last_session_refresh` are set to now;
    /// an empty id is replaced by a fresh one.
    pub fn create(&self, realm: &Realm, mut session: UserSession) -> StoreResult<UserSession> {
        let now = self.db.now_millis();
        if session.id.is_empty() {
            session.id = new_id();
        }
        if self.load(&realm.id, &session.id, session.offline)?.is_some() {
            return Err(StoreError::duplicate("user session", session.id));
        }
        session.realm_id = realm.id.clone();
        session.started = now;
        session.last_session_refresh = now;

        let session = self.write(realm, session)?;
        tracing::debug!(
            realm_id = %realm.id,
            session_id = %session.id,
            offline = session.offline,
            expiration = ?session.expiration,
            "User session created"
        );
        Ok(session)
    }

    pub fn find_by_id(
        &self,
        realm_id: &str,
        id: &str,
        offline: bool,
    ) -> StoreResult<Option<UserSession>> {
        let entity = Self::entity(id, offline);
        let now = self.db.now_millis();
        let session = self
            .lookups
            .get_or_load(QueryKey::new("find_by_id", [realm_id, entity.as_str()]), || {
                self.load(realm_id, id, offline)
            })?;
        // a cached hit may have passed its deadline since it was loaded
        Ok(session.filter(|s| s.expiration.is_none_or(|at| at > now)))
    }

    pub fn find_by_user(
        &self,
        realm_id: &str,
        user_id: &str,
        offline: bool,
    ) -> StoreResult<Vec<UserSession>> {
        self.find_indexed(realm_id, USER_ID, user_id, offline)
    }

    pub fn find_by_broker_session(
        &self,
        realm_id: &str,
        broker_session_id: &str,
        offline: bool,
    ) -> StoreResult<Option<UserSession>> {
        Ok(self
            .find_indexed(realm_id, BROKER_SESSION_ID, broker_session_id, offline)?
            .into_iter()
            .next())
    }

    pub fn find_by_broker_user(
        &self,
        realm_id: &str,
        broker_user_id: &str,
        offline: bool,
    ) -> StoreResult<Vec<UserSession>> {
        self.find_indexed(realm_id, BROKER_USER_ID, broker_user_id, offline)
    }

    /// Sessions with a client session for `client_id` (internal id).
    pub fn find_by_client(
        &self,
        realm_id: &str,
        client_id: &str,
        offline: bool,
        first: Option<usize>,
        max: Option<usize>,
    ) -> StoreResult<Vec<UserSession>> {
        Ok(crate::aggregate::paginate(
            self.find_indexed(realm_id, CLIENT_ID, client_id, offline)?,
            first,
            max,
        ))
    }

    pub fn count_by_client(
        &self,
        realm_id: &str,
        client_id: &str,
        offline: bool,
    ) -> StoreResult<usize> {
        Ok(self
            .find_indexed(realm_id, CLIENT_ID, client_id, offline)?
            .len())
    }

    /// Mark the session as used now, pushing out its expiration.
    pub fn refresh(
        &self,
        realm: &Realm,
        id: &str,
        offline: bool,
    ) -> StoreResult<Option<UserSession>> {
        let Some(mut session) = self.load(&realm.id, id, offline)? else {
            return Ok(None);
        };
        session.last_session_refresh = self.db.now_millis();
        self.write(realm, session).map(Some)
    }

    /// Persist caller changes (state, notes, broker ids, ...).
    pub fn update(&self, realm: &Realm, session: &UserSession) -> StoreResult<bool> {
        if self.load(&realm.id, &session.id, session.offline)?.is_none() {
            return Ok(false);
        }
        self.write(realm, session.clone())?;
        Ok(true)
    }

    fn client_session_expiration(
        realm: &Realm,
        client: &Client,
        session: &UserSession,
        client_session: &ClientSession,
    ) -> i64 {
        session_expiration(
            &realm.timeouts,
            Some(&client.timeouts()),
            SessionTimes {
                started: session.started,
                last_refresh: client_session.timestamp,
                remember_me: session.remember_me,
                offline: client_session.offline,
            },
        )
    }

    /// Attach a new client session, replacing any previous one for the same
    /// client. Returns `None` when the user session does not exist.
    pub fn attach_client_session(
        &self,
        realm: &Realm,
        client: &Client,
        user_session_id: &str,
        offline: bool,
    ) -> StoreResult<Option<ClientSession>> {
        let Some(mut session) = self.load(&realm.id, user_session_id, offline)? else {
            return Ok(None);
        };

        let mut client_session = ClientSession {
            realm_id: realm.id.clone(),
            id: new_id(),
            user_session_id: session.id.clone(),
            client_id: client.id.clone(),
            timestamp: self.db.now_millis(),
            offline: session.offline,
            ..Default::default()
        };
        client_session.expiration = Some(Self::client_session_expiration(
            realm,
            client,
            &session,
            &client_session,
        ));
        put_expirable(
            &self.db,
            Table::ClientSessions,
            &Self::client_session_key(&realm.id, &client_session.id),
            &client_session,
        )?;

        if let Some(previous) = session
            .client_sessions
            .insert(client.id.clone(), client_session.id.clone())
        {
            self.db.delete(
                Table::ClientSessions,
                &Self::client_session_key(&realm.id, &previous),
            )?;
        }
        self.write(realm, session)?;
        Ok(Some(client_session))
    }

    /// The session's client session for `client_id`, if it still exists.
    pub fn find_client_session(
        &self,
        realm_id: &str,
        session: &UserSession,
        client_id: &str,
    ) -> StoreResult<Option<ClientSession>> {
        match session.client_sessions.get(client_id) {
            Some(id) => Ok(self
                .db
                .get_record(Table::ClientSessions, &Self::client_session_key(realm_id, id))?),
            None => Ok(None),
        }
    }

    /// Every client session of a user session; ids whose row has expired or
    /// been removed are skipped.
    pub fn client_sessions(
        &self,
        realm_id: &str,
        session: &UserSession,
    ) -> StoreResult<Vec<ClientSession>> {
        let mut found = Vec::with_capacity(session.client_sessions.len());
        for id in session.client_sessions.values() {
            if let Some(client_session) = self
                .db
                .get_record(Table::ClientSessions, &Self::client_session_key(realm_id, id))?
            {
                found.push(client_session);
            }
        }
        Ok(found)
    }

    /// Mark a client session as used now and recompute its expiration.
    pub fn refresh_client_session(
        &self,
        realm: &Realm,
        client: &Client,
        session: &UserSession,
    ) -> StoreResult<Option<ClientSession>> {
        let Some(mut client_session) = self.find_client_session(&realm.id, session, &client.id)?
        else {
            return Ok(None);
        };
        client_session.timestamp = self.db.now_millis();
        client_session.expiration = Some(Self::client_session_expiration(
            realm,
            client,
            session,
            &client_session,
        ));
        put_expirable(
            &self.db,
            Table::ClientSessions,
            &Self::client_session_key(&realm.id, &client_session.id),
            &client_session,
        )?;
        Ok(Some(client_session))
    }

    pub fn detach_client_session(
        &self,
        realm: &Realm,
        user_session_id: &str,
        offline: bool,
        client_id: &str,
    ) -> StoreResult<bool> {
        let Some(mut session) = self.load(&realm.id, user_session_id, offline)? else {
            return Ok(false);
        };
        let Some(id) = session.client_sessions.remove(client_id) else {
            return Ok(false);
        };
        self.db
            .delete(Table::ClientSessions, &Self::client_session_key(&realm.id, &id))?;
        self.write(realm, session)?;
        Ok(true)
    }

    /// Detach `client_id` from every online and offline session of the realm.
    pub fn detach_client_everywhere(&self, realm: &Realm, client_id: &str) -> StoreResult<usize> {
        let mut detached = 0;
        for offline in [false, true] {
            for session in self.find_indexed(&realm.id, CLIENT_ID, client_id, offline)? {
                if self.detach_client_session(realm, &session.id, offline, client_id)? {
                    detached += 1;
                }
            }
        }
        Ok(detached)
    }

    /// Store an offline copy of an online session. Client sessions are not
    /// copied; attach them to the copy individually.
    pub fn create_offline_copy(
        &self,
        realm: &Realm,
        session: &UserSession,
    ) -> StoreResult<UserSession> {
        let copy = UserSession {
            offline: true,
            client_sessions: Default::default(),
            ..session.clone()
        };
        self.create(realm, copy)
    }

    /// Remove a session, its client sessions and its index rows.
    pub fn remove(&self, realm_id: &str, id: &str, offline: bool) -> StoreResult<bool> {
        self.lookups.invalidate_all();
        let entity = Self::entity(id, offline);
        let Some(row) = self
            .db
            .take(Table::UserSessions, &Self::key(realm_id, &entity))?
        else {
            self.index.remove_all_attributes_of(realm_id, &entity)?;
            return Ok(false);
        };

        let session: UserSession = row.decode()?;
        for client_session_id in session.client_sessions.values() {
            self.db.delete(
                Table::ClientSessions,
                &Self::client_session_key(realm_id, client_session_id),
            )?;
        }
        self.index.remove_all_attributes_of(realm_id, &entity)?;
        Ok(true)
    }

    /// Remove every online and offline session of a user.
    pub fn remove_by_user(&self, realm_id: &str, user_id: &str) -> StoreResult<usize> {
        let entities = self.index.find_by_attribute(realm_id, USER_ID, user_id)?;
        let mut removed = 0;
        for session in self.resolve(realm_id, entities)? {
            if self.remove(realm_id, &session.id, session.offline)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn remove_all(&self, realm_id: &str) -> StoreResult<usize> {
        self.lookups.invalidate_all();
        let sessions = self.db.scan_partition(Table::UserSessions, realm_id)?;
        for (key, _) in &sessions {
            self.index.remove_all_attributes_of(realm_id, &key.clustering)?;
        }
        self.db.delete_partition(Table::UserSessions, realm_id)?;
        self.db.delete_partition(Table::ClientSessions, realm_id)?;
        Ok(sessions.len())
    }
}
