use crate::error::StoreResult;
use crate::storage::models::{AuthenticationSession, Realm, RootAuthenticationSession};
use crate::storage::{Database, RowKey, Table};
use crate::ttl::put_expirable;

use super::new_id;

/// Root authentication sessions with their per-tab children embedded.
///
/// A root lives for the realm's longest access-code lifespan, counted from
/// its last change.
#[derive(Debug, Clone)]
pub struct AuthSessionRepository {
    db: Database,
}

impl AuthSessionRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn key(realm_id: &str, id: &str) -> RowKey {
        RowKey::new(realm_id, id)
    }

    fn write(
        &self,
        realm: &Realm,
        mut root: RootAuthenticationSession,
    ) -> StoreResult<RootAuthenticationSession> {
        root.timestamp = self.db.now_millis();
        root.expiration = Some(
            root.timestamp
                .saturating_add(realm.timeouts.auth_session_lifespan().saturating_mul(1000)),
        );
        put_expirable(
            &self.db,
            Table::AuthSessions,
            &Self::key(&realm.id, &root.id),
            &root,
        )?;
        Ok(root)
    }

    pub fn create_root(
        &self,
        realm: &Realm,
        id: Option<&str>,
    ) -> StoreResult<RootAuthenticationSession> {
        let root = RootAuthenticationSession {
            realm_id: realm.id.clone(),
            id: id.map_or_else(new_id, str::to_string),
            ..Default::default()
        };
        self.write(realm, root)
    }

    pub fn find_root(
        &self,
        realm_id: &str,
        id: &str,
    ) -> StoreResult<Option<RootAuthenticationSession>> {
        Ok(self
            .db
            .get_record(Table::AuthSessions, &Self::key(realm_id, id))?)
    }

    /// Open a new tab for `client_id` under an existing root.
    pub fn create_child(
        &self,
        realm: &Realm,
        root_id: &str,
        client_id: &str,
    ) -> StoreResult<Option<AuthenticationSession>> {
        let Some(mut root) = self.find_root(&realm.id, root_id)? else {
            return Ok(None);
        };
        let mut tab_id = new_tab_id();
        while root.sessions.contains_key(&tab_id) {
            tab_id = new_tab_id();
        }
        let child = AuthenticationSession {
            tab_id: tab_id.clone(),
            client_id: client_id.to_string(),
            timestamp: self.db.now_millis(),
            ..Default::default()
        };
        root.sessions.insert(tab_id, child.clone());
        self.write(realm, root)?;
        Ok(Some(child))
    }

    /// A tab's session, only if it belongs to `client_id`.
    pub fn find_child(
        &self,
        realm_id: &str,
        root_id: &str,
        client_id: &str,
        tab_id: &str,
    ) -> StoreResult<Option<AuthenticationSession>> {
        Ok(self.find_root(realm_id, root_id)?.and_then(|mut root| {
            root.sessions
                .remove(tab_id)
                .filter(|child| child.client_id == client_id)
        }))
    }

    pub fn update_child(
        &self,
        realm: &Realm,
        root_id: &str,
        child: &AuthenticationSession,
    ) -> StoreResult<bool> {
        let Some(mut root) = self.find_root(&realm.id, root_id)? else {
            return Ok(false);
        };
        let Some(existing) = root.sessions.get_mut(&child.tab_id) else {
            return Ok(false);
        };
        *existing = AuthenticationSession {
            timestamp: self.db.now_millis(),
            ..child.clone()
        };
        self.write(realm, root)?;
        Ok(true)
    }

    /// Remove one tab. The root goes with its last tab.
    pub fn remove_child(&self, realm: &Realm, root_id: &str, tab_id: &str) -> StoreResult<bool> {
        let Some(mut root) = self.find_root(&realm.id, root_id)? else {
            return Ok(false);
        };
        if root.sessions.remove(tab_id).is_none() {
            return Ok(false);
        }
        if root.sessions.is_empty() {
            self.remove_root(&realm.id, root_id)?;
        } else {
            self.write(realm, root)?;
        }
        Ok(true)
    }

    pub fn remove_root(&self, realm_id: &str, id: &str) -> StoreResult<bool> {
        Ok(self.db.delete(Table::AuthSessions, &Self::key(realm_id, id))?)
    }

    pub fn remove_all(&self, realm_id: &str) -> StoreResult<usize> {
        Ok(self.db.delete_partition(Table::AuthSessions, realm_id)?)
    }
}

fn new_tab_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(11);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_realm, setup_db};

    #[test]
    fn test_root_expires_after_longest_access_code_lifespan() {
        let (db, clock, _temp) = setup_db();
        let repo = AuthSessionRepository::new(db);
        let realm = make_realm("r1");

        let root = repo.create_root(&realm, Some("root-1")).unwrap();
        assert_eq!(root.expiration, Some(root.timestamp + 1_800_000));

        clock.advance_secs(1799);
        assert!(repo.find_root("r1", "root-1").unwrap().is_some());
        clock.advance_secs(1);
        assert!(repo.find_root("r1", "root-1").unwrap().is_none());
    }

    #[test]
    fn test_children_scoped_to_client() {
        let (db, _clock, _temp) = setup_db();
        let repo = AuthSessionRepository::new(db);
        let realm = make_realm("r1");
        let root = repo.create_root(&realm, None).unwrap();

        let tab = repo.create_child(&realm, &root.id, "app").unwrap().unwrap();
        assert_eq!(tab.tab_id.len(), 11);
        assert!(repo
            .find_child("r1", &root.id, "app", &tab.tab_id)
            .unwrap()
            .is_some());
        assert!(repo
            .find_child("r1", &root.id, "other", &tab.tab_id)
            .unwrap()
            .is_none());
        assert!(repo.create_child(&realm, "missing", "app").unwrap().is_none());
    }

    #[test]
    fn test_update_child_extends_root() {
        let (db, clock, _temp) = setup_db();
        let repo = AuthSessionRepository::new(db);
        let realm = make_realm("r1");
        let root = repo.create_root(&realm, None).unwrap();
        let mut tab = repo.create_child(&realm, &root.id, "app").unwrap().unwrap();

        clock.advance_secs(1000);
        tab.auth_notes.insert("step".to_string(), "otp".to_string());
        tab.required_actions.insert("UPDATE_PASSWORD".to_string());
        assert!(repo.update_child(&realm, &root.id, &tab).unwrap());

        clock.advance_secs(1000);
        let stored = repo
            .find_child("r1", &root.id, "app", &tab.tab_id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.auth_notes["step"], "otp");
        assert!(stored.required_actions.contains("UPDATE_PASSWORD"));
    }

    #[test]
    fn test_last_child_removes_root() {
        let (db, _clock, _temp) = setup_db();
        let repo = AuthSessionRepository::new(db);
        let realm = make_realm("r1");
        let root = repo.create_root(&realm, None).unwrap();
        let a = repo.create_child(&realm, &root.id, "app").unwrap().unwrap();
        let b = repo.create_child(&realm, &root.id, "app").unwrap().unwrap();

        assert!(repo.remove_child(&realm, &root.id, &a.tab_id).unwrap());
        assert!(repo.find_root("r1", &root.id).unwrap().is_some());
        assert!(repo.remove_child(&realm, &root.id, &b.tab_id).unwrap());
        assert!(repo.find_root("r1", &root.id).unwrap().is_none());
        assert!(!repo.remove_child(&realm, &root.id, &b.tab_id).unwrap());

        repo.create_root(&realm, None).unwrap();
        repo.create_root(&realm, None).unwrap();
        assert_eq!(repo.remove_all("r1").unwrap(), 2);
    }
}
