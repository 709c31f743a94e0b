use std::collections::BTreeMap;

use crate::aggregate::{matches_search, paginate};
use crate::cache::{QueryCache, QueryKey};
use crate::error::{StoreError, StoreResult};
use crate::index::{AttributeIndex, USER_INDEX};
use crate::storage::models::{Realm, User};
use crate::storage::{Database, RowKey, Table};

use super::new_id;

// Index names used internally start with '$' and are hidden from callers.
const USERNAME: &str = "$username";
const EMAIL: &str = "$email";
const FEDERATION_LINK: &str = "$federation_link";
const SERVICE_ACCOUNT_CLIENT: &str = "$service_account_client";

fn is_internal(name: &str) -> bool {
    name.starts_with('$')
}

#[derive(Debug)]
pub struct UserRepository {
    db: Database,
    index: AttributeIndex,
    lookups: QueryCache<Option<User>>,
    lists: QueryCache<Vec<User>>,
}

impl UserRepository {
    pub fn new(db: Database, cache_enabled: bool) -> Self {
        Self {
            index: AttributeIndex::new(db.clone(), USER_INDEX),
            db,
            lookups: QueryCache::new(cache_enabled),
            lists: QueryCache::new(cache_enabled),
        }
    }

    fn key(realm_id: &str, id: &str) -> RowKey {
        RowKey::new(realm_id, id)
    }

    fn invalidate(&self) {
        self.lookups.invalidate_all();
        self.lists.invalidate_all();
    }

    fn load(&self, realm_id: &str, id: &str) -> StoreResult<Option<User>> {
        Ok(self.db.get_record(Table::Users, &Self::key(realm_id, id))?)
    }

    /// Resolve index hits to users, dropping ids that no longer resolve.
    fn resolve(&self, realm_id: &str, ids: Vec<String>) -> StoreResult<Vec<User>> {
        let mut users = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(user) = self.load(realm_id, &id)? {
                users.push(user);
            }
        }
        Ok(users)
    }

    /// Whether the stored user still carries `value` for an internal unique
    /// attribute.
    fn holds(&self, realm_id: &str, id: &str, name: &str, value: &str) -> StoreResult<bool> {
        let Some(user) = self.load(realm_id, id)? else {
            return Ok(false);
        };
        Ok(match name {
            USERNAME => user.username == value,
            EMAIL => user.email.as_deref() == Some(value),
            SERVICE_ACCOUNT_CLIENT => user.service_account_client_link.as_deref() == Some(value),
            _ => false,
        })
    }

    /// Claim every unique value in `claims` for `user_id`. On refusal the
    /// claims already taken are released.
    fn claim_all(
        &self,
        realm_id: &str,
        user_id: &str,
        claims: &[(&'static str, &'static str, &str)],
    ) -> StoreResult<()> {
        for (taken, &(kind, name, value)) in claims.iter().enumerate() {
            let holds = |owner: &str| self.holds(realm_id, owner, name, value);
            let claimed = self
                .index
                .claim_unique(kind, realm_id, user_id, name, value, None, holds);
            if let Err(err) = claimed {
                self.release_all(realm_id, user_id, &claims[..taken])?;
                return Err(err);
            }
        }
        Ok(())
    }

    fn release_all(
        &self,
        realm_id: &str,
        user_id: &str,
        claims: &[(&'static str, &'static str, &str)],
    ) -> StoreResult<()> {
        for &(_, name, value) in claims {
            self.index.release_claim(realm_id, user_id, name, value)?;
        }
        Ok(())
    }

    /// Write the record once its claims are held; a failed write gives them
    /// back.
    fn write_claimed(
        &self,
        user: &User,
        claims: &[(&'static str, &'static str, &str)],
    ) -> StoreResult<()> {
        let key = Self::key(&user.realm_id, &user.id);
        if let Err(err) = self.db.put_record(Table::Users, &key, user, None) {
            self.release_all(&user.realm_id, &user.id, claims)?;
            return Err(err.into());
        }
        Ok(())
    }

    /// Create a user. Usernames are stored lowercased and are unique per realm.
    pub fn create(&self, realm: &Realm, username: &str) -> StoreResult<User> {
        self.invalidate();
        let user = User {
            realm_id: realm.id.clone(),
            id: new_id(),
            username: username.to_lowercase(),
            created_timestamp: self.db.now_millis(),
            ..Default::default()
        };

        let claims = [("user", USERNAME, user.username.as_str())];
        self.claim_all(&realm.id, &user.id, &claims)?;
        self.write_claimed(&user, &claims)?;
        self.index
            .commit_unique(&realm.id, &user.id, USERNAME, Some(&user.username), None)?;

        tracing::debug!(realm_id = %realm.id, user_id = %user.id, "User created");
        Ok(user)
    }

    pub fn find_by_id(&self, realm_id: &str, id: &str) -> StoreResult<Option<User>> {
        self.lookups
            .get_or_load(QueryKey::new("find_by_id", [realm_id, id]), || {
                self.load(realm_id, id)
            })
    }

    pub fn find_by_username(&self, realm_id: &str, username: &str) -> StoreResult<Option<User>> {
        let username = username.to_lowercase();
        self.lookups.get_or_load(
            QueryKey::new("find_by_username", [realm_id, username.as_str()]),
            || -> StoreResult<_> {
                let Some(id) = self
                    .index
                    .find_unique_by_attribute(realm_id, USERNAME, &username)?
                else {
                    return Ok(None);
                };
                Ok(self.load(realm_id, &id)?.filter(|u| u.username == username))
            },
        )
    }

    /// Look a user up by email. With duplicate emails allowed, an email
    /// shared by several users resolves to nobody.
    pub fn find_by_email(&self, realm: &Realm, email: &str) -> StoreResult<Option<User>> {
        let email = email.to_lowercase();
        self.lookups.get_or_load(
            QueryKey::new("find_by_email", [realm.id.as_str(), email.as_str()]),
            || -> StoreResult<_> {
                let owners = if realm.duplicate_emails_allowed {
                    self.index.find_by_attribute(&realm.id, EMAIL, &email)?
                } else {
                    self.index
                        .find_unique_by_attribute(&realm.id, EMAIL, &email)?
                        .into_iter()
                        .collect()
                };
                let mut matches: Vec<User> = self
                    .resolve(&realm.id, owners)?
                    .into_iter()
                    .filter(|u| u.email.as_deref() == Some(email.as_str()))
                    .collect();
                Ok(if matches.len() == 1 { matches.pop() } else { None })
            },
        )
    }

    /// Users carrying `name = value` among their custom attributes.
    pub fn find_by_attribute(
        &self,
        realm_id: &str,
        name: &str,
        value: &str,
    ) -> StoreResult<Vec<User>> {
        self.lists.get_or_load(
            QueryKey::new("find_by_attribute", [realm_id, name, value]),
            || -> StoreResult<_> {
                let ids = self.index.find_by_attribute(realm_id, name, value)?;
                self.resolve(realm_id, ids)
            },
        )
    }

    pub fn find_by_federation_link(&self, realm_id: &str, link: &str) -> StoreResult<Vec<User>> {
        let ids = self.index.find_by_attribute(realm_id, FEDERATION_LINK, link)?;
        self.resolve(realm_id, ids)
    }

    pub fn find_by_service_account_client(
        &self,
        realm_id: &str,
        client_id: &str,
    ) -> StoreResult<Option<User>> {
        match self
            .index
            .find_unique_by_attribute(realm_id, SERVICE_ACCOUNT_CLIENT, client_id)?
        {
            Some(id) => self.load(realm_id, &id),
            None => Ok(None),
        }
    }

    fn all(&self, realm_id: &str) -> StoreResult<Vec<User>> {
        self.lists
            .get_or_load(QueryKey::new("all", [realm_id]), || -> StoreResult<_> {
                let mut users: Vec<User> = self.db.scan_records(Table::Users, realm_id)?;
                users.sort_by(|a, b| a.username.cmp(&b.username));
                Ok(users)
            })
    }

    pub fn list(
        &self,
        realm_id: &str,
        first: Option<usize>,
        max: Option<usize>,
    ) -> StoreResult<Vec<User>> {
        Ok(paginate(self.all(realm_id)?, first, max))
    }

    /// Case-insensitive match on username, email, first or last name.
    pub fn search(
        &self,
        realm_id: &str,
        term: &str,
        first: Option<usize>,
        max: Option<usize>,
    ) -> StoreResult<Vec<User>> {
        let term = Some(term);
        Ok(paginate(
            self.all(realm_id)?.into_iter().filter(|u| {
                matches_search(&u.username, term)
                    || [&u.email, &u.first_name, &u.last_name]
                        .into_iter()
                        .flatten()
                        .any(|v| matches_search(v, term))
            }),
            first,
            max,
        ))
    }

    pub fn count(&self, realm_id: &str) -> StoreResult<usize> {
        Ok(self.all(realm_id)?.len())
    }

    /// Persist a user, moving every index row whose value changed.
    ///
    /// Every new unique value is claimed before anything is retracted, so a
    /// refused update leaves the user and its index rows as they were.
    pub fn update(&self, realm: &Realm, user: &User) -> StoreResult<bool> {
        self.invalidate();
        let Some(previous) = self.load(&realm.id, &user.id)? else {
            return Ok(false);
        };

        let mut user = user.clone();
        user.realm_id = realm.id.clone();
        user.username = user.username.to_lowercase();
        user.email = user.email.map(|e| e.to_lowercase());

        let username_changed = previous.username != user.username;
        let email_changed = previous.email != user.email;
        let service_account_changed =
            previous.service_account_client_link != user.service_account_client_link;

        let mut claims = Vec::new();
        if username_changed {
            claims.push(("user", USERNAME, user.username.as_str()));
        }
        if email_changed && !realm.duplicate_emails_allowed {
            claims.extend(user.email.as_deref().map(|email| ("email", EMAIL, email)));
        }
        if service_account_changed {
            claims.extend(
                user.service_account_client_link
                    .as_deref()
                    .map(|client| ("service account", SERVICE_ACCOUNT_CLIENT, client)),
            );
        }
        self.claim_all(&realm.id, &user.id, &claims)?;
        self.write_claimed(&user, &claims)?;

        if username_changed {
            self.index
                .commit_unique(&realm.id, &user.id, USERNAME, Some(&user.username), None)?;
        }
        if email_changed {
            if realm.duplicate_emails_allowed {
                let values: Vec<String> = user.email.iter().cloned().collect();
                self.index
                    .set_attribute(&realm.id, &user.id, EMAIL, &values, None)?;
            } else {
                self.index
                    .commit_unique(&realm.id, &user.id, EMAIL, user.email.as_deref(), None)?;
            }
        }
        if previous.federation_link != user.federation_link {
            let values: Vec<String> = user.federation_link.iter().cloned().collect();
            self.index
                .set_attribute(&realm.id, &user.id, FEDERATION_LINK, &values, None)?;
        }
        if service_account_changed {
            self.index.commit_unique(
                &realm.id,
                &user.id,
                SERVICE_ACCOUNT_CLIENT,
                user.service_account_client_link.as_deref(),
                None,
            )?;
        }
        Ok(true)
    }

    /// Read-modify-write of one user record. `f` returns whether it changed
    /// anything; unchanged records are not rewritten.
    fn modify(
        &self,
        realm_id: &str,
        id: &str,
        f: impl FnOnce(&mut User) -> bool,
    ) -> StoreResult<bool> {
        self.invalidate();
        let Some(mut user) = self.load(realm_id, id)? else {
            return Ok(false);
        };
        if !f(&mut user) {
            return Ok(false);
        }
        self.db
            .put_record(Table::Users, &Self::key(realm_id, id), &user, None)?;
        Ok(true)
    }

    pub fn join_group(&self, realm_id: &str, id: &str, group_id: &str) -> StoreResult<bool> {
        self.modify(realm_id, id, |u| u.group_ids.insert(group_id.to_string()))
    }

    pub fn leave_group(&self, realm_id: &str, id: &str, group_id: &str) -> StoreResult<bool> {
        self.modify(realm_id, id, |u| u.group_ids.remove(group_id))
    }

    pub fn grant_role(&self, realm_id: &str, id: &str, role_id: &str) -> StoreResult<bool> {
        self.modify(realm_id, id, |u| u.role_ids.insert(role_id.to_string()))
    }

    pub fn revoke_role(&self, realm_id: &str, id: &str, role_id: &str) -> StoreResult<bool> {
        self.modify(realm_id, id, |u| u.role_ids.remove(role_id))
    }

    pub fn add_required_action(&self, realm_id: &str, id: &str, action: &str) -> StoreResult<bool> {
        self.modify(realm_id, id, |u| u.required_actions.insert(action.to_string()))
    }

    pub fn remove_required_action(
        &self,
        realm_id: &str,
        id: &str,
        action: &str,
    ) -> StoreResult<bool> {
        self.modify(realm_id, id, |u| u.required_actions.remove(action))
    }

    /// Set a custom attribute. An empty value list removes it.
    pub fn set_attribute(
        &self,
        realm_id: &str,
        id: &str,
        name: &str,
        values: &[String],
    ) -> StoreResult<bool> {
        if is_internal(name) {
            return Err(StoreError::invalid(format!("attribute name {name} is reserved")));
        }
        self.invalidate();
        if self.load(realm_id, id)?.is_none() {
            return Ok(false);
        }
        self.index.set_attribute(realm_id, id, name, values, None)?;
        Ok(true)
    }

    pub fn remove_attribute(&self, realm_id: &str, id: &str, name: &str) -> StoreResult<bool> {
        if is_internal(name) {
            return Err(StoreError::invalid(format!("attribute name {name} is reserved")));
        }
        self.invalidate();
        Ok(self.index.remove_attribute(realm_id, id, name)?)
    }

    /// Custom attributes of a user.
    pub fn attributes(
        &self,
        realm_id: &str,
        id: &str,
    ) -> StoreResult<BTreeMap<String, Vec<String>>> {
        let mut attributes = self.index.find_all_attributes_of(realm_id, id)?;
        attributes.retain(|name, _| !is_internal(name));
        Ok(attributes)
    }

    /// Remove a user together with every index row pointing at it.
    pub fn remove(&self, realm_id: &str, id: &str) -> StoreResult<bool> {
        self.invalidate();
        let removed = self.db.delete(Table::Users, &Self::key(realm_id, id))?;
        self.index.remove_all_attributes_of(realm_id, id)?;
        if removed {
            tracing::debug!(realm_id = %realm_id, user_id = %id, "User removed");
        }
        Ok(removed)
    }

    pub fn remove_all(&self, realm_id: &str) -> StoreResult<usize> {
        self.invalidate();
        let users: Vec<User> = self.db.scan_records(Table::Users, realm_id)?;
        for user in &users {
            self.index.remove_all_attributes_of(realm_id, &user.id)?;
        }
        self.db.delete_partition(Table::Users, realm_id)?;
        Ok(users.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::CLAIM_GRACE_MILLIS;
    use crate::testutil::{make_realm, setup_db};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_username_lowercased_and_unique() {
        let (db, _clock, _temp) = setup_db();
        let repo = UserRepository::new(db, true);
        let realm = make_realm("r1");

        let alice = repo.create(&realm, "Alice").unwrap();
        assert_eq!(alice.username, "alice");
        assert_eq!(repo.find_by_username("r1", "ALICE").unwrap(), Some(alice));
        assert!(matches!(
            repo.create(&realm, "alice"),
            Err(StoreError::DuplicateKey { kind: "user", .. })
        ));
    }

    #[test]
    fn test_email_change_moves_index() {
        let (db, _clock, _temp) = setup_db();
        let repo = UserRepository::new(db, true);
        let realm = make_realm("r1");
        let mut user = repo.create(&realm, "bob").unwrap();

        user.email = Some("A@example.com".to_string());
        repo.update(&realm, &user).unwrap();
        assert_eq!(
            repo.find_by_email(&realm, "a@example.com").unwrap().unwrap().id,
            user.id
        );

        user.email = Some("b@example.com".to_string());
        repo.update(&realm, &user).unwrap();
        assert!(repo.find_by_email(&realm, "a@example.com").unwrap().is_none());
        assert_eq!(
            repo.find_by_email(&realm, "b@example.com").unwrap().unwrap().id,
            user.id
        );
    }

    #[test]
    fn test_duplicate_email_policy() {
        let (db, _clock, _temp) = setup_db();
        let repo = UserRepository::new(db, true);
        let mut strict = make_realm("r1");

        let mut a = repo.create(&strict, "a").unwrap();
        let mut b = repo.create(&strict, "b").unwrap();
        a.email = Some("shared@example.com".to_string());
        repo.update(&strict, &a).unwrap();
        b.email = Some("shared@example.com".to_string());
        assert!(matches!(
            repo.update(&strict, &b),
            Err(StoreError::DuplicateKey { kind: "email", .. })
        ));

        strict.duplicate_emails_allowed = true;
        let relaxed = strict;
        let mut c = repo.create(&relaxed, "c").unwrap();
        let mut d = repo.create(&relaxed, "d").unwrap();
        c.email = Some("dup@example.com".to_string());
        d.email = Some("dup@example.com".to_string());
        repo.update(&relaxed, &c).unwrap();
        assert_eq!(
            repo.find_by_email(&relaxed, "dup@example.com").unwrap().unwrap().id,
            c.id
        );
        repo.update(&relaxed, &d).unwrap();
        // ambiguous
        assert!(repo.find_by_email(&relaxed, "dup@example.com").unwrap().is_none());
    }

    #[test]
    fn test_refused_update_leaves_user_untouched() {
        let (db, _clock, _temp) = setup_db();
        let repo = UserRepository::new(db, true);
        let realm = make_realm("r1");
        let mut alice = repo.create(&realm, "alice").unwrap();
        alice.email = Some("x@example.com".to_string());
        repo.update(&realm, &alice).unwrap();
        let bob = repo.create(&realm, "bob").unwrap();

        let mut renamed = bob.clone();
        renamed.username = "bobby".to_string();
        renamed.email = Some("x@example.com".to_string());
        assert!(matches!(
            repo.update(&realm, &renamed),
            Err(StoreError::DuplicateKey { kind: "email", .. })
        ));

        assert_eq!(repo.find_by_id("r1", &bob.id).unwrap().unwrap().username, "bob");
        assert_eq!(repo.find_by_username("r1", "bob").unwrap().unwrap().id, bob.id);
        assert!(repo.find_by_username("r1", "bobby").unwrap().is_none());
        assert!(matches!(
            repo.create(&realm, "bob"),
            Err(StoreError::DuplicateKey { kind: "user", .. })
        ));
        // the refused update handed its username claim back
        repo.create(&realm, "bobby").unwrap();
    }

    #[test]
    fn test_abandoned_username_claim_is_reclaimed() {
        let (db, clock, _temp) = setup_db();
        let repo = UserRepository::new(db, true);
        let realm = make_realm("r1");
        let carol = repo.create(&realm, "carol").unwrap();

        // claims whose owners never wrote, or no longer carry, the value
        repo.index
            .claim_unique("user", "r1", "ghost", USERNAME, "dave", None, |_| Ok(true))
            .unwrap();
        repo.index
            .claim_unique("user", "r1", &carol.id, USERNAME, "carla", None, |_| Ok(true))
            .unwrap();
        assert!(matches!(
            repo.create(&realm, "dave"),
            Err(StoreError::DuplicateKey { .. })
        ));

        clock.advance_secs(CLAIM_GRACE_MILLIS / 1000 + 1);
        let dave = repo.create(&realm, "dave").unwrap();
        let carla = repo.create(&realm, "carla").unwrap();
        assert_eq!(repo.find_by_username("r1", "dave").unwrap(), Some(dave));
        assert_eq!(repo.find_by_username("r1", "carla").unwrap(), Some(carla));
        assert_eq!(repo.find_by_username("r1", "carol").unwrap().unwrap().id, carol.id);
    }

    #[test]
    fn test_custom_attributes() {
        let (db, _clock, _temp) = setup_db();
        let repo = UserRepository::new(db, true);
        let realm = make_realm("r1");
        let user = repo.create(&realm, "carol").unwrap();

        assert!(repo
            .set_attribute("r1", &user.id, "dept", &strings(&["eng", "ops"]))
            .unwrap());
        assert_eq!(repo.find_by_attribute("r1", "dept", "ops").unwrap().len(), 1);

        repo.set_attribute("r1", &user.id, "dept", &strings(&["eng"]))
            .unwrap();
        assert!(repo.find_by_attribute("r1", "dept", "ops").unwrap().is_empty());

        let attributes = repo.attributes("r1", &user.id).unwrap();
        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes["dept"], strings(&["eng"]));

        assert!(matches!(
            repo.set_attribute("r1", &user.id, "$username", &strings(&["x"])),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(!repo
            .set_attribute("r1", "missing", "dept", &strings(&["eng"]))
            .unwrap());
    }

    #[test]
    fn test_links_and_memberships() {
        let (db, _clock, _temp) = setup_db();
        let repo = UserRepository::new(db, true);
        let realm = make_realm("r1");
        let mut user = repo.create(&realm, "svc").unwrap();

        user.service_account_client_link = Some("client-1".to_string());
        user.federation_link = Some("ldap".to_string());
        repo.update(&realm, &user).unwrap();
        assert_eq!(
            repo.find_by_service_account_client("r1", "client-1").unwrap().unwrap().id,
            user.id
        );
        assert_eq!(repo.find_by_federation_link("r1", "ldap").unwrap().len(), 1);

        assert!(repo.join_group("r1", &user.id, "g1").unwrap());
        assert!(!repo.join_group("r1", &user.id, "g1").unwrap());
        assert!(repo.grant_role("r1", &user.id, "role-1").unwrap());
        assert!(repo.add_required_action("r1", &user.id, "VERIFY_EMAIL").unwrap());
        let stored = repo.find_by_id("r1", &user.id).unwrap().unwrap();
        assert!(stored.group_ids.contains("g1"));
        assert!(stored.role_ids.contains("role-1"));
        assert!(stored.required_actions.contains("VERIFY_EMAIL"));

        assert!(repo.leave_group("r1", &user.id, "g1").unwrap());
        assert!(repo.revoke_role("r1", &user.id, "role-1").unwrap());
        assert!(repo.remove_required_action("r1", &user.id, "VERIFY_EMAIL").unwrap());
    }

    #[test]
    fn test_search_count_and_remove() {
        let (db, _clock, _temp) = setup_db();
        let repo = UserRepository::new(db, true);
        let realm = make_realm("r1");
        let mut dave = repo.create(&realm, "dave").unwrap();
        repo.create(&realm, "erin").unwrap();
        dave.last_name = Some("Smith".to_string());
        repo.update(&realm, &dave).unwrap();

        assert_eq!(repo.count("r1").unwrap(), 2);
        assert_eq!(repo.search("r1", "smi", None, None).unwrap()[0].id, dave.id);
        assert_eq!(repo.list("r1", Some(1), None).unwrap()[0].username, "erin");

        repo.set_attribute("r1", &dave.id, "dept", &strings(&["eng"]))
            .unwrap();
        assert!(repo.remove("r1", &dave.id).unwrap());
        assert!(repo.find_by_username("r1", "dave").unwrap().is_none());
        assert!(repo.find_by_attribute("r1", "dept", "eng").unwrap().is_empty());
        repo.create(&realm, "dave").unwrap();

        assert_eq!(repo.remove_all("r1").unwrap(), 2);
        assert_eq!(repo.count("r1").unwrap(), 0);
    }
}
