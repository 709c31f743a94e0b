//! Roles of a realm, stored as one aggregate container.
//!
//! Composite roles reference their children by id only. Ids that no longer
//! resolve are dropped at read time; nothing cleans them up eagerly.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{matches_search, paginate, Aggregate, AggregateStore};
use crate::error::{StoreError, StoreResult};
use crate::storage::Table;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleValue {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Owning client (uuid) for client roles, `None` for realm roles.
    pub client_id: Option<String>,
    pub composite_role_ids: BTreeSet<String>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl RoleValue {
    pub fn new(name: &str, client_id: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            client_id: client_id.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn is_composite(&self) -> bool {
        !self.composite_role_ids.is_empty()
    }

    pub fn is_client_role(&self) -> bool {
        self.client_id.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RealmRoles {
    pub realm_id: String,
    pub roles: Vec<RoleValue>,
}

impl Aggregate for RealmRoles {
    const TABLE: Table = Table::RealmRoles;
    const KIND: &'static str = "roles";

    fn empty(tenant_id: &str) -> Self {
        Self {
            realm_id: tenant_id.to_string(),
            roles: Vec::new(),
        }
    }
}

impl RealmRoles {
    pub fn find_by_id(&self, id: &str) -> Option<&RoleValue> {
        self.roles.iter().find(|r| r.id == id)
    }

    pub fn find_by_name(&self, client_id: Option<&str>, name: &str) -> Option<&RoleValue> {
        self.roles
            .iter()
            .find(|r| r.client_id.as_deref() == client_id && r.name == name)
    }

    /// Add a role; names are unique per realm (realm roles) or per client.
    pub fn add(&mut self, role: RoleValue) -> StoreResult<()> {
        if self.find_by_id(&role.id).is_some() {
            return Err(StoreError::duplicate("role id", role.id));
        }
        if self
            .find_by_name(role.client_id.as_deref(), &role.name)
            .is_some()
        {
            return Err(StoreError::duplicate("role", role.name));
        }
        self.roles.push(role);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<RoleValue> {
        let position = self.roles.iter().position(|r| r.id == id)?;
        Some(self.roles.remove(position))
    }

    /// Realm roles (or one client's roles), filtered then paginated.
    pub fn list(
        &self,
        client_id: Option<&str>,
        search: Option<&str>,
        first: Option<usize>,
        max: Option<usize>,
    ) -> Vec<&RoleValue> {
        paginate(
            self.roles
                .iter()
                .filter(|r| r.client_id.as_deref() == client_id)
                .filter(|r| matches_search(&r.name, search)),
            first,
            max,
        )
    }

    /// Direct children of a composite role. Dangling ids are dropped before
    /// search and pagination apply.
    pub fn composites(
        &self,
        role_id: &str,
        search: Option<&str>,
        first: Option<usize>,
        max: Option<usize>,
    ) -> Vec<&RoleValue> {
        let Some(role) = self.find_by_id(role_id) else {
            return Vec::new();
        };
        paginate(
            role.composite_role_ids
                .iter()
                .filter_map(|id| self.find_by_id(id))
                .filter(|r| matches_search(&r.name, search)),
            first,
            max,
        )
    }

    /// The role and everything reachable through composites. Cycles in the
    /// stored id sets terminate because visited ids are never expanded twice.
    pub fn expand(&self, role_id: &str) -> BTreeSet<String> {
        let mut visited = BTreeSet::new();
        self.expand_into(role_id, &mut visited);
        visited
    }

    fn expand_into(&self, role_id: &str, visited: &mut BTreeSet<String>) {
        let mut pending = vec![role_id.to_string()];
        while let Some(id) = pending.pop() {
            let Some(role) = self.find_by_id(&id) else {
                continue;
            };
            if !visited.insert(id) {
                continue;
            }
            pending.extend(
                role.composite_role_ids
                    .iter()
                    .filter(|child| !visited.contains(*child))
                    .cloned(),
            );
        }
    }

    /// Whether any of `granted` is, or transitively contains, `role_id`.
    /// Grants of roles that no longer exist count for nothing.
    pub fn has_role<'a>(&self, granted: impl IntoIterator<Item = &'a str>, role_id: &str) -> bool {
        let mut visited = BTreeSet::new();
        for id in granted {
            self.expand_into(id, &mut visited);
            if visited.contains(role_id) {
                return true;
            }
        }
        false
    }
}

/// Role operations routed through the unit of work's write-back cache.
pub type RoleStore = AggregateStore<RealmRoles>;

impl AggregateStore<RealmRoles> {
    pub fn add_realm_role(&self, realm_id: &str, name: &str) -> StoreResult<RoleValue> {
        self.add_role(realm_id, RoleValue::new(name, None))
    }

    pub fn add_client_role(
        &self,
        realm_id: &str,
        client_id: &str,
        name: &str,
    ) -> StoreResult<RoleValue> {
        self.add_role(realm_id, RoleValue::new(name, Some(client_id)))
    }

    pub fn add_role(&self, realm_id: &str, role: RoleValue) -> StoreResult<RoleValue> {
        self.try_update(realm_id, |roles| {
            roles.add(role.clone())?;
            Ok(role)
        })
    }

    pub fn get_role(&self, realm_id: &str, id: &str) -> StoreResult<Option<RoleValue>> {
        self.read(realm_id, |roles| roles.find_by_id(id).cloned())
    }

    pub fn get_realm_role(&self, realm_id: &str, name: &str) -> StoreResult<Option<RoleValue>> {
        self.read(realm_id, |roles| roles.find_by_name(None, name).cloned())
    }

    pub fn get_client_role(
        &self,
        realm_id: &str,
        client_id: &str,
        name: &str,
    ) -> StoreResult<Option<RoleValue>> {
        self.read(realm_id, |roles| roles.find_by_name(Some(client_id), name).cloned())
    }

    pub fn realm_roles(
        &self,
        realm_id: &str,
        search: Option<&str>,
        first: Option<usize>,
        max: Option<usize>,
    ) -> StoreResult<Vec<RoleValue>> {
        self.read(realm_id, |roles| {
            roles.list(None, search, first, max).into_iter().cloned().collect()
        })
    }

    pub fn client_roles(
        &self,
        realm_id: &str,
        client_id: &str,
        search: Option<&str>,
        first: Option<usize>,
        max: Option<usize>,
    ) -> StoreResult<Vec<RoleValue>> {
        self.read(realm_id, |roles| {
            roles
                .list(Some(client_id), search, first, max)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    /// Replace a role's mutable fields (name, description, attributes).
    pub fn update_role(&self, realm_id: &str, updated: &RoleValue) -> StoreResult<bool> {
        self.try_update(realm_id, |roles| {
            if let Some(clash) = roles.find_by_name(updated.client_id.as_deref(), &updated.name) {
                if clash.id != updated.id {
                    return Err(StoreError::duplicate("role", updated.name.clone()));
                }
            }
            let Some(role) = roles.roles.iter_mut().find(|r| r.id == updated.id) else {
                return Ok(false);
            };
            role.name = updated.name.clone();
            role.description = updated.description.clone();
            role.attributes = updated.attributes.clone();
            Ok(true)
        })
    }

    /// Remove a role. Composite references to it elsewhere are left dangling.
    pub fn remove_role(&self, realm_id: &str, id: &str) -> StoreResult<bool> {
        self.update(realm_id, |roles| roles.remove(id).is_some())
    }

    /// Remove every role owned by a client.
    pub fn remove_client_roles(&self, realm_id: &str, client_id: &str) -> StoreResult<usize> {
        self.update(realm_id, |roles| {
            let before = roles.roles.len();
            roles
                .roles
                .retain(|r| r.client_id.as_deref() != Some(client_id));
            before - roles.roles.len()
        })
    }

    pub fn add_composite(
        &self,
        realm_id: &str,
        role_id: &str,
        child_id: &str,
    ) -> StoreResult<bool> {
        self.try_update(realm_id, |roles| {
            if roles.find_by_id(child_id).is_none() {
                return Err(StoreError::invalid(format!("role {child_id} does not exist")));
            }
            match roles.roles.iter_mut().find(|r| r.id == role_id) {
                Some(role) => Ok(role.composite_role_ids.insert(child_id.to_string())),
                None => Ok(false),
            }
        })
    }

    pub fn remove_composite(
        &self,
        realm_id: &str,
        role_id: &str,
        child_id: &str,
    ) -> StoreResult<bool> {
        self.update(realm_id, |roles| {
            roles
                .roles
                .iter_mut()
                .find(|r| r.id == role_id)
                .is_some_and(|role| role.composite_role_ids.remove(child_id))
        })
    }

    pub fn composites(
        &self,
        realm_id: &str,
        role_id: &str,
        search: Option<&str>,
        first: Option<usize>,
        max: Option<usize>,
    ) -> StoreResult<Vec<RoleValue>> {
        self.read(realm_id, |roles| {
            roles
                .composites(role_id, search, first, max)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn has_role(
        &self,
        realm_id: &str,
        granted: &BTreeSet<String>,
        role_id: &str,
    ) -> StoreResult<bool> {
        self.read(realm_id, |roles| {
            roles.has_role(granted.iter().map(String::as_str), role_id)
        })
    }

    /// Resolve role ids, silently dropping ids that no longer exist.
    pub fn resolve(&self, realm_id: &str, ids: &BTreeSet<String>) -> StoreResult<Vec<RoleValue>> {
        self.read(realm_id, |roles| {
            ids.iter()
                .filter_map(|id| roles.find_by_id(id))
                .cloned()
                .collect()
        })
    }
}
