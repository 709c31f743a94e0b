//! Group hierarchy of a realm, stored as one aggregate container.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{matches_search, paginate, Aggregate, AggregateStore};
use crate::error::{StoreError, StoreResult};
use crate::storage::Table;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupValue {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub role_ids: BTreeSet<String>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RealmGroups {
    pub realm_id: String,
    pub groups: Vec<GroupValue>,
}

impl Aggregate for RealmGroups {
    const TABLE: Table = Table::RealmGroups;
    const KIND: &'static str = "groups";

    fn empty(tenant_id: &str) -> Self {
        Self {
            realm_id: tenant_id.to_string(),
            groups: Vec::new(),
        }
    }
}

impl RealmGroups {
    pub fn find_by_id(&self, id: &str) -> Option<&GroupValue> {
        self.groups.iter().find(|g| g.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut GroupValue> {
        self.groups.iter_mut().find(|g| g.id == id)
    }

    fn sibling_named(&self, parent_id: Option<&str>, name: &str) -> Option<&GroupValue> {
        self.groups
            .iter()
            .find(|g| g.parent_id.as_deref() == parent_id && g.name == name)
    }

    /// Create a group. Names are unique among siblings; the parent, if
    /// given, must exist.
    pub fn create(&mut self, name: &str, parent_id: Option<&str>) -> StoreResult<GroupValue> {
        if let Some(parent) = parent_id {
            if self.find_by_id(parent).is_none() {
                return Err(StoreError::invalid(format!("parent group {parent} does not exist")));
            }
        }
        if self.sibling_named(parent_id, name).is_some() {
            return Err(StoreError::duplicate("group", name.to_string()));
        }
        let group = GroupValue {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            parent_id: parent_id.map(str::to_string),
            ..Default::default()
        };
        self.groups.push(group.clone());
        Ok(group)
    }

    pub fn parent(&self, id: &str) -> Option<&GroupValue> {
        self.find_by_id(id)?
            .parent_id
            .as_deref()
            .and_then(|parent| self.find_by_id(parent))
    }

    /// Slash-separated path from the root, e.g. `/top/child`.
    ///
    /// The walk visits at most as many ancestors as there are groups, so a
    /// parent cycle yields a truncated path instead of looping.
    pub fn path(&self, id: &str) -> Option<String> {
        let mut current = self.find_by_id(id)?;
        let mut names = vec![current.name.as_str()];
        let mut steps = 0;
        while let Some(parent_id) = current.parent_id.as_deref() {
            steps += 1;
            if steps > self.groups.len() {
                tracing::warn!(
                    realm_id = %self.realm_id,
                    group_id = %id,
                    "Group parent chain contains a cycle"
                );
                break;
            }
            let Some(parent) = self.find_by_id(parent_id) else {
                break;
            };
            names.push(parent.name.as_str());
            current = parent;
        }
        names.reverse();
        Some(format!("/{}", names.join("/")))
    }

    pub fn sub_groups(
        &self,
        parent_id: &str,
        search: Option<&str>,
        first: Option<usize>,
        max: Option<usize>,
    ) -> Vec<&GroupValue> {
        paginate(
            self.groups
                .iter()
                .filter(|g| g.parent_id.as_deref() == Some(parent_id))
                .filter(|g| matches_search(&g.name, search)),
            first,
            max,
        )
    }

    pub fn top_level(
        &self,
        search: Option<&str>,
        first: Option<usize>,
        max: Option<usize>,
    ) -> Vec<&GroupValue> {
        paginate(
            self.groups
                .iter()
                .filter(|g| g.parent_id.is_none())
                .filter(|g| matches_search(&g.name, search)),
            first,
            max,
        )
    }

    /// Every group whose name matches, at any depth.
    pub fn search(
        &self,
        search: Option<&str>,
        first: Option<usize>,
        max: Option<usize>,
    ) -> Vec<&GroupValue> {
        paginate(
            self.groups.iter().filter(|g| matches_search(&g.name, search)),
            first,
            max,
        )
    }

    /// Re-parent a group. `None` moves it to the top level.
    ///
    /// Only the new parent's existence and sibling-name uniqueness are
    /// checked. Moving a group beneath its own descendant is accepted.
    pub fn move_group(&mut self, id: &str, new_parent: Option<&str>) -> StoreResult<bool> {
        let Some(group) = self.find_by_id(id) else {
            return Ok(false);
        };
        let name = group.name.clone();
        if let Some(parent) = new_parent {
            if self.find_by_id(parent).is_none() {
                return Err(StoreError::invalid(format!("parent group {parent} does not exist")));
            }
        }
        if let Some(clash) = self.sibling_named(new_parent, &name) {
            if clash.id != id {
                return Err(StoreError::duplicate("group", name));
            }
        }
        if let Some(group) = self.find_mut(id) {
            group.parent_id = new_parent.map(str::to_string);
        }
        Ok(true)
    }

    /// Remove a group and every descendant. Returns the removed ids.
    pub fn remove(&mut self, id: &str) -> BTreeSet<String> {
        let mut doomed = BTreeSet::new();
        if self.find_by_id(id).is_none() {
            return doomed;
        }
        doomed.insert(id.to_string());
        loop {
            let before = doomed.len();
            for group in &self.groups {
                if group
                    .parent_id
                    .as_ref()
                    .is_some_and(|parent| doomed.contains(parent))
                {
                    doomed.insert(group.id.clone());
                }
            }
            if doomed.len() == before {
                break;
            }
        }
        self.groups.retain(|g| !doomed.contains(&g.id));
        doomed
    }

    pub fn grant_role(&mut self, id: &str, role_id: &str) -> bool {
        self.find_mut(id)
            .is_some_and(|g| g.role_ids.insert(role_id.to_string()))
    }

    pub fn revoke_role(&mut self, id: &str, role_id: &str) -> bool {
        self.find_mut(id).is_some_and(|g| g.role_ids.remove(role_id))
    }

    /// Look up group ids, dropping any that no longer resolve.
    pub fn resolve<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Vec<&GroupValue> {
        ids.into_iter().filter_map(|id| self.find_by_id(id)).collect()
    }

    /// The given groups plus all their ancestors, bounded like [`path`](Self::path).
    pub fn with_ancestors<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        for id in ids {
            let mut current = self.find_by_id(id);
            let mut steps = 0;
            while let Some(group) = current {
                if !result.insert(group.id.clone()) || steps > self.groups.len() {
                    break;
                }
                steps += 1;
                current = group
                    .parent_id
                    .as_deref()
                    .and_then(|parent| self.find_by_id(parent));
            }
        }
        result
    }
}

pub type GroupStore = AggregateStore<RealmGroups>;

impl AggregateStore<RealmGroups> {
    pub fn create_group(
        &self,
        realm_id: &str,
        name: &str,
        parent_id: Option<&str>,
    ) -> StoreResult<GroupValue> {
        self.try_update(realm_id, |groups| groups.create(name, parent_id))
    }

    pub fn get_group(&self, realm_id: &str, id: &str) -> StoreResult<Option<GroupValue>> {
        self.read(realm_id, |groups| groups.find_by_id(id).cloned())
    }

    pub fn group_path(&self, realm_id: &str, id: &str) -> StoreResult<Option<String>> {
        self.read(realm_id, |groups| groups.path(id))
    }

    pub fn sub_groups(
        &self,
        realm_id: &str,
        parent_id: &str,
        search: Option<&str>,
        first: Option<usize>,
        max: Option<usize>,
    ) -> StoreResult<Vec<GroupValue>> {
        self.read(realm_id, |groups| {
            groups
                .sub_groups(parent_id, search, first, max)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn top_level_groups(
        &self,
        realm_id: &str,
        search: Option<&str>,
        first: Option<usize>,
        max: Option<usize>,
    ) -> StoreResult<Vec<GroupValue>> {
        self.read(realm_id, |groups| {
            groups
                .top_level(search, first, max)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn search_groups(
        &self,
        realm_id: &str,
        search: Option<&str>,
        first: Option<usize>,
        max: Option<usize>,
    ) -> StoreResult<Vec<GroupValue>> {
        self.read(realm_id, |groups| {
            groups.search(search, first, max).into_iter().cloned().collect()
        })
    }

    pub fn move_group(
        &self,
        realm_id: &str,
        id: &str,
        new_parent: Option<&str>,
    ) -> StoreResult<bool> {
        self.try_update(realm_id, |groups| groups.move_group(id, new_parent))
    }

    pub fn rename_group(&self, realm_id: &str, id: &str, name: &str) -> StoreResult<bool> {
        self.try_update(realm_id, |groups| {
            let Some(group) = groups.find_by_id(id) else {
                return Ok(false);
            };
            if let Some(clash) = groups.sibling_named(group.parent_id.as_deref(), name) {
                if clash.id != id {
                    return Err(StoreError::duplicate("group", name.to_string()));
                }
            }
            if let Some(group) = groups.find_mut(id) {
                group.name = name.to_string();
            }
            Ok(true)
        })
    }

    pub fn set_group_attribute(
        &self,
        realm_id: &str,
        id: &str,
        name: &str,
        values: Vec<String>,
    ) -> StoreResult<bool> {
        self.update(realm_id, |groups| match groups.find_mut(id) {
            Some(group) if values.is_empty() => group.attributes.remove(name).is_some(),
            Some(group) => {
                group.attributes.insert(name.to_string(), values);
                true
            }
            None => false,
        })
    }

    pub fn remove_group(&self, realm_id: &str, id: &str) -> StoreResult<BTreeSet<String>> {
        self.update(realm_id, |groups| groups.remove(id))
    }

    pub fn grant_group_role(&self, realm_id: &str, id: &str, role_id: &str) -> StoreResult<bool> {
        self.update(realm_id, |groups| groups.grant_role(id, role_id))
    }

    pub fn revoke_group_role(&self, realm_id: &str, id: &str, role_id: &str) -> StoreResult<bool> {
        self.update(realm_id, |groups| groups.revoke_role(id, role_id))
    }

    pub fn resolve_groups(
        &self,
        realm_id: &str,
        ids: &BTreeSet<String>,
    ) -> StoreResult<Vec<GroupValue>> {
        self.read(realm_id, |groups| {
            groups
                .resolve(ids.iter().map(String::as_str))
                .into_iter()
                .cloned()
                .collect()
        })
    }

    /// Role ids granted through membership in `group_ids` or their ancestors.
    pub fn inherited_role_ids(
        &self,
        realm_id: &str,
        group_ids: &BTreeSet<String>,
    ) -> StoreResult<BTreeSet<String>> {
        self.read(realm_id, |groups| {
            groups
                .with_ancestors(group_ids.iter().map(String::as_str))
                .iter()
                .filter_map(|id| groups.find_by_id(id))
                .flat_map(|g| g.role_ids.iter().cloned())
                .collect()
        })
    }
}
