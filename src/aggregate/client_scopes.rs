use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Aggregate, AggregateStore};
use crate::error::{StoreError, StoreResult};
use crate::storage::Table;

pub const DEFAULT_PROTOCOL: &str = "openid-connect";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientScopeValue {
    pub id: String,
    pub name: String,
    pub protocol: String,
    pub description: Option<String>,
    pub attributes: BTreeMap<String, Vec<String>>,
    /// Scope role mappings.
    pub role_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RealmClientScopes {
    pub realm_id: String,
    pub scopes: Vec<ClientScopeValue>,
}

impl Aggregate for RealmClientScopes {
    const TABLE: Table = Table::RealmClientScopes;
    const KIND: &'static str = "client scopes";

    fn empty(tenant_id: &str) -> Self {
        Self {
            realm_id: tenant_id.to_string(),
            scopes: Vec::new(),
        }
    }
}

impl RealmClientScopes {
    pub fn find_by_id(&self, id: &str) -> Option<&ClientScopeValue> {
        self.scopes.iter().find(|s| s.id == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ClientScopeValue> {
        self.scopes.iter().find(|s| s.name == name)
    }

    pub fn add(&mut self, name: &str, protocol: Option<&str>) -> StoreResult<ClientScopeValue> {
        if self.find_by_name(name).is_some() {
            return Err(StoreError::duplicate("client scope", name.to_string()));
        }
        let scope = ClientScopeValue {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            protocol: protocol.unwrap_or(DEFAULT_PROTOCOL).to_string(),
            ..Default::default()
        };
        self.scopes.push(scope.clone());
        Ok(scope)
    }

    pub fn remove(&mut self, id: &str) -> Option<ClientScopeValue> {
        let position = self.scopes.iter().position(|s| s.id == id)?;
        Some(self.scopes.remove(position))
    }
}

pub type ClientScopeStore = AggregateStore<RealmClientScopes>;

impl AggregateStore<RealmClientScopes> {
    pub fn add_client_scope(
        &self,
        realm_id: &str,
        name: &str,
        protocol: Option<&str>,
    ) -> StoreResult<ClientScopeValue> {
        self.try_update(realm_id, |scopes| scopes.add(name, protocol))
    }

    pub fn get_client_scope(
        &self,
        realm_id: &str,
        id: &str,
    ) -> StoreResult<Option<ClientScopeValue>> {
        self.read(realm_id, |scopes| scopes.find_by_id(id).cloned())
    }

    pub fn get_client_scope_by_name(
        &self,
        realm_id: &str,
        name: &str,
    ) -> StoreResult<Option<ClientScopeValue>> {
        self.read(realm_id, |scopes| scopes.find_by_name(name).cloned())
    }

    pub fn client_scopes(&self, realm_id: &str) -> StoreResult<Vec<ClientScopeValue>> {
        self.read(realm_id, |scopes| scopes.scopes.clone())
    }

    /// Replace a scope's mutable fields, keeping names unique.
    pub fn update_client_scope(
        &self,
        realm_id: &str,
        updated: &ClientScopeValue,
    ) -> StoreResult<bool> {
        self.try_update(realm_id, |scopes| {
            if let Some(clash) = scopes.find_by_name(&updated.name) {
                if clash.id != updated.id {
                    return Err(StoreError::duplicate("client scope", updated.name.clone()));
                }
            }
            let Some(scope) = scopes.scopes.iter_mut().find(|s| s.id == updated.id) else {
                return Ok(false);
            };
            *scope = updated.clone();
            Ok(true)
        })
    }

    pub fn remove_client_scope(&self, realm_id: &str, id: &str) -> StoreResult<bool> {
        self.update(realm_id, |scopes| scopes.remove(id).is_some())
    }

    pub fn add_scope_role(&self, realm_id: &str, id: &str, role_id: &str) -> StoreResult<bool> {
        self.update(realm_id, |scopes| {
            scopes
                .scopes
                .iter_mut()
                .find(|s| s.id == id)
                .is_some_and(|s| s.role_ids.insert(role_id.to_string()))
        })
    }
}
