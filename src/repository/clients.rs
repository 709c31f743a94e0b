use crate::aggregate::{matches_search, paginate};
use crate::cache::{QueryCache, QueryKey};
use crate::error::StoreResult;
use crate::expiration::ClientTimeouts;
use crate::index::{AttributeIndex, CLIENT_INDEX};
use crate::storage::models::Client;
use crate::storage::{Database, RowKey, Table};

use super::new_id;

const CLIENT_ID: &str = "$client_id";

pub const CLIENT_SESSION_IDLE_TIMEOUT: &str = "client.session.idle.timeout";
pub const CLIENT_SESSION_MAX_LIFESPAN: &str = "client.session.max.lifespan";
pub const CLIENT_OFFLINE_SESSION_IDLE_TIMEOUT: &str = "client.offline.session.idle.timeout";
pub const CLIENT_OFFLINE_SESSION_MAX_LIFESPAN: &str = "client.offline.session.max.lifespan";

impl Client {
    /// Per-client session timeout overrides. Missing, empty or unparsable
    /// attributes count as unset.
    pub fn timeouts(&self) -> ClientTimeouts {
        let seconds = |name: &str| {
            self.attributes
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .and_then(|v| v.parse::<i64>().ok())
        };
        ClientTimeouts {
            session_idle_timeout: seconds(CLIENT_SESSION_IDLE_TIMEOUT),
            session_max_lifespan: seconds(CLIENT_SESSION_MAX_LIFESPAN),
            offline_session_idle_timeout: seconds(CLIENT_OFFLINE_SESSION_IDLE_TIMEOUT),
            offline_session_max_lifespan: seconds(CLIENT_OFFLINE_SESSION_MAX_LIFESPAN),
        }
    }
}

#[derive(Debug)]
pub struct ClientRepository {
    db: Database,
    index: AttributeIndex,
    lookups: QueryCache<Option<Client>>,
    lists: QueryCache<Vec<Client>>,
}

impl ClientRepository {
    pub fn new(db: Database, cache_enabled: bool) -> Self {
        Self {
            index: AttributeIndex::new(db.clone(), CLIENT_INDEX),
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

    fn claim_client_id(&self, client: &Client) -> StoreResult<()> {
        let holds = |owner: &str| -> StoreResult<bool> {
            Ok(self
                .db
                .get_record::<Client>(Table::Clients, &Self::key(&client.realm_id, owner))?
                .is_some_and(|c| c.client_id == client.client_id))
        };
        self.index.claim_unique(
            "client",
            &client.realm_id,
            &client.id,
            CLIENT_ID,
            &client.client_id,
            None,
            holds,
        )
    }

    /// Write a client whose `client_id` claim is held; a failed write gives
    /// the claim back.
    fn write_claimed(&self, client: &Client) -> StoreResult<()> {
        let key = Self::key(&client.realm_id, &client.id);
        if let Err(err) = self.db.put_record(Table::Clients, &key, client, None) {
            self.index
                .release_claim(&client.realm_id, &client.id, CLIENT_ID, &client.client_id)?;
            return Err(err.into());
        }
        Ok(())
    }

    /// Register a client; `client_id` is unique within the realm.
    pub fn create(&self, realm_id: &str, client_id: &str) -> StoreResult<Client> {
        self.invalidate();
        let client = Client {
            realm_id: realm_id.to_string(),
            id: new_id(),
            client_id: client_id.to_string(),
            enabled: true,
            ..Default::default()
        };

        self.claim_client_id(&client)?;
        self.write_claimed(&client)?;
        self.index
            .commit_unique(realm_id, &client.id, CLIENT_ID, Some(client_id), None)?;

        tracing::debug!(realm_id = %realm_id, client_id = %client_id, "Client created");
        Ok(client)
    }

    pub fn find_by_id(&self, realm_id: &str, id: &str) -> StoreResult<Option<Client>> {
        self.lookups
            .get_or_load(QueryKey::new("find_by_id", [realm_id, id]), || -> StoreResult<_> {
                Ok(self.db.get_record(Table::Clients, &Self::key(realm_id, id))?)
            })
    }

    pub fn find_by_client_id(
        &self,
        realm_id: &str,
        client_id: &str,
    ) -> StoreResult<Option<Client>> {
        self.lookups.get_or_load(
            QueryKey::new("find_by_client_id", [realm_id, client_id]),
            || -> StoreResult<_> {
                let Some(id) = self
                    .index
                    .find_unique_by_attribute(realm_id, CLIENT_ID, client_id)?
                else {
                    return Ok(None);
                };
                Ok(self
                    .db
                    .get_record::<Client>(Table::Clients, &Self::key(realm_id, &id))?
                    .filter(|c| c.client_id == client_id))
            },
        )
    }

    fn all(&self, realm_id: &str) -> StoreResult<Vec<Client>> {
        self.lists
            .get_or_load(QueryKey::new("all", [realm_id]), || -> StoreResult<_> {
                let mut clients: Vec<Client> = self.db.scan_records(Table::Clients, realm_id)?;
                clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
                Ok(clients)
            })
    }

    /// Clients of a realm ordered by `client_id`.
    pub fn list(
        &self,
        realm_id: &str,
        first: Option<usize>,
        max: Option<usize>,
    ) -> StoreResult<Vec<Client>> {
        Ok(paginate(self.all(realm_id)?, first, max))
    }

    pub fn search_by_client_id(
        &self,
        realm_id: &str,
        fragment: &str,
        first: Option<usize>,
        max: Option<usize>,
    ) -> StoreResult<Vec<Client>> {
        Ok(paginate(
            self.all(realm_id)?
                .into_iter()
                .filter(|c| matches_search(&c.client_id, Some(fragment))),
            first,
            max,
        ))
    }

    pub fn count(&self, realm_id: &str) -> StoreResult<usize> {
        Ok(self.all(realm_id)?.len())
    }

    pub fn update(&self, client: &Client) -> StoreResult<bool> {
        self.invalidate();
        let key = Self::key(&client.realm_id, &client.id);
        let Some(previous) = self.db.get_record::<Client>(Table::Clients, &key)? else {
            return Ok(false);
        };
        if previous.client_id == client.client_id {
            self.db.put_record(Table::Clients, &key, client, None)?;
            return Ok(true);
        }

        self.claim_client_id(client)?;
        self.write_claimed(client)?;
        self.index.commit_unique(
            &client.realm_id,
            &client.id,
            CLIENT_ID,
            Some(&client.client_id),
            None,
        )?;
        Ok(true)
    }

    /// Remove a client and its index rows. Roles and sessions that reference
    /// it are cascaded by the caller.
    pub fn remove(&self, realm_id: &str, id: &str) -> StoreResult<bool> {
        self.invalidate();
        let removed = self.db.delete(Table::Clients, &Self::key(realm_id, id))?;
        self.index.remove_all_attributes_of(realm_id, id)?;
        Ok(removed)
    }

    pub fn remove_all(&self, realm_id: &str) -> StoreResult<usize> {
        self.invalidate();
        let clients: Vec<Client> = self.db.scan_records(Table::Clients, realm_id)?;
        for client in &clients {
            self.index.remove_all_attributes_of(realm_id, &client.id)?;
        }
        self.db.delete_partition(Table::Clients, realm_id)?;
        Ok(clients.len())
    }
}
