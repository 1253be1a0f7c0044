//! StateStore — redb-backed persistence for environment documents.
//!
//! Provides typed operations over environment headers, service groups,
//! global variables and deploy strategies. All values are JSON-serialized
//! into redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).
//!
//! Single-document writes (status flips, one group's apply results) commit
//! on their own. Desired-state changes spanning several documents go
//! through [`EnvTransaction`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
        txn.open_table(SERVICE_GROUPS).map_err(map_err!(Table))?;
        txn.open_table(GLOBAL_VARIABLES).map_err(map_err!(Table))?;
        txn.open_table(DEPLOY_STRATEGIES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Environments ───────────────────────────────────────────────

    /// Insert a new environment with all of its documents.
    ///
    /// Fails with [`StateError::AlreadyExists`] if an environment with the
    /// same (project, name) is already stored; nothing is written then.
    pub fn create_environment(&self, env: &Environment) -> StateResult<()> {
        let key = env.key();
        let mut txn = self.begin(&key)?;
        if txn.header_exists()? {
            txn.abort()?;
            return Err(StateError::AlreadyExists(key.to_string()));
        }
        txn.put_header(&env.header)?;
        txn.put_groups(&env.groups)?;
        txn.put_global_variables(&env.global_variables)?;
        txn.put_deploy_strategy(&env.deploy_strategy)?;
        txn.commit()?;
        debug!(%key, "environment created");
        Ok(())
    }

    /// Load an environment and all of its documents.
    pub fn get_environment(&self, key: &EnvironmentKey) -> StateResult<Option<Environment>> {
        let table_key = key.table_key();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;

        let header: EnvironmentHeader = {
            let table = txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
            match table.get(table_key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Ok(None),
            }
        };

        let groups = {
            let prefix = group_prefix(&table_key);
            let table = txn.open_table(SERVICE_GROUPS).map_err(map_err!(Table))?;
            let mut indexed = Vec::new();
            for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (k, value) = entry.map_err(map_err!(Read))?;
                if !k.value().starts_with(&prefix) {
                    break;
                }
                if let Some(index) = group_index(&table_key, k.value()) {
                    let services: Vec<ServiceInstance> = decode(value.value())?;
                    indexed.push((index, services));
                }
            }
            indexed.sort_by_key(|(index, _)| *index);
            indexed.into_iter().map(|(_, services)| services).collect()
        };

        let global_variables = {
            let table = txn.open_table(GLOBAL_VARIABLES).map_err(map_err!(Table))?;
            match table.get(table_key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => Vec::new(),
            }
        };

        let deploy_strategy = {
            let table = txn.open_table(DEPLOY_STRATEGIES).map_err(map_err!(Table))?;
            match table.get(table_key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => BTreeMap::new(),
            }
        };

        Ok(Some(Environment {
            header,
            groups,
            global_variables,
            deploy_strategy,
        }))
    }

    /// Load only the header document.
    pub fn get_header(&self, key: &EnvironmentKey) -> StateResult<Option<EnvironmentHeader>> {
        let table_key = key.table_key();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
        match table.get(table_key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List the headers of every environment in a project.
    pub fn list_environments(&self, project: &str) -> StateResult<Vec<EnvironmentHeader>> {
        let prefix = format!("{project}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (k, value) = entry.map_err(map_err!(Read))?;
            if !k.value().starts_with(&prefix) {
                break;
            }
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Overwrite the header document.
    pub fn put_header(&self, header: &EnvironmentHeader) -> StateResult<()> {
        let mut txn = self.begin(&header.key())?;
        txn.put_header(header)?;
        txn.commit()
    }

    /// Set status and error text in a write of its own, visible to readers
    /// as soon as it commits.
    pub fn set_status(
        &self,
        key: &EnvironmentKey,
        status: EnvStatus,
        error: Option<&str>,
    ) -> StateResult<()> {
        let mut txn = self.begin(key)?;
        let mut header = txn
            .header()?
            .ok_or_else(|| StateError::NotFound(key.to_string()))?;
        header.status = status;
        header.error = error.map(str::to_string);
        txn.put_header(&header)?;
        txn.commit()?;
        debug!(%key, %status, "environment status stored");
        Ok(())
    }

    /// Overwrite one service group document.
    pub fn put_group(
        &self,
        key: &EnvironmentKey,
        index: usize,
        services: &[ServiceInstance],
    ) -> StateResult<()> {
        let mut txn = self.begin(key)?;
        txn.put_group(index, services)?;
        txn.commit()?;
        debug!(%key, group = index, services = services.len(), "service group stored");
        Ok(())
    }

    /// Delete an environment and all of its documents. Returns true if it existed.
    pub fn delete_environment(&self, key: &EnvironmentKey) -> StateResult<bool> {
        let mut txn = self.begin(key)?;
        let existed = txn.delete_all()?;
        txn.commit()?;
        debug!(%key, existed, "environment deleted");
        Ok(existed)
    }

    /// Begin a transaction over the documents of one environment.
    pub fn begin(&self, key: &EnvironmentKey) -> StateResult<EnvTransaction> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        Ok(EnvTransaction {
            txn,
            key: key.table_key(),
        })
    }
}

/// A write transaction spanning every document of one environment.
///
/// Staged writes become visible together on [`commit`](Self::commit);
/// dropping the transaction (or calling [`abort`](Self::abort)) discards them.
pub struct EnvTransaction {
    txn: WriteTransaction,
    key: String,
}

impl EnvTransaction {
    fn put_json<T: Serialize + ?Sized>(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table
            .insert(key, bytes.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    fn header_exists(&self) -> StateResult<bool> {
        Ok(self.header()?.is_some())
    }

    /// Read the header as staged in this transaction.
    pub fn header(&self) -> StateResult<Option<EnvironmentHeader>> {
        let table = self.txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
        let result = match table.get(self.key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(result)
    }

    pub fn put_header(&mut self, header: &EnvironmentHeader) -> StateResult<()> {
        self.put_json(ENVIRONMENTS, &self.key, header)
    }

    pub fn put_group(&mut self, index: usize, services: &[ServiceInstance]) -> StateResult<()> {
        self.put_json(SERVICE_GROUPS, &group_key(&self.key, index), services)
    }

    /// Replace the full group list, removing group documents past its end.
    pub fn put_groups(&mut self, groups: &[Vec<ServiceInstance>]) -> StateResult<()> {
        for (index, services) in groups.iter().enumerate() {
            self.put_group(index, services)?;
        }
        let stale: Vec<String> = self
            .group_keys()?
            .into_iter()
            .filter(|k| group_index(&self.key, k).is_some_and(|i| i >= groups.len()))
            .collect();
        let mut table = self
            .txn
            .open_table(SERVICE_GROUPS)
            .map_err(map_err!(Table))?;
        for key in &stale {
            table.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        Ok(())
    }

    pub fn put_global_variables(&mut self, variables: &[GlobalVariable]) -> StateResult<()> {
        self.put_json(GLOBAL_VARIABLES, &self.key, variables)
    }

    pub fn put_deploy_strategy(
        &mut self,
        strategy: &BTreeMap<String, DeployStrategy>,
    ) -> StateResult<()> {
        self.put_json(DEPLOY_STRATEGIES, &self.key, strategy)
    }

    fn group_keys(&self) -> StateResult<Vec<String>> {
        let prefix = group_prefix(&self.key);
        let table = self
            .txn
            .open_table(SERVICE_GROUPS)
            .map_err(map_err!(Table))?;
        let mut keys = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(&prefix) {
                break;
            }
            if group_index(&self.key, key).is_some() {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }

    fn delete_all(&mut self) -> StateResult<bool> {
        let group_keys = self.group_keys()?;
        let existed;
        {
            let mut table = self.txn.open_table(ENVIRONMENTS).map_err(map_err!(Table))?;
            existed = table
                .remove(self.key.as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        {
            let mut table = self
                .txn
                .open_table(SERVICE_GROUPS)
                .map_err(map_err!(Table))?;
            for key in &group_keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        for def in [GLOBAL_VARIABLES, DEPLOY_STRATEGIES] {
            let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
            table.remove(self.key.as_str()).map_err(map_err!(Write))?;
        }
        Ok(existed)
    }

    /// Make every staged write visible.
    pub fn commit(self) -> StateResult<()> {
        self.txn.commit().map_err(map_err!(Transaction))
    }

    /// Discard every staged write.
    pub fn abort(self) -> StateResult<()> {
        self.txn.abort().map_err(map_err!(Transaction))
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}
