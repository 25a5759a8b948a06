//! SQLite backing store: open databases by name

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use idbstore_core::{IdbName, StoreResult};
use parking_lot::Mutex;
use tracing::info;

use crate::blob_registry::BlobRegistry;
use crate::config::StoreConfig;
use crate::connection::{ConnectionOwner, DatabaseConnection, SharedConnection};
use crate::database::SqliteDatabase;
use crate::logging::prefix;

/// Keeps one connection per open database.
///
/// Cloning shares the same set of databases.
#[derive(Clone)]
pub struct SqliteBackingStore {
    inner: Arc<BackingStoreInner>,
}

struct BackingStoreInner {
    config: StoreConfig,
    connections: Mutex<HashMap<IdbName, SharedConnection>>,
    blob_registry: BlobRegistry,
}

impl SqliteBackingStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(BackingStoreInner {
                config,
                connections: Mutex::new(HashMap::new()),
                blob_registry: BlobRegistry::new(),
            }),
        }
    }

    /// Create a backing store with the default configuration (for testing)
    pub fn in_memory() -> Self {
        Self::new(StoreConfig::default())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Registry of the active blobs of every database in this store
    pub fn blob_registry(&self) -> &BlobRegistry {
        &self.inner.blob_registry
    }

    /// Open `name`, creating it if it does not exist yet.
    ///
    /// Every handle to the same name shares one connection. A new database
    /// starts zygotic: version [`NO_VERSION`](idbstore_core::NO_VERSION), no object stores.
    pub fn open_database(&self, name: impl Into<IdbName>) -> StoreResult<SqliteDatabase> {
        let name = name.into();
        let mut connections = self.inner.connections.lock();
        if let Some(connection) = connections.get(&name) {
            return Ok(SqliteDatabase::new(Arc::downgrade(connection)));
        }

        let inner: Weak<BackingStoreInner> = Arc::downgrade(&self.inner);
        let owner: Weak<dyn ConnectionOwner> = inner;
        let connection = DatabaseConnection::open(
            &name,
            self.inner.config.clone(),
            owner,
            self.inner.blob_registry.clone(),
        )?;
        let database = SqliteDatabase::new(Arc::downgrade(&connection));
        connections.insert(name, connection);
        Ok(database)
    }

    /// Delete `name`. Deleting a database that is not open is a no-op.
    pub fn delete_database(&self, name: impl Into<IdbName>) -> StoreResult<()> {
        let name = name.into();
        let connection = self.inner.connections.lock().get(&name).cloned();
        match connection {
            Some(connection) => {
                let mut db = connection.lock();
                db.delete_idb_database()?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn has_database(&self, name: impl Into<IdbName>) -> bool {
        self.inner.connections.lock().contains_key(&name.into())
    }

    /// Names of the databases with a live connection, zygotic ones included.
    pub fn database_names(&self) -> Vec<IdbName> {
        let mut names: Vec<IdbName> = self.inner.connections.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl ConnectionOwner for BackingStoreInner {
    fn destroy_connection(&self, name: &IdbName, connection: &Weak<Mutex<DatabaseConnection>>) {
        let removed = {
            let mut connections = self.connections.lock();
            match connections.get(name) {
                Some(existing) if Arc::as_ptr(existing) == connection.as_ptr() => {
                    connections.remove(name)
                }
                _ => None,
            }
        };
        // Callers hold their own strong reference, so this is never the last one
        if removed.is_some() {
            info!("{} Destroyed database {}", prefix::PULSE_CLOSE, name);
        }
    }
}

impl std::fmt::Debug for SqliteBackingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackingStore")
            .field("config", &self.inner.config)
            .field("databases", &self.inner.connections.lock().len())
            .finish()
    }
}
