//! Resource directory
//!
//! Resources (servers, network devices, ...) are managed by the external CRUD
//! layer. The relay only needs enough of a record to open a shell: host, port,
//! and how the host is reached. Lookups go through the [`ResourceDirectory`]
//! trait so the storage backend stays out of the core.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// What kind of record a resource or credential is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Server,
    Device,
    Database,
    Site,
}

/// How the target host is reached.
///
/// Anything other than `Direct` is resolved by the directory before the record
/// reaches the pool: for jump/tunnel resources the directory hands back the
/// endpoint the relay can actually dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    #[default]
    Direct,
    Vpn,
    Jump,
    Tunnel,
}

/// A shell target as the pool sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: i64,
    pub resource_type: ResourceType,
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub network_type: NetworkType,
}

fn default_ssh_port() -> u16 {
    22
}

impl ResourceRecord {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("resource not found: {0}")]
    NotFound(i64),
}

/// Lookup seam to the external record store.
#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    async fn lookup(&self, resource_id: i64) -> Result<ResourceRecord, DirectoryError>;
}

/// In-memory directory backed by a preloaded inventory.
///
/// Used by the standalone binary (inventory file) and by tests. Deployments
/// with a real record store implement [`ResourceDirectory`] against it.
#[derive(Default)]
pub struct StaticDirectory {
    records: RwLock<HashMap<i64, ResourceRecord>>,
}

impl StaticDirectory {
    pub fn new(records: impl IntoIterator<Item = ResourceRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.id, r)).collect()),
        }
    }

    pub fn insert(&self, record: ResourceRecord) {
        self.records.write().insert(record.id, record);
    }
}

#[async_trait]
impl ResourceDirectory for StaticDirectory {
    async fn lookup(&self, resource_id: i64) -> Result<ResourceRecord, DirectoryError> {
        self.records
            .read()
            .get(&resource_id)
            .cloned()
            .ok_or(DirectoryError::NotFound(resource_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64) -> ResourceRecord {
        ResourceRecord {
            id,
            resource_type: ResourceType::Server,
            name: format!("srv-{id}"),
            host: "10.0.0.1".to_string(),
            port: 22,
            network_type: NetworkType::Direct,
        }
    }

    #[tokio::test]
    async fn lookup_returns_inserted_record() {
        let dir = StaticDirectory::new([record(7)]);
        let found = dir.lookup(7).await.unwrap();
        assert_eq!(found.name, "srv-7");
        assert_eq!(found.addr(), "10.0.0.1:22");
    }

    #[tokio::test]
    async fn lookup_unknown_id_fails() {
        let dir = StaticDirectory::default();
        assert!(matches!(dir.lookup(1).await, Err(DirectoryError::NotFound(1))));
    }
}
