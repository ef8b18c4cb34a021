//! Configuration file persistence
//!
//! Best-effort JSON snapshot of a station's mutable state, named by the
//! station `hash_id`. The file carries a content hash over its payload
//! fields; an unchanged hash suppresses the write. Writes across all
//! stations are serialized by a single named lock so concurrent saves do
//! not interleave.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::domain::configuration::ConfigurationKey;
use crate::domain::connector::{Connector, Evse};
use crate::domain::template::AutomaticTransactionGeneratorConfiguration;
use crate::domain::StationInfo;
use crate::support::errors::StationInitError;

/// Exclusion for the configuration-file write path ("configuration").
static CONFIGURATION_FILE_LOCK: Mutex<()> = Mutex::const_new(());

/// Per-connector ATG run state persisted across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtgConnectorStatus {
    pub start: bool,
    #[serde(default)]
    pub accepted_start_transaction_requests: u64,
    #[serde(default)]
    pub rejected_start_transaction_requests: u64,
    #[serde(default)]
    pub accepted_stop_transaction_requests: u64,
    #[serde(default)]
    pub rejected_stop_transaction_requests: u64,
}

/// On-disk configuration document. Connectors XOR EVSEs, matching the
/// station model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_info: Option<StationInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_key: Option<Vec<ConfigurationKey>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automatic_transaction_generator: Option<AutomaticTransactionGeneratorConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automatic_transaction_generator_statuses: Option<BTreeMap<u32, AtgConnectorStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connectors_status: Option<BTreeMap<u32, Connector>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evses_status: Option<BTreeMap<u32, Evse>>,
}

impl PersistedConfiguration {
    /// Hash over every field except the hash itself.
    fn content_hash(&self) -> String {
        let mut hashable = self.clone();
        hashable.configuration_hash = None;
        // serializing an owned struct with total serde impls never fails
        let bytes = serde_json::to_vec(&hashable).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// Reads and writes one station's configuration file.
pub struct ConfigurationFile {
    path: PathBuf,
}

impl ConfigurationFile {
    pub fn new(directory: &Path, hash_id: &str) -> Self {
        Self {
            path: directory.join(format!("{hash_id}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted document, if the file exists. A corrupt file is
    /// reported as an error so startup can decide to proceed without it.
    pub fn load(&self) -> Result<Option<PersistedConfiguration>, StationInitError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the document. Returns `true` when a write actually happened;
    /// an unchanged content hash suppresses it.
    pub async fn save(&self, mut document: PersistedConfiguration) -> std::io::Result<bool> {
        let hash = document.content_hash();

        let _guard = CONFIGURATION_FILE_LOCK.lock().await;

        let previous_hash = match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice::<PersistedConfiguration>(&bytes)
                .ok()
                .and_then(|existing| existing.configuration_hash),
            Err(_) => None,
        };
        if previous_hash.as_deref() == Some(hash.as_str()) {
            debug!(path = %self.path.display(), "Configuration unchanged, skipping write");
            return Ok(false);
        }

        document.configuration_hash = Some(hash);
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        match tokio::fs::write(&self.path, bytes).await {
            Ok(()) => {
                info!(path = %self.path.display(), "Configuration saved");
                Ok(true)
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Configuration save failed");
                Err(e)
            }
        }
    }
}
