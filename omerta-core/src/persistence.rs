//! Persisted state, keyed by networkId: identity keypair, peer records, membership
//! metadata. Format is JSON (an implementation choice, not dictated by the spec);
//! writes are atomic-replace (write to a temp file, then rename over the target),
//! matching the teacher's `datadir.rs` approach to on-disk state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::peer::PeerRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPeerEndpoint {
    pub endpoint: String,
    pub is_relay: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPeer {
    pub peer_id_hex: String,
    pub endpoints: Vec<PersistedPeerEndpoint>,
    pub reliability: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedNetworkState {
    pub network_id_hex: String,
    pub identity_secret_hex: String,
    pub peers: Vec<PersistedPeer>,
    pub membership_note: Option<String>,
}

fn network_state_path(storage_directory: &Path, network_id_hex: &str) -> PathBuf {
    storage_directory.join(format!("{network_id_hex}.json"))
}

/// Writes `state` to disk with atomic-replace semantics: a sibling temp file is
/// written and fsynced, then renamed over the target, so a crash mid-write never
/// leaves a half-written state file in place.
pub async fn save(storage_directory: &Path, state: &PersistedNetworkState) -> Result<()> {
    tokio::fs::create_dir_all(storage_directory).await?;
    let target = network_state_path(storage_directory, &state.network_id_hex);
    let tmp = target.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(state).map_err(|e| crate::error::Error::InvalidConfiguration(e.to_string()))?;
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, &target).await?;
    Ok(())
}

pub async fn load(storage_directory: &Path, network_id_hex: &str) -> Result<Option<PersistedNetworkState>> {
    let target = network_state_path(storage_directory, network_id_hex);
    match tokio::fs::read(&target).await {
        Ok(bytes) => {
            let state = serde_json::from_slice(&bytes).map_err(|e| crate::error::Error::InvalidConfiguration(e.to_string()))?;
            Ok(Some(state))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn peer_records_to_persisted(records: &[PeerRecord]) -> Vec<PersistedPeer> {
    records
        .iter()
        .map(|r| PersistedPeer {
            peer_id_hex: r.peer_id.to_hex(),
            endpoints: r
                .endpoints
                .iter()
                .filter(|e| e.authenticated)
                .map(|e| PersistedPeerEndpoint { endpoint: e.endpoint.as_str().to_string(), is_relay: e.is_relay })
                .collect(),
            reliability: r.reliability,
        })
        .collect()
}
