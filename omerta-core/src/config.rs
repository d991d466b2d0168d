use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::is_valid_channel_name;
use crate::error::{Error, Result};

fn millis<'de, D>(d: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Duration::from_millis(u64::deserialize(d)?))
}

fn millis_opt<'de, D>(d: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
}

/// One `host:port@peerIdHex`-equivalent bootstrap entry, parsed eagerly at config load
/// time so a malformed bootstrap list fails fast instead of at first gossip round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub peer_id_hex: String,
    pub endpoint: String,
}

/// All recognized configuration options (spec.md §6 / SPEC_FULL.md §7). Deserializable
/// from JSON so it can be loaded the way the teacher's `LocalConfig` is loaded, but
/// equally constructible by hand for tests and embedders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 32-byte symmetric network key. Required; exactly 32 bytes.
    #[serde(with = "hex_bytes_32")]
    pub encryption_key: [u8; 32],

    pub storage_directory: PathBuf,

    /// UDP port to bind; 0 means an OS-assigned ephemeral port.
    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub can_relay: bool,
    #[serde(default)]
    pub can_coordinate_hole_punch: bool,

    #[serde(default = "defaults::target_relay_count")]
    pub target_relay_count: usize,
    #[serde(default = "defaults::max_relay_count")]
    pub max_relay_count: usize,
    #[serde(default = "defaults::max_relay_sessions")]
    pub max_relay_sessions: usize,

    #[serde(default = "defaults::keepalive_interval", deserialize_with = "millis")]
    pub keepalive_interval: Duration,
    #[serde(default = "defaults::connection_timeout", deserialize_with = "millis")]
    pub connection_timeout: Duration,
    #[serde(default = "defaults::cache_cleanup_interval", deserialize_with = "millis")]
    pub cache_cleanup_interval: Duration,

    #[serde(default)]
    pub bootstrap_peers: Vec<BootstrapPeer>,

    #[serde(default = "defaults::max_cached_peers")]
    pub max_cached_peers: usize,
    #[serde(default = "defaults::peer_cache_ttl", deserialize_with = "millis")]
    pub peer_cache_ttl: Duration,

    #[serde(default = "defaults::hole_punch_probe_count")]
    pub hole_punch_probe_count: usize,
    #[serde(default = "defaults::hole_punch_probe_interval", deserialize_with = "millis")]
    pub hole_punch_probe_interval: Duration,
    #[serde(default = "defaults::hole_punch_timeout", deserialize_with = "millis")]
    pub hole_punch_timeout: Duration,
    #[serde(default = "defaults::hole_punch_cooldown", deserialize_with = "millis")]
    pub hole_punch_cooldown: Duration,

    #[serde(default = "defaults::recent_contact_max_age", deserialize_with = "millis")]
    pub recent_contact_max_age: Duration,
    #[serde(default = "defaults::freshness_query_interval", deserialize_with = "millis")]
    pub freshness_query_interval: Duration,

    #[serde(default)]
    pub force_relay_only: bool,
    #[serde(default)]
    pub allow_localhost: bool,

    #[serde(default)]
    pub stun_servers: Vec<String>,

    #[serde(default = "defaults::ingress_keepalive_interval", deserialize_with = "millis")]
    pub ingress_keepalive_interval: Duration,
    #[serde(default = "defaults::tunnel_idle_timeout", deserialize_with = "millis")]
    pub tunnel_idle_timeout: Duration,

    #[serde(default, deserialize_with = "millis_opt")]
    pub replay_window_horizon: Option<Duration>,

    /// Ceiling on total Announce payload bytes sent per `freshness_query_interval` tick
    /// (spec.md §4.6); recipients beyond the budget are simply not announced to that
    /// tick, ranked lowest-priority-first by `channel_priority`.
    #[serde(default = "defaults::gossip_byte_budget")]
    pub gossip_byte_budget: usize,
}

mod hex_bytes_32 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into().map_err(|_| serde::de::Error::custom("encryption_key must be 32 bytes"))
    }
}

mod defaults {
    use std::time::Duration;

    pub fn target_relay_count() -> usize {
        2
    }
    pub fn max_relay_count() -> usize {
        8
    }
    pub fn max_relay_sessions() -> usize {
        64
    }
    pub fn keepalive_interval() -> Duration {
        Duration::from_secs(25)
    }
    pub fn connection_timeout() -> Duration {
        Duration::from_secs(10)
    }
    pub fn cache_cleanup_interval() -> Duration {
        Duration::from_secs(60)
    }
    pub fn max_cached_peers() -> usize {
        4096
    }
    pub fn peer_cache_ttl() -> Duration {
        Duration::from_secs(3600)
    }
    pub fn hole_punch_probe_count() -> usize {
        5
    }
    pub fn hole_punch_probe_interval() -> Duration {
        Duration::from_millis(100)
    }
    pub fn hole_punch_timeout() -> Duration {
        Duration::from_secs(5)
    }
    pub fn hole_punch_cooldown() -> Duration {
        Duration::from_secs(30)
    }
    pub fn recent_contact_max_age() -> Duration {
        Duration::from_secs(120)
    }
    pub fn freshness_query_interval() -> Duration {
        Duration::from_secs(30)
    }
    pub fn ingress_keepalive_interval() -> Duration {
        Duration::from_secs(15)
    }
    pub fn tunnel_idle_timeout() -> Duration {
        Duration::from_secs(120)
    }
    pub fn gossip_byte_budget() -> usize {
        16 * 1024
    }
}

impl Config {
    /// Validates everything that can be checked without network I/O: key length,
    /// channel-name-shaped fields are checked where channels are actually registered,
    /// not here. Called once at `Mesh::start`.
    pub fn validate(&self) -> Result<()> {
        if self.encryption_key.len() != 32 {
            return Err(Error::InvalidConfiguration("encryption_key must be 32 bytes".into()));
        }
        for b in &self.bootstrap_peers {
            if hex::decode(&b.peer_id_hex).map(|v| v.len()) != Ok(omerta_crypto::PEER_ID_SIZE) {
                return Err(Error::InvalidConfiguration(format!(
                    "bootstrap peer id is not a valid {}-byte hex string: {}",
                    omerta_crypto::PEER_ID_SIZE,
                    b.peer_id_hex
                )));
            }
        }
        if self.max_cached_peers == 0 {
            return Err(Error::InvalidConfiguration("max_cached_peers must be > 0".into()));
        }
        Ok(())
    }

    /// Validates a channel name against the shared rule (≤64 chars, `[A-Za-z0-9_-]`).
    pub fn validate_channel_name(name: &str) -> Result<()> {
        if is_valid_channel_name(name) {
            Ok(())
        } else {
            Err(Error::InvalidChannelName(name.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            encryption_key: [7u8; 32],
            storage_directory: PathBuf::from("/tmp/omerta-test"),
            port: 0,
            can_relay: false,
            can_coordinate_hole_punch: false,
            target_relay_count: defaults::target_relay_count(),
            max_relay_count: defaults::max_relay_count(),
            max_relay_sessions: defaults::max_relay_sessions(),
            keepalive_interval: defaults::keepalive_interval(),
            connection_timeout: defaults::connection_timeout(),
            cache_cleanup_interval: defaults::cache_cleanup_interval(),
            bootstrap_peers: Vec::new(),
            max_cached_peers: defaults::max_cached_peers(),
            peer_cache_ttl: defaults::peer_cache_ttl(),
            hole_punch_probe_count: defaults::hole_punch_probe_count(),
            hole_punch_probe_interval: defaults::hole_punch_probe_interval(),
            hole_punch_timeout: defaults::hole_punch_timeout(),
            hole_punch_cooldown: defaults::hole_punch_cooldown(),
            recent_contact_max_age: defaults::recent_contact_max_age(),
            freshness_query_interval: defaults::freshness_query_interval(),
            force_relay_only: false,
            allow_localhost: true,
            stun_servers: Vec::new(),
            ingress_keepalive_interval: defaults::ingress_keepalive_interval(),
            tunnel_idle_timeout: defaults::tunnel_idle_timeout(),
            replay_window_horizon: None,
            gossip_byte_budget: defaults::gossip_byte_budget(),
        }
    }

    #[test]
    fn accepts_well_formed_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_zero_max_cached_peers() {
        let mut c = base_config();
        c.max_cached_peers = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn channel_name_boundaries() {
        assert!(Config::validate_channel_name(&"a".repeat(64)).is_ok());
        assert!(Config::validate_channel_name(&"a".repeat(65)).is_err());
        assert!(Config::validate_channel_name("bad channel").is_err());
        assert!(Config::validate_channel_name("good-channel_1").is_ok());
    }
}
