//! Feed and environment configuration.
//!
//! Each binary takes `--feed-config` and `--env-config` pointing at YAML
//! documents. Secrets never appear in YAML; they are resolved from
//! environment variables derived from the feed name (`{FEED}_API_KEY`,
//! `{FEED}_PRIVATE_KEY` or `{FEED}_PRIVATE_KEY_PATH`). A handful of
//! deployment-level values (`NATS_URL`, `ARCHIVE_ROOT`, `OBJECT_STORE_BUCKET`,
//! `SHARD_INDEX`, `SHARD_COUNT`) can override the environment YAML so one
//! document serves a whole fleet.
//!
//! Configuration errors are fatal at startup and never retried.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::frame::Kind;

fn default_capacity() -> usize {
    crate::ring::DEFAULT_CAPACITY
}

fn default_interner_capacity() -> u32 {
    1 << 20
}

fn default_heartbeat_secs() -> u64 {
    10
}

fn default_reconcile_secs() -> u64 {
    15
}

fn default_admin_port() -> u16 {
    8080
}

fn default_rotate_secs() -> u64 {
    300
}

fn default_max_compressed() -> u64 {
    64 * 1024 * 1024
}

fn default_max_uncompressed() -> u64 {
    512 * 1024 * 1024
}

fn default_dedup_secs() -> u64 {
    180
}

fn default_retention_bytes() -> i64 {
    32 * 1024 * 1024 * 1024
}

fn default_retention_hours() -> u64 {
    48
}

fn default_multipart_threshold() -> u64 {
    32 * 1024 * 1024
}

fn default_upload_sweep_secs() -> u64 {
    30
}

fn default_local_retention_secs() -> u64 {
    6 * 60 * 60
}

fn default_pause_free_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_drain_deadline_secs() -> u64 {
    5
}

fn default_max_drops_per_min() -> u64 {
    60
}

/// Which wire implementation drives the session. Closed enumeration; adding
/// an exchange means adding a variant and its module under `feed/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireKind {
    Kalshi,
    Polymarket,
    Sim,
}

/// How the session authenticates at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthSchemeKind {
    /// Signature over `timestamp + method + path` in signed headers.
    Signed,
    /// Static API key header.
    ApiKey,
    #[default]
    None,
}

/// Heartbeat convention for the session's liveness window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatKind {
    /// WebSocket protocol ping/pong, initiated by us.
    #[default]
    WsPing,
    /// Application-level text `PING` message.
    TextPing,
    /// Server sends heartbeats; we only watch for silence.
    Server,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub kind: HeartbeatKind,
    #[serde(default = "default_heartbeat_secs")]
    pub interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            kind: HeartbeatKind::default(),
            interval_secs: default_heartbeat_secs(),
        }
    }
}

/// Per-feed document: where to connect, how to frame subscriptions, and the
/// static seed of instruments to capture.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Feed label, also the bus subject component (e.g. `kalshi`).
    pub feed: String,
    pub wire: WireKind,
    /// WebSocket endpoint.
    pub endpoint: String,
    /// Demo/paper endpoint, selected by `{FEED}_USE_DEMO`.
    #[serde(default)]
    pub demo_endpoint: Option<String>,
    /// REST endpoint for initial book snapshots, when the wire needs one.
    #[serde(default)]
    pub snapshot_endpoint: Option<String>,
    #[serde(default)]
    pub auth: AuthSchemeKind,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Channels to subscribe per instrument.
    #[serde(default = "FeedConfig::default_channels")]
    pub channels: Vec<Kind>,
    /// Static seed of exchange-native instrument identifiers.
    #[serde(default)]
    pub instruments: Vec<String>,
    /// Exchange-imposed cap on instruments per connection; the subscription
    /// manager shards above this.
    #[serde(default = "FeedConfig::default_instrument_cap")]
    pub max_instruments_per_connection: usize,
    #[serde(default = "FeedConfig::default_connection_cap")]
    pub max_connections: usize,
    #[serde(default = "default_capacity")]
    pub ring_capacity: usize,
    /// Ring drops per minute above which the shard reports not ready.
    /// Isolated drops are only counted; a sustained rate past this raises
    /// the alert.
    #[serde(default = "default_max_drops_per_min")]
    pub max_drops_per_min: u64,
    #[serde(default = "default_interner_capacity")]
    pub interner_capacity: u32,
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_drain_deadline_secs")]
    pub drain_deadline_secs: u64,
}

impl FeedConfig {
    fn default_channels() -> Vec<Kind> {
        vec![Kind::Trade, Kind::Ticker, Kind::Orderbook, Kind::Lifecycle]
    }

    fn default_instrument_cap() -> usize {
        500
    }

    fn default_connection_cap() -> usize {
        4
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        let config: FeedConfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.feed.is_empty() {
            return Err(Error::Config("feed name is empty".into()));
        }
        if self.feed.contains('.') || self.feed.contains(' ') {
            return Err(Error::Config(format!(
                "feed name {:?} would break subject layout",
                self.feed
            )));
        }
        if self.endpoint.is_empty() {
            return Err(Error::Config("endpoint is empty".into()));
        }
        if self.max_instruments_per_connection == 0 {
            return Err(Error::Config("max_instruments_per_connection is zero".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections is zero".into()));
        }
        Ok(())
    }

    /// Environment-variable prefix for this feed's secrets (`kalshi` ->
    /// `KALSHI`).
    pub fn env_prefix(&self) -> String {
        self.feed.to_uppercase().replace('-', "_")
    }

    /// `{FEED}_API_KEY`.
    pub fn api_key(&self) -> Result<String> {
        let var = format!("{}_API_KEY", self.env_prefix());
        std::env::var(&var).map_err(|_| Error::Config(format!("missing env var {var}")))
    }

    /// `{FEED}_PRIVATE_KEY`, or the contents of `{FEED}_PRIVATE_KEY_PATH`.
    pub fn private_key(&self) -> Result<String> {
        let prefix = self.env_prefix();
        let direct = format!("{prefix}_PRIVATE_KEY");
        if let Ok(key) = std::env::var(&direct) {
            return Ok(key);
        }
        let path_var = format!("{prefix}_PRIVATE_KEY_PATH");
        if let Ok(path) = std::env::var(&path_var) {
            return std::fs::read_to_string(&path)
                .map(|s| s.trim().to_owned())
                .map_err(|e| Error::Config(format!("read key file {path}: {e}")));
        }
        Err(Error::Config(format!(
            "neither {direct} nor {path_var} is set"
        )))
    }

    /// `{FEED}_USE_DEMO` switches to the demo environment when truthy.
    pub fn use_demo(&self) -> bool {
        std::env::var(format!("{}_USE_DEMO", self.env_prefix()))
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    }

    /// The endpoint to dial, honoring the demo switch.
    pub fn resolve_endpoint(&mut self) -> Result<()> {
        if !self.use_demo() {
            return Ok(());
        }
        match self.demo_endpoint.take() {
            Some(demo) => {
                self.endpoint = demo;
                Ok(())
            }
            None => Err(Error::Config(format!(
                "{}_USE_DEMO is set but the feed has no demo_endpoint",
                self.env_prefix()
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardConfig {
    #[serde(default)]
    pub index: u32,
    #[serde(default = "ShardConfig::default_count")]
    pub count: u32,
}

impl ShardConfig {
    fn default_count() -> u32 {
        1
    }
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            index: 0,
            count: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RotationConfig {
    #[serde(default = "default_rotate_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_compressed")]
    pub max_compressed_bytes: u64,
    #[serde(default = "default_max_uncompressed")]
    pub max_uncompressed_bytes: u64,
    /// Archival time zone as a UTC offset in minutes; day boundaries and
    /// date directories follow it.
    #[serde(default)]
    pub utc_offset_mins: i32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_rotate_secs(),
            max_compressed_bytes: default_max_compressed(),
            max_uncompressed_bytes: default_max_uncompressed(),
            utc_offset_mins: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusSettings {
    pub url: String,
    #[serde(default = "default_dedup_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_retention_bytes")]
    pub max_bytes: i64,
    #[serde(default = "default_retention_hours")]
    pub max_age_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// S3-compatible bucket; empty disables uploads (local capture only).
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,
    #[serde(default = "default_upload_sweep_secs")]
    pub sweep_interval_secs: u64,
    /// Delay between confirmed upload and local delete.
    #[serde(default = "default_local_retention_secs")]
    pub local_retention_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: String::new(),
            multipart_threshold_bytes: default_multipart_threshold(),
            sweep_interval_secs: default_upload_sweep_secs(),
            local_retention_secs: default_local_retention_secs(),
        }
    }
}

/// Per-deployment document shared by the connector and the archiver.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvConfig {
    /// Deployment label, the leading subject component (e.g. `prod`).
    pub env: String,
    pub bus: BusSettings,
    #[serde(default)]
    pub archive_root: PathBuf,
    #[serde(default)]
    pub shard: ShardConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    /// Pause consumption when the archive volume's free space falls below
    /// this many bytes.
    #[serde(default = "default_pause_free_bytes")]
    pub pause_free_bytes: u64,
}

impl EnvConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        let mut config: EnvConfig = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("NATS_URL") {
            self.bus.url = url;
        }
        if let Ok(root) = std::env::var("ARCHIVE_ROOT") {
            self.archive_root = PathBuf::from(root);
        }
        if let Ok(bucket) = std::env::var("OBJECT_STORE_BUCKET") {
            self.upload.bucket = bucket;
        }
        if let Ok(index) = std::env::var("SHARD_INDEX") {
            self.shard.index = index
                .parse()
                .map_err(|_| Error::Config(format!("SHARD_INDEX not a u32: {index}")))?;
        }
        if let Ok(count) = std::env::var("SHARD_COUNT") {
            self.shard.count = count
                .parse()
                .map_err(|_| Error::Config(format!("SHARD_COUNT not a u32: {count}")))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.env.is_empty() {
            return Err(Error::Config("env label is empty".into()));
        }
        if self.env.contains('.') {
            return Err(Error::Config(format!(
                "env label {:?} would break subject layout",
                self.env
            )));
        }
        if self.bus.url.is_empty() {
            return Err(Error::Config("bus url is empty (set bus.url or NATS_URL)".into()));
        }
        if self.shard.count == 0 {
            return Err(Error::Config("shard count is zero".into()));
        }
        if self.shard.index >= self.shard.count {
            return Err(Error::Config(format!(
                "shard index {} out of range for count {}",
                self.shard.index, self.shard.count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn feed_config_minimal() {
        let file = write_yaml(
            "feed: kalshi\nwire: kalshi\nendpoint: wss://api.example.com/ws\nauth: signed\n",
        );
        let config = FeedConfig::load(file.path()).unwrap();
        assert_eq!(config.feed, "kalshi");
        assert_eq!(config.wire, WireKind::Kalshi);
        assert_eq!(config.auth, AuthSchemeKind::Signed);
        assert_eq!(config.ring_capacity, crate::ring::DEFAULT_CAPACITY);
        assert_eq!(config.max_drops_per_min, 60);
        assert_eq!(config.channels.len(), 4);
        assert_eq!(config.env_prefix(), "KALSHI");
    }

    #[test]
    fn feed_name_with_dot_rejected() {
        let file = write_yaml("feed: kal.shi\nwire: sim\nendpoint: sim://local\n");
        assert!(matches!(
            FeedConfig::load(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn env_config_defaults_and_validation() {
        let file = write_yaml("env: dev\nbus:\n  url: nats://localhost:4222\n");
        let config = EnvConfig::load(file.path()).unwrap();
        assert_eq!(config.env, "dev");
        assert_eq!(config.shard.count, 1);
        assert_eq!(config.rotation.interval_secs, 300);
        assert_eq!(config.rotation.max_compressed_bytes, 64 * 1024 * 1024);
        assert_eq!(config.bus.dedup_window_secs, 180);
    }

    #[test]
    fn shard_index_out_of_range_rejected() {
        let file = write_yaml(
            "env: dev\nbus:\n  url: nats://localhost:4222\nshard:\n  index: 3\n  count: 2\n",
        );
        assert!(matches!(EnvConfig::load(file.path()), Err(Error::Config(_))));
    }
}
