#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::session::JoinPolicy;

/// Default config path: `~/.relay/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".relay").join("config.toml"))
}

/// Load the relay config from TOML at `path` and `RELAY_*` env overrides.
pub fn load_relay_config_from_path(path: &Path) -> anyhow::Result<RelayConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = RelayConfig::from_file(file_cfg)?;

	apply_env_overrides_from(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
	/// Shared token clients present in `Hello.auth_token`.
	pub auth_token: Option<SecretString>,
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// HTTP API and health bind address (host:port).
	pub http_bind: Option<String>,
	/// Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for signed `v1.<payload>.<sig>` tokens.
	pub auth_hmac_secret: Option<SecretString>,
	/// Outbound event queue depth per session.
	pub subscriber_queue_capacity: usize,
	pub send_rate_limit_burst: u32,
	pub send_rate_limit_per_minute: u32,
	pub room_join_policy: JoinPolicy,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			tls_cert_path: None,
			tls_key_path: None,
			http_bind: None,
			metrics_bind: None,
			auth_hmac_secret: None,
			subscriber_queue_capacity: 1024,
			send_rate_limit_burst: 20,
			send_rate_limit_per_minute: 120,
			room_join_policy: JoinPolicy::Open,
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// `sqlite:` or `postgres:` URL. Unset keeps messages in memory only.
	pub database_url: Option<String>,
	pub store_timeout: Duration,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: None,
			store_timeout: Duration::from_millis(5000),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	auth_token: Option<String>,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	http_bind: Option<String>,
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	subscriber_queue_capacity: Option<usize>,
	send_rate_limit_burst: Option<u32>,
	send_rate_limit_per_minute: Option<u32>,
	room_join_policy: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
	store_timeout_ms: Option<u64>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

impl RelayConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ServerSettings::default();
		let room_join_policy = match non_blank(file.server.room_join_policy) {
			Some(p) => p.parse::<JoinPolicy>().context("server.room_join_policy")?,
			None => defaults.room_join_policy,
		};

		Ok(Self {
			auth_token: non_blank(file.auth_token).map(SecretString::new),
			server: ServerSettings {
				tls_cert_path: non_blank(file.server.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_blank(file.server.tls_key_path).map(PathBuf::from),
				http_bind: non_blank(file.server.http_bind),
				metrics_bind: non_blank(file.server.metrics_bind),
				auth_hmac_secret: non_blank(file.server.auth_hmac_secret).map(SecretString::new),
				subscriber_queue_capacity: file
					.server
					.subscriber_queue_capacity
					.filter(|c| *c > 0)
					.unwrap_or(defaults.subscriber_queue_capacity),
				send_rate_limit_burst: file.server.send_rate_limit_burst.unwrap_or(defaults.send_rate_limit_burst),
				send_rate_limit_per_minute: file
					.server
					.send_rate_limit_per_minute
					.unwrap_or(defaults.send_rate_limit_per_minute),
				room_join_policy,
			},
			persistence: PersistenceSettings {
				database_url: non_blank(file.persistence.database_url),
				store_timeout: file
					.persistence
					.store_timeout_ms
					.filter(|ms| *ms > 0)
					.map(Duration::from_millis)
					.unwrap_or(PersistenceSettings::default().store_timeout),
			},
		})
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

/// Overlay `RELAY_*` variables resolved through `lookup`.
pub(crate) fn apply_env_overrides_from(cfg: &mut RelayConfig, lookup: impl Fn(&str) -> Option<String>) {
	let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = get("RELAY_SERVER_AUTH_TOKEN") {
		cfg.auth_token = Some(SecretString::new(v));
		info!("server auth: auth_token overridden by env");
	}

	if let Some(v) = get("RELAY_SERVER_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = get("RELAY_SERVER_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = get("RELAY_SERVER_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = get("RELAY_HTTP_BIND") {
		cfg.server.http_bind = Some(v);
		info!("server config: http_bind overridden by env");
	}

	if let Some(v) = get("RELAY_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = get("RELAY_SUBSCRIBER_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.server.subscriber_queue_capacity = capacity;
		info!(capacity, "server config: subscriber_queue_capacity overridden by env");
	}

	if let Some(v) = get("RELAY_SEND_RATE_LIMIT_BURST")
		&& let Ok(burst) = v.parse::<u32>()
	{
		cfg.server.send_rate_limit_burst = burst;
		info!(burst, "server config: send_rate_limit_burst overridden by env");
	}

	if let Some(v) = get("RELAY_SEND_RATE_LIMIT_PER_MINUTE")
		&& let Ok(rate) = v.parse::<u32>()
	{
		cfg.server.send_rate_limit_per_minute = rate;
		info!(rate, "server config: send_rate_limit_per_minute overridden by env");
	}

	if let Some(v) = get("RELAY_ROOM_JOIN_POLICY") {
		match v.parse::<JoinPolicy>() {
			Ok(policy) => {
				cfg.server.room_join_policy = policy;
				info!(?policy, "server config: room_join_policy overridden by env");
			}
			Err(e) => warn!(error = %e, "ignoring RELAY_ROOM_JOIN_POLICY"),
		}
	}

	if let Some(v) = get("RELAY_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = get("RELAY_STORE_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.persistence.store_timeout = Duration::from_millis(ms);
		info!(ms, "persistence: store_timeout overridden by env");
	}

	if cfg.server.tls_cert_path.is_some() != cfg.server.tls_key_path.is_some() {
		warn!("server config: tls_cert_path and tls_key_path must be set together; using dev certificate");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> RelayConfig {
		let file: FileConfig = toml::from_str(toml_src).expect("valid toml");
		RelayConfig::from_file(file).expect("valid config")
	}

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = parse("");
		assert!(cfg.auth_token.is_none());
		assert_eq!(cfg.server.subscriber_queue_capacity, 1024);
		assert_eq!(cfg.server.room_join_policy, JoinPolicy::Open);
		assert_eq!(cfg.persistence.store_timeout, Duration::from_secs(5));
		assert!(cfg.persistence.database_url.is_none());
	}

	#[test]
	fn file_values_are_read_and_blanks_ignored() {
		let cfg = parse(
			r#"
auth_token = "  "

[server]
http_bind = "127.0.0.1:8080"
auth_hmac_secret = "s3cret"
send_rate_limit_burst = 0
room_join_policy = "members"

[persistence]
database_url = "sqlite://relay.db"
store_timeout_ms = 250
"#,
		);
		assert!(cfg.auth_token.is_none());
		assert_eq!(cfg.server.http_bind.as_deref(), Some("127.0.0.1:8080"));
		assert_eq!(cfg.server.auth_hmac_secret.as_ref().map(|s| s.expose()), Some("s3cret"));
		assert_eq!(cfg.server.send_rate_limit_burst, 0);
		assert_eq!(cfg.server.room_join_policy, JoinPolicy::Members);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite://relay.db"));
		assert_eq!(cfg.persistence.store_timeout, Duration::from_millis(250));
	}

	#[test]
	fn unknown_join_policy_is_an_error() {
		let file: FileConfig = toml::from_str("[server]\nroom_join_policy = \"vip\"").expect("valid toml");
		assert!(RelayConfig::from_file(file).is_err());
	}

	#[test]
	fn env_overrides_win_and_bad_values_are_ignored() {
		let env: HashMap<&str, &str> = HashMap::from([
			("RELAY_SERVER_AUTH_TOKEN", " tok "),
			("RELAY_DATABASE_URL", "postgres://db/relay"),
			("RELAY_SEND_RATE_LIMIT_PER_MINUTE", "not-a-number"),
			("RELAY_SUBSCRIBER_QUEUE_CAPACITY", "16"),
			("RELAY_ROOM_JOIN_POLICY", "members"),
			("RELAY_STORE_TIMEOUT_MS", "0"),
		]);
		let mut cfg = RelayConfig::default();
		apply_env_overrides_from(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.auth_token.as_ref().map(|s| s.expose()), Some("tok"));
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("postgres://db/relay"));
		assert_eq!(cfg.server.send_rate_limit_per_minute, 120);
		assert_eq!(cfg.server.subscriber_queue_capacity, 16);
		assert_eq!(cfg.server.room_join_policy, JoinPolicy::Members);
		assert_eq!(cfg.persistence.store_timeout, Duration::from_secs(5));
	}

	#[test]
	fn secrets_are_redacted() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert!(!format!("{s:?}").contains("hunter2"));
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let path = std::env::temp_dir().join(format!("relay-missing-{}.toml", uuid::Uuid::new_v4()));
		assert!(read_toml_if_exists(&path).expect("read").is_none());
	}
}
