//! Server configuration loading from file and environment variables.

use issuer_chain::GasSettings;
use issuer_types::{Blockchain, DidMethod, NetworkId, RevocationStatusMode};
use serde::{Deserialize, Deserializer};
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub kms: KmsConfig,
    #[serde(default)]
    pub ethereum: EthereumConfig,
    #[serde(default)]
    pub revocation: RevocationConfig,
    #[serde(default)]
    pub schema_cache: SchemaCacheConfig,
    #[serde(default)]
    pub circuits: CircuitsConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Base URL wallets reach this server at. Agent, QR and callback URLs
    /// are built from it.
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "issuer_state=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Basic auth credentials guarding the issuer API.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_user")]
    pub user: String,
    #[serde(default = "default_auth_password")]
    pub password: String,
}

/// DID flavour of identities created without explicit metadata.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_method", deserialize_with = "parsed")]
    pub method: DidMethod,
    #[serde(default = "default_blockchain", deserialize_with = "parsed")]
    pub blockchain: Blockchain,
    #[serde(default = "default_network", deserialize_with = "parsed")]
    pub network: NetworkId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyBackend {
    Local,
    Vault,
    Aws,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KmsConfig {
    /// Backend for Baby Jubjub auth keys. `local` or `vault`.
    #[serde(default = "default_key_backend")]
    pub bjj_provider: KeyBackend,
    /// Backend for secp256k1 gas keys. `local`, `vault` or `aws`.
    #[serde(default = "default_key_backend")]
    pub eth_provider: KeyBackend,

    /// Encrypted key file of the local backend.
    #[serde(default = "default_key_file")]
    pub local_path: String,
    /// Without a passphrase the local backend keeps keys in memory only.
    #[serde(default)]
    pub passphrase: Option<String>,

    #[serde(default = "default_vault_addr")]
    pub vault_addr: String,
    #[serde(default = "default_vault_mount")]
    pub vault_mount: String,
    #[serde(default)]
    pub vault_token: Option<String>,

    #[serde(default)]
    pub aws_region: String,
    #[serde(default)]
    pub aws_access_key: String,
    #[serde(default)]
    pub aws_secret_key: String,
    #[serde(default)]
    pub aws_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EthereumConfig {
    /// JSON-RPC endpoint. Without one the node runs against an in-memory
    /// State contract.
    #[serde(default)]
    pub rpc_url: Option<String>,
    #[serde(default)]
    pub state_contract: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default)]
    pub gas: GasSettings,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_confirmation_blocks")]
    pub confirmation_blocks: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_wait_receipt_cycle_secs")]
    pub wait_receipt_cycle_secs: u64,
    #[serde(default = "default_publish_interval_secs")]
    pub publish_interval_secs: u64,
    /// Turns the background publisher off entirely.
    #[serde(default = "default_true")]
    pub publishing_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevocationConfig {
    /// Status mode of credentials that do not ask for one.
    #[serde(default, deserialize_with = "parsed")]
    pub mode: RevocationStatusMode,
    /// Reverse hash service base URL.
    #[serde(default)]
    pub rhs_url: Option<String>,
    /// Identity tree store contract for on-chain RHS.
    #[serde(default)]
    pub rhs_contract: Option<String>,
    #[serde(default)]
    pub ignore_rhs_errors: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    Memory,
    Redis,
    Valkey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaCacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,
    /// `redis://[:password@]host:port[/db]` for the redis and valkey backends.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default)]
    pub ipfs_gateway: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitsConfig {
    /// Directory holding one sub-directory of artifacts per circuit.
    #[serde(default = "default_circuits_path")]
    pub path: String,
    #[serde(default = "default_node_bin")]
    pub node_bin: String,
    #[serde(default = "default_prover_bin")]
    pub prover_bin: String,
    #[serde(default = "default_proving_timeout_secs")]
    pub proving_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_qr_ttl_secs")]
    pub qr_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn parsed<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3001
}

fn default_public_url() -> String {
    format!("http://localhost:{}", default_port())
}

fn default_db_path() -> String {
    "issuer.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_auth_user() -> String {
    "user".to_string()
}

fn default_auth_password() -> String {
    "password".to_string()
}

fn default_method() -> DidMethod {
    DidMethod::PolygonId
}

fn default_blockchain() -> Blockchain {
    Blockchain::Polygon
}

fn default_network() -> NetworkId {
    NetworkId::Amoy
}

fn default_key_backend() -> KeyBackend {
    KeyBackend::Local
}

fn default_key_file() -> String {
    "keys.json".to_string()
}

fn default_vault_addr() -> String {
    "http://127.0.0.1:8200".to_string()
}

fn default_vault_mount() -> String {
    "secret".to_string()
}

fn default_chain_id() -> u64 {
    80002
}

fn default_rpc_timeout_secs() -> u64 {
    10
}

fn default_confirmation_blocks() -> u64 {
    10
}

fn default_confirmation_timeout_secs() -> u64 {
    600
}

fn default_wait_receipt_cycle_secs() -> u64 {
    5
}

fn default_publish_interval_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_cache_backend() -> CacheBackend {
    CacheBackend::Memory
}

fn default_cache_capacity() -> usize {
    256
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_circuits_path() -> String {
    "circuits".to_string()
}

fn default_node_bin() -> String {
    "node".to_string()
}

fn default_prover_bin() -> String {
    "rapidsnark".to_string()
}

fn default_proving_timeout_secs() -> u64 {
    120
}

fn default_session_ttl_secs() -> u64 {
    issuer_types::DEFAULT_SESSION_TTL_SECS
}

fn default_qr_ttl_secs() -> u64 {
    issuer_types::DEFAULT_QR_TTL_SECS
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: default_public_url(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user: default_auth_user(),
            password: default_auth_password(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            blockchain: default_blockchain(),
            network: default_network(),
        }
    }
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            bjj_provider: default_key_backend(),
            eth_provider: default_key_backend(),
            local_path: default_key_file(),
            passphrase: None,
            vault_addr: default_vault_addr(),
            vault_mount: default_vault_mount(),
            vault_token: None,
            aws_region: String::new(),
            aws_access_key: String::new(),
            aws_secret_key: String::new(),
            aws_endpoint: None,
        }
    }
}

impl Default for EthereumConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            state_contract: String::new(),
            chain_id: default_chain_id(),
            gas: GasSettings::default(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
            confirmation_blocks: default_confirmation_blocks(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            wait_receipt_cycle_secs: default_wait_receipt_cycle_secs(),
            publish_interval_secs: default_publish_interval_secs(),
            publishing_enabled: true,
        }
    }
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            mode: RevocationStatusMode::default(),
            rhs_url: None,
            rhs_contract: None,
            ignore_rhs_errors: false,
        }
    }
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            url: None,
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            ipfs_gateway: None,
        }
    }
}

impl Default for CircuitsConfig {
    fn default() -> Self {
        Self {
            path: default_circuits_path(),
            node_bin: default_node_bin(),
            prover_bin: default_prover_bin(),
            proving_timeout_secs: default_proving_timeout_secs(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            qr_ttl_secs: default_qr_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl EthereumConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Cross-field checks serde cannot express.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kms.bjj_provider == KeyBackend::Aws {
            return Err(ConfigError::Invalid(
                "kms.bjj_provider: aws cannot hold baby jubjub keys".into(),
            ));
        }
        if self.ethereum.rpc_url.is_some() && self.ethereum.state_contract.is_empty() {
            return Err(ConfigError::Invalid(
                "ethereum.state_contract is required with ethereum.rpc_url".into(),
            ));
        }
        if self.schema_cache.backend != CacheBackend::Memory && self.schema_cache.url.is_none() {
            return Err(ConfigError::Invalid(
                "schema_cache.url is required for redis and valkey".into(),
            ));
        }
        match self.revocation.mode {
            RevocationStatusMode::OffChain if self.revocation.rhs_url.is_none() => {
                Err(ConfigError::Invalid("revocation.rhs_url is required for off_chain".into()))
            }
            RevocationStatusMode::OnChain if self.revocation.rhs_contract.is_none() => Err(
                ConfigError::Invalid("revocation.rhs_contract is required for on_chain".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `ISSUER_HOST` overrides `server.host`
/// - `ISSUER_PORT` overrides `server.port`
/// - `ISSUER_PUBLIC_URL` overrides `server.public_url`
/// - `ISSUER_DB_PATH` overrides `database.path`
/// - `ISSUER_LOG_LEVEL` overrides `logging.level`
/// - `ISSUER_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `ISSUER_AUTH_PASSWORD` overrides `auth.password`
/// - `ISSUER_RPC_URL` overrides `ethereum.rpc_url`
/// - `ISSUER_KMS_PASSPHRASE` overrides `kms.passphrase`
/// - `ISSUER_VAULT_TOKEN` overrides `kms.vault_token`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the result fails [`Config::validate`].
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("ISSUER_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("ISSUER_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(url) = std::env::var("ISSUER_PUBLIC_URL") {
        config.server.public_url = url;
    }
    if let Ok(db_path) = std::env::var("ISSUER_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("ISSUER_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("ISSUER_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(password) = std::env::var("ISSUER_AUTH_PASSWORD") {
        config.auth.password = password;
    }
    if let Ok(rpc) = std::env::var("ISSUER_RPC_URL") {
        config.ethereum.rpc_url = Some(rpc).filter(|s| !s.is_empty());
    }
    if let Ok(passphrase) = std::env::var("ISSUER_KMS_PASSPHRASE") {
        config.kms.passphrase = Some(passphrase);
    }
    if let Ok(token) = std::env::var("ISSUER_VAULT_TOKEN") {
        config.kms.vault_token = Some(token);
    }

    config.validate()?;
    Ok(config)
}
