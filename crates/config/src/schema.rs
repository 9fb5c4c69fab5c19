use keygate_types::{Capability, DEFAULT_IDENTITY, GatewayError, ProviderId};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

/// Environment variable prefix for overrides (`KEYGATE_HTTP__REQUEST_TIMEOUT_SECS=30`).
pub const ENV_PREFIX: &str = "KEYGATE_";

fn default_true() -> bool {
    true
}

// ── store ────────────────────────────────────────────────────────────────────

/// At-rest protection of credential files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    /// AES-256-GCM with a key read from `store.key_env`.
    #[default]
    Aes256Gcm,
    /// Plain JSON protected by file permissions only.
    None,
}

fn default_key_env() -> String {
    "KEYGATE_STORE_KEY".to_string()
}
fn default_cache_ttl() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Credential directory; `~/.keygate/credentials` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub encryption: EncryptionMode,
    /// Name of the environment variable holding the hex-encoded 32-byte key.
    #[serde(default = "default_key_env")]
    pub key_env: String,
    /// How long a cached record is served before the file is re-read.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: None,
            encryption: EncryptionMode::default(),
            key_env: default_key_env(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

impl StoreConfig {
    /// The configured directory, or `$HOME/.keygate/credentials`.
    #[must_use]
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".keygate").join("credentials")
        })
    }
}

// ── http ─────────────────────────────────────────────────────────────────────

fn default_request_timeout() -> u64 {
    120
}
fn default_credential_timeout() -> u64 {
    30
}
fn default_stream_buffer() -> usize {
    keygate_types::DEFAULT_STREAM_BUFFER
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Timeout for non-streaming upstream calls.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Timeout for token exchange, refresh, and revoke calls.
    #[serde(default = "default_credential_timeout")]
    pub credential_timeout_secs: u64,
    /// Chunks buffered per streaming request.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            credential_timeout_secs: default_credential_timeout(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

// ── oauth / exchange ─────────────────────────────────────────────────────────

/// OAuth2 + PKCE client profile for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthProfileConfig {
    pub client_id: String,
    pub auth_url: String,
    pub token_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_url: Option<String>,
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Additional query parameters appended to the authorization URL.
    #[serde(default)]
    pub extra_auth_params: BTreeMap<String, String>,
}

impl OAuthProfileConfig {
    /// Built-in profile for Claude accounts (callback port 54545).
    #[must_use]
    pub fn claude() -> Self {
        Self {
            client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".into(),
            auth_url: "https://claude.ai/oauth/authorize".into(),
            token_url: "https://console.anthropic.com/v1/oauth/token".into(),
            revoke_url: Some("https://console.anthropic.com/v1/oauth/revoke".into()),
            redirect_uri: "http://localhost:54545/callback".into(),
            // Only user-level scopes: org:create_api_key starts a console
            // billing flow.
            scopes: vec!["user:profile".into(), "user:inference".into()],
            extra_auth_params: BTreeMap::from([("code".into(), "true".into())]),
        }
    }
}

fn default_rotating_claim() -> String {
    "rotating_token".to_string()
}
fn default_cache_margin() -> u64 {
    30
}

/// JWT rotating-token exchange profile for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeProfileConfig {
    /// Endpoint receiving `POST {"rotating_token": ...}`.
    pub exchange_url: String,
    /// Claim holding the rotating token inside the bearer JWT.
    #[serde(default = "default_rotating_claim")]
    pub rotating_claim: String,
    /// Cached tokens this close to expiry are evicted on read.
    #[serde(default = "default_cache_margin")]
    pub cache_margin_secs: u64,
}

// ── executors / routes ───────────────────────────────────────────────────────

/// Upstream wire family an executor speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorFamily {
    /// Anthropic Messages API.
    Claude,
    /// `OpenAI`-compatible chat completions.
    Openai,
}

fn default_identity() -> String {
    DEFAULT_IDENTITY.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Routing key referenced from `routes`.
    pub id: String,
    pub family: ExecutorFamily,
    /// Provider whose stored credential this executor uses.
    pub provider: ProviderId,
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Overrides the family's default endpoint base.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Overrides the family's default capability set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<Capability>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateConfig {
    pub executor: String,
    /// Lower runs first; ties keep declaration order.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub requires: Vec<Capability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Exact model name or a prefix glob ending in a single `*`.
    pub pattern: String,
    pub candidates: Vec<CandidateConfig>,
}

// ── log ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// ── top level ────────────────────────────────────────────────────────────────

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub http: HttpConfig,
    /// OAuth profiles keyed by provider id.
    #[serde(default)]
    pub oauth: BTreeMap<ProviderId, OAuthProfileConfig>,
    /// JWT exchange profiles keyed by provider id.
    #[serde(default)]
    pub exchange: BTreeMap<ProviderId, ExchangeProfileConfig>,
    #[serde(default)]
    pub executors: Vec<ExecutorConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            http: HttpConfig::default(),
            oauth: BTreeMap::from([(ProviderId::claude(), OAuthProfileConfig::claude())]),
            exchange: BTreeMap::new(),
            executors: vec![ExecutorConfig {
                id: "claude".into(),
                family: ExecutorFamily::Claude,
                provider: ProviderId::claude(),
                identity: default_identity(),
                base_url: None,
                capabilities: None,
                enabled: true,
            }],
            routes: vec![RouteConfig {
                pattern: "claude-*".into(),
                candidates: vec![CandidateConfig {
                    executor: "claude".into(),
                    priority: 0,
                    requires: Vec::new(),
                }],
            }],
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Parses configuration from a YAML string, merged with defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`figment::Error`] if the YAML is invalid or extraction fails.
    #[allow(clippy::result_large_err)]
    pub fn from_yaml(yaml: &str) -> Result<Self, figment::Error> {
        use figment::{
            Figment,
            providers::{Format as _, Serialized, Yaml},
        };
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::string(yaml))
            .extract()
    }

    /// Loads configuration from defaults, an optional YAML file, and
    /// `KEYGATE_*` environment variables, then validates it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the file cannot be parsed or the
    /// result fails [`Config::validate`].
    pub fn load(path: Option<&Path>) -> keygate_types::Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format as _, Serialized, Yaml},
        };
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(GatewayError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-references between executors and routes.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] on duplicate executor ids, routes
    /// naming unknown or repeated executors, malformed patterns, or a zero
    /// stream buffer.
    pub fn validate(&self) -> keygate_types::Result<()> {
        let mut ids = HashSet::new();
        for exec in &self.executors {
            if exec.id.is_empty() {
                return Err(GatewayError::Config("executor id must not be empty".into()));
            }
            if !ids.insert(exec.id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate executor id: {}",
                    exec.id
                )));
            }
        }
        for route in &self.routes {
            let stars = route.pattern.matches('*').count();
            if route.pattern.is_empty()
                || stars > 1
                || (stars == 1 && !route.pattern.ends_with('*'))
            {
                return Err(GatewayError::Config(format!(
                    "invalid route pattern {:?}: use an exact name or a single trailing '*'",
                    route.pattern
                )));
            }
            if route.candidates.is_empty() {
                return Err(GatewayError::Config(format!(
                    "route {} has no candidates",
                    route.pattern
                )));
            }
            if let Some(c) = route.candidates.iter().find(|c| !ids.contains(c.executor.as_str())) {
                return Err(GatewayError::Config(format!(
                    "route {} references unknown executor {}",
                    route.pattern, c.executor
                )));
            }
            let mut listed = HashSet::with_capacity(route.candidates.len());
            if let Some(c) = route.candidates.iter().find(|c| !listed.insert(c.executor.as_str())) {
                return Err(GatewayError::Config(format!(
                    "route {} lists executor {} more than once",
                    route.pattern, c.executor
                )));
            }
        }
        if self.http.stream_buffer == 0 {
            return Err(GatewayError::Config("http.stream_buffer must be > 0".into()));
        }
        Ok(())
    }
}
