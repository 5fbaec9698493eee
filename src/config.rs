use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

/// Upload ceiling enforced before anything is sent to the platform.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// Top-level path segments already taken by the router.
const RESERVED_SEGMENTS: &[&str] = &["files", "folders", "upload", "webhook", "healthz", "readyz"];

/// Which remote blob store implementation backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BlobBackend {
    /// The messaging platform's bot API.
    Telegram,
    /// In-process store, for local development.
    Memory,
}

impl FromStr for BlobBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "telegram" => Ok(Self::Telegram),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown blob backend `{}`", other),
        }
    }
}

/// Credentials and endpoint of the remote blob store.
///
/// Built once at startup and handed to the client constructor.
#[derive(Clone)]
pub struct BlobStoreConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base_url: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for BlobStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStoreConfig")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .field("api_base_url", &self.api_base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub blob_backend: BlobBackend,
    pub blob_store: BlobStoreConfig,
    pub max_upload_bytes: u64,
    pub proxy_base: String,
    pub webhook_secret: Option<String>,
    pub log_level: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Folder tree over chat-hosted file storage")]
pub struct Args {
    /// Host to bind to (overrides CHAT_DRIVE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHAT_DRIVE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides CHAT_DRIVE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Blob store backend (overrides CHAT_DRIVE_BLOB_BACKEND)
    #[arg(long, value_enum)]
    pub blob_backend: Option<BlobBackend>,

    /// Bot API base URL (overrides CHAT_DRIVE_API_BASE_URL)
    #[arg(long)]
    pub api_base_url: Option<String>,

    /// Largest accepted upload in bytes (overrides CHAT_DRIVE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Seconds allowed for URL resolution and the first upstream byte
    /// (overrides CHAT_DRIVE_UPSTREAM_TIMEOUT_SECS)
    #[arg(long)]
    pub upstream_timeout_secs: Option<u64>,

    /// Path segment the proxy is mounted under (overrides CHAT_DRIVE_PROXY_BASE)
    #[arg(long)]
    pub proxy_base: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("CHAT_DRIVE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse::<u16>("CHAT_DRIVE_PORT")?.unwrap_or(3000);
        let env_db = env::var("CHAT_DRIVE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/chat_drive.db?mode=rwc".into());
        let env_backend = env_parse::<BlobBackend>("CHAT_DRIVE_BLOB_BACKEND")?
            .unwrap_or(BlobBackend::Telegram);
        let env_api_base = env::var("CHAT_DRIVE_API_BASE_URL")
            .unwrap_or_else(|_| "https://api.telegram.org".into());
        let env_max_upload =
            env_parse::<u64>("CHAT_DRIVE_MAX_UPLOAD_BYTES")?.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
        let env_timeout = env_parse::<u64>("CHAT_DRIVE_UPSTREAM_TIMEOUT_SECS")?.unwrap_or(10);
        let env_proxy_base = env::var("CHAT_DRIVE_PROXY_BASE").unwrap_or_else(|_| "proxy".into());
        let log_level = env::var("CHAT_DRIVE_LOG_LEVEL").unwrap_or_else(|_| "info".into());

        let bot_token = env::var("CHAT_DRIVE_BOT_TOKEN").unwrap_or_default();
        let chat_id = env::var("CHAT_DRIVE_CHAT_ID").unwrap_or_default();
        let webhook_secret = env::var("CHAT_DRIVE_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty());

        // --- Merge ---
        let blob_backend = args.blob_backend.unwrap_or(env_backend);
        let timeout_secs = args.upstream_timeout_secs.unwrap_or(env_timeout);
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            blob_backend,
            blob_store: BlobStoreConfig {
                bot_token,
                chat_id,
                api_base_url: args
                    .api_base_url
                    .unwrap_or(env_api_base)
                    .trim_end_matches('/')
                    .to_string(),
                timeout: Duration::from_secs(timeout_secs.max(1)),
            },
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
            proxy_base: args
                .proxy_base
                .unwrap_or(env_proxy_base)
                .trim_matches('/')
                .to_string(),
            webhook_secret,
            log_level,
        };

        cfg.validate()?;
        Ok((cfg, args.migrate))
    }

    fn validate(&self) -> Result<()> {
        if self.blob_backend == BlobBackend::Telegram {
            if self.blob_store.bot_token.is_empty() {
                bail!("CHAT_DRIVE_BOT_TOKEN is required for the telegram backend");
            }
            if self.blob_store.chat_id.is_empty() {
                bail!("CHAT_DRIVE_CHAT_ID is required for the telegram backend");
            }
        }
        if self.proxy_base.is_empty() {
            bail!("proxy base must not be empty");
        }
        if RESERVED_SEGMENTS.contains(&self.proxy_base.as_str()) {
            bail!("proxy base `{}` collides with a built-in route", self.proxy_base);
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            max_upload_bytes: self.max_upload_bytes,
            upstream_timeout: self.blob_store.timeout,
            proxy_base: self.proxy_base.clone(),
            webhook_secret: self.webhook_secret.clone(),
        }
    }
}

/// Knobs shared by the HTTP gateways, independent of how they were parsed.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub max_upload_bytes: u64,
    pub upstream_timeout: Duration,
    pub proxy_base: String,
    pub webhook_secret: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            upstream_timeout: Duration::from_secs(10),
            proxy_base: "proxy".into(),
            webhook_secret: None,
        }
    }
}

/// Read and parse an optional environment variable.
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
