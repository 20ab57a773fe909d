//! Environment-derived server configuration.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Hard lower bound on the negotiated chunk size.
pub const MIN_CHUNK_SIZE_BYTES: i64 = 1024 * 1024;

/// Hard upper bound on the negotiated chunk size.
pub const MAX_CHUNK_SIZE_BYTES: i64 = 50 * 1024 * 1024;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_CHUNK_SIZE_BYTES: i64 = 25 * 1024 * 1024;
const DEFAULT_MAX_UPLOAD_BYTES: i64 = 10 * 1024 * 1024 * 1024;
const DEFAULT_RELEASE_MAX_BYTES: i64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_LFS_THRESHOLD_BYTES: i64 = 1024 * 1024 * 1024;
const DEFAULT_INLINE_MAX_BYTES: i64 = 25 * 1024 * 1024;
const DEFAULT_SCRATCH_DIR: &str = "tmp/uploads";
const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_IDLE_CHUNK_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
const DEFAULT_REMOTE_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";
const DEFAULT_GITHUB_UPLOADS_BASE: &str = "https://uploads.github.com";

/// Server runtime configuration, read from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub listen: SocketAddr,

    /// Shared secret presented by the upstream proxy.
    pub api_key: String,

    /// Overall request timeout applied to the HTTP server.
    pub request_timeout: Duration,

    pub database: DatabaseConfig,
    pub github: GitHubConfig,
    pub chunking: ChunkingConfig,
    pub strategy: StrategyConfig,
    pub scratch: ScratchConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Connection string for the metadata store.
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    /// Static access token for the storage account.
    pub token: String,

    /// Account that owns the storage repository.
    pub owner: String,

    /// Repository completed objects are written to.
    pub repo: String,

    /// REST API base; overridable for self-hosted instances.
    pub api_base: String,

    /// Upload API base used for release assets.
    pub uploads_base: String,

    /// Bounded attempts per remote call, transient failures only.
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Preferred chunk size before clamping.
    pub default_chunk_size: i64,

    /// Operator-configured ceiling, itself clamped to the hard bounds.
    pub max_chunk_size: i64,
}

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Uploads larger than this are rejected at init.
    pub max_upload_bytes: i64,

    pub release_max_bytes: i64,
    pub lfs_threshold_bytes: i64,
    pub inline_max_bytes: i64,

    pub enable_release_assets: bool,
    pub enable_git_lfs: bool,
    pub enable_inline_blob: bool,
}

#[derive(Debug, Clone)]
pub struct ScratchConfig {
    /// Root directory for staged chunks.
    pub root: PathBuf,

    /// How long a session may sit without chunk activity before a
    /// sweeper may reclaim its scratch space.
    pub idle_chunk_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifetime of a session from init until it expires.
    pub ttl: Duration,
}

impl Config {
    /// Reads and validates the full configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let port = env_u16("UPLOAD_SERVER_PORT", DEFAULT_PORT)?;
        let listen: SocketAddr = ([0, 0, 0, 0], port).into();

        let config = Self {
            listen,
            api_key: required("UPLOAD_SERVICE_API_KEY")?,
            request_timeout: env_duration_secs(
                "UPLOAD_REQUEST_TIMEOUT",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?,
            database: DatabaseConfig {
                url: required("DATABASE_URL")?,
            },
            github: GitHubConfig {
                token: required("GITHUB_ACCESS_TOKEN")?,
                owner: required("GITHUB_STORAGE_OWNER")?,
                repo: required("GITHUB_STORAGE_REPO")?,
                api_base: env_string("GITHUB_API_BASE", DEFAULT_GITHUB_API_BASE),
                uploads_base: env_string("GITHUB_UPLOADS_BASE", DEFAULT_GITHUB_UPLOADS_BASE),
                max_attempts: env_u32("GITHUB_MAX_ATTEMPTS", DEFAULT_REMOTE_MAX_ATTEMPTS)?,
            },
            chunking: ChunkingConfig {
                default_chunk_size: env_i64("UPLOAD_CHUNK_SIZE", DEFAULT_CHUNK_SIZE_BYTES)?,
                max_chunk_size: env_i64("UPLOAD_MAX_CHUNK_SIZE", MAX_CHUNK_SIZE_BYTES)?,
            },
            strategy: StrategyConfig {
                max_upload_bytes: env_i64("UPLOAD_MAX_SIZE", DEFAULT_MAX_UPLOAD_BYTES)?,
                release_max_bytes: env_i64("UPLOAD_RELEASE_MAX_BYTES", DEFAULT_RELEASE_MAX_BYTES)?,
                lfs_threshold_bytes: env_i64("UPLOAD_LFS_THRESHOLD", DEFAULT_LFS_THRESHOLD_BYTES)?,
                inline_max_bytes: env_i64("UPLOAD_INLINE_MAX_BYTES", DEFAULT_INLINE_MAX_BYTES)?,
                enable_release_assets: env_bool("UPLOAD_ENABLE_RELEASE_ASSETS", true)?,
                enable_git_lfs: env_bool("UPLOAD_ENABLE_GIT_LFS", false)?,
                enable_inline_blob: env_bool("UPLOAD_ENABLE_INLINE_BLOB", false)?,
            },
            scratch: ScratchConfig {
                root: PathBuf::from(env_string("UPLOAD_SCRATCH_DIR", DEFAULT_SCRATCH_DIR)),
                idle_chunk_timeout: env_duration_secs(
                    "UPLOAD_IDLE_CHUNK_TIMEOUT",
                    DEFAULT_IDLE_CHUNK_TIMEOUT_SECS,
                )?,
            },
            session: SessionConfig {
                ttl: env_duration_secs("UPLOAD_SESSION_TTL", DEFAULT_SESSION_TTL_SECS)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.chunking.default_chunk_size <= 0 {
            bail!("UPLOAD_CHUNK_SIZE must be positive");
        }
        if self.chunking.max_chunk_size < self.chunking.default_chunk_size {
            bail!("UPLOAD_MAX_CHUNK_SIZE must not be below UPLOAD_CHUNK_SIZE");
        }
        if self.strategy.max_upload_bytes <= 0 {
            bail!("UPLOAD_MAX_SIZE must be positive");
        }
        if self.github.max_attempts == 0 {
            bail!("GITHUB_MAX_ATTEMPTS must be at least 1");
        }
        Ok(())
    }
}

fn required(key: &str) -> Result<String> {
    let value = env::var(key).unwrap_or_default();
    let value = value.trim();
    if value.is_empty() {
        bail!("{key} is required");
    }
    Ok(value.to_string())
}

fn env_string(key: &str, fallback: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_i64(key: &str, fallback: i64) -> Result<i64> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .with_context(|| format!("{key} must be an integer")),
        _ => Ok(fallback),
    }
}

fn env_u16(key: &str, fallback: u16) -> Result<u16> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a port number")),
        _ => Ok(fallback),
    }
}

fn env_u32(key: &str, fallback: u32) -> Result<u32> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .with_context(|| format!("{key} must be an unsigned integer")),
        _ => Ok(fallback),
    }
}

fn env_bool(key: &str, fallback: bool) -> Result<bool> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => match value.trim() {
            "1" | "true" | "TRUE" | "True" => Ok(true),
            "0" | "false" | "FALSE" | "False" => Ok(false),
            other => bail!("{key} must be a boolean, got {other:?}"),
        },
        _ => Ok(fallback),
    }
}

fn env_duration_secs(key: &str, fallback_secs: u64) -> Result<Duration> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            let secs: u64 = value
                .trim()
                .parse()
                .with_context(|| format!("{key} must be a number of seconds"))?;
            Ok(Duration::from_secs(secs))
        }
        _ => Ok(Duration::from_secs(fallback_secs)),
    }
}
