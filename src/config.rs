//! Server configuration from flags and environment variables.

use crate::sandbox::SandboxConfig;
use clap::Args;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Flags of the `serve` subcommand. Each one can also come from the
/// environment (and therefore from a `.env` file).
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "COLLABD_PORT", default_value = "3002")]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "COLLABD_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Shared state store; without it state stays in this process
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// HS256 secret of identity tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Parent directory of project working directories [default: OS temp dir]
    #[arg(long, env = "WORKSPACE_ROOT")]
    pub workspace_root: Option<PathBuf>,

    /// Comma separated CORS origins
    #[arg(long, env = "ALLOWED_ORIGINS", default_value = "http://localhost:3000")]
    pub allowed_origins: String,

    /// Lock lifetime since the last write
    #[arg(long, env = "LOCK_TTL_SECS", default_value = "300")]
    pub lock_ttl_secs: u64,

    /// Endpoint receiving file records
    #[arg(long, env = "METADATA_URL")]
    pub metadata_url: Option<String>,

    /// Base url answering project membership; without it every
    /// authenticated user may work in every project
    #[arg(long, env = "ACCESS_URL")]
    pub access_url: Option<String>,

    #[arg(long, env = "SANDBOX_IMAGE", default_value = "sandbox")]
    pub sandbox_image: String,

    #[arg(long, env = "SANDBOX_USER", default_value = "sandbox")]
    pub sandbox_user: String,

    /// Container port published to an OS-assigned host port
    #[arg(long, env = "SANDBOX_PORT", default_value = "5173")]
    pub sandbox_port: u16,

    /// Where the project directory is mounted in the container
    #[arg(long, env = "SANDBOX_MOUNT", default_value = "/home/sandbox/app")]
    pub sandbox_mount: String,

    #[arg(long, env = "DOCKER_BIN", default_value = "docker")]
    pub docker_bin: PathBuf,

    /// Delay between opening a shell and relaying input
    #[arg(long, env = "EXEC_WARMUP_MS", default_value = "1500")]
    pub exec_warmup_ms: u64,
}

/// Validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub jwt_secret: String,
    pub workspace_root: PathBuf,
    pub allowed_origins: Vec<String>,
    pub lock_ttl: Duration,
    pub metadata_url: Option<String>,
    pub access_url: Option<String>,
    pub docker_bin: PathBuf,
    pub sandbox: SandboxConfig,
}

impl TryFrom<ServeArgs> for Config {
    type Error = ConfigError;

    fn try_from(args: ServeArgs) -> Result<Self, ConfigError> {
        if args.jwt_secret.trim().is_empty() {
            return Err(ConfigError::Missing("JWT_SECRET"));
        }
        if args.lock_ttl_secs == 0 {
            return Err(ConfigError::Invalid("LOCK_TTL_SECS must be positive".into()));
        }
        if args.sandbox_port == 0 {
            return Err(ConfigError::Invalid("SANDBOX_PORT must be positive".into()));
        }
        let allowed_origins: Vec<String> = args
            .allowed_origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
        if allowed_origins.is_empty() {
            return Err(ConfigError::Missing("ALLOWED_ORIGINS"));
        }
        let redis_url = args.redis_url.filter(|u| !u.trim().is_empty());
        let metadata_url = args.metadata_url.filter(|u| !u.trim().is_empty());
        let access_url = args.access_url.filter(|u| !u.trim().is_empty());

        Ok(Self {
            listen_addr: SocketAddr::new(args.bind, args.port),
            redis_url,
            jwt_secret: args.jwt_secret,
            workspace_root: args.workspace_root.unwrap_or_else(std::env::temp_dir),
            allowed_origins,
            lock_ttl: Duration::from_secs(args.lock_ttl_secs),
            metadata_url,
            access_url,
            docker_bin: args.docker_bin,
            sandbox: SandboxConfig {
                image: args.sandbox_image,
                user: args.sandbox_user,
                service_port: args.sandbox_port,
                mount_point: args.sandbox_mount,
                exec_warmup: Duration::from_millis(args.exec_warmup_ms),
                ..SandboxConfig::default()
            },
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting: {0}")]
    Invalid(String),
}
