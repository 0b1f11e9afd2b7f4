use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;

const DEFAULT_MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
const DEV_JWT_SECRET: &str = "leadhub-dev-secret-change-me";

/// Runtime settings, read from the environment (and `.env` via dotenv).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Root of the git-backed journal holding the agent and lead documents.
    pub data_dir: PathBuf,
    /// Where uploads are staged while they are parsed.
    pub upload_dir: PathBuf,
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    pub max_upload_bytes: usize,
    pub allow_registration: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = env_or("BIND_ADDR", "0.0.0.0:5000")
            .parse()
            .context("BIND_ADDR must be a socket address like 0.0.0.0:5000")?;

        let jwt_secret = match std::env::var("JWT_SECRET") {
            Ok(s) if !s.trim().is_empty() => s,
            _ => {
                tracing::warn!("JWT_SECRET not set, using the built-in development secret");
                DEV_JWT_SECRET.to_string()
            }
        };

        let token_ttl_hours = env_or("TOKEN_TTL_HOURS", "24")
            .parse::<i64>()
            .context("TOKEN_TTL_HOURS must be an integer")?;
        if token_ttl_hours <= 0 {
            anyhow::bail!("TOKEN_TTL_HOURS must be positive");
        }

        let max_upload_bytes = env_or("MAX_UPLOAD_BYTES", &DEFAULT_MAX_UPLOAD_BYTES.to_string())
            .parse::<usize>()
            .context("MAX_UPLOAD_BYTES must be a byte count")?;

        let allow_registration = env_or("ALLOW_REGISTRATION", "true")
            .parse::<bool>()
            .context("ALLOW_REGISTRATION must be true or false")?;

        Ok(Config {
            bind_addr,
            data_dir: PathBuf::from(env_or("DATA_DIR", "leadhub_data")),
            upload_dir: PathBuf::from(env_or("UPLOAD_DIR", "uploads")),
            jwt_secret,
            token_ttl_hours,
            max_upload_bytes,
            allow_registration,
        })
    }

    /// Settings rooted in the given directories, used by tests and tooling.
    pub fn for_dirs(data_dir: impl Into<PathBuf>, upload_dir: impl Into<PathBuf>) -> Self {
        Config {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            data_dir: data_dir.into(),
            upload_dir: upload_dir.into(),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            token_ttl_hours: 24,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allow_registration: true,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
