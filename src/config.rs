//! Service configuration loaded from environment variables.

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::tools::ToolPaths;

/// Layer the artwork is meant for when the client does not name one.
pub const DEFAULT_LAYER_NAME: &str = "ARTWORK HERE";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Runtime configuration for the compositor service.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub tools: ToolPaths,
    pub tool_timeout: Duration,
    /// Per-file upload limit in bytes.
    pub max_upload_bytes: usize,
    pub concurrency: usize,
    pub default_dpi: u32,
    pub default_layer_name: String,
    pub work_dir: PathBuf,
    pub redis_url: Option<String>,
    pub job_ttl_secs: u64,
    pub json_logs: bool,
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// Environment variables:
    /// - `PORT`: when set, binds `0.0.0.0:$PORT` (takes precedence over `BIND_ADDR`)
    /// - `BIND_ADDR`: listen address (default: 0.0.0.0:8080)
    /// - `GS_BIN`, `MAGICK_BIN`, `CONVERT_BIN`, `QPDF_BIN`, `PDFTK_BIN`: tool binaries
    /// - `TOOL_TIMEOUT_SECS`: per-invocation timeout (default: 120)
    /// - `MAX_UPLOAD_MB`: per-file upload limit (default: 50)
    /// - `COMPOSITE_CONCURRENCY`: concurrent composite jobs (default: 4)
    /// - `DEFAULT_DPI`: raster resolution (default: 300)
    /// - `DEFAULT_LAYER_NAME`: target layer (default: ARTWORK HERE)
    /// - `WORK_DIR`: scratch directory root (default: system temp dir)
    /// - `REDIS_URL`: job record store (default: in-memory)
    /// - `JOB_TTL_SECS`: job record lifetime in Redis (default: 86400)
    /// - `LOG_FORMAT`: `json` for JSON logs
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr = match get("PORT") {
            Some(port) => {
                let port: u16 = port
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid PORT: {}", port))?;
                SocketAddr::from(([0, 0, 0, 0], port))
            }
            None => {
                let raw = get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
                raw.trim()
                    .parse()
                    .with_context(|| format!("Invalid BIND_ADDR: {}", raw))?
            }
        };

        let defaults = ToolPaths::default();
        let tools = ToolPaths {
            ghostscript: get("GS_BIN").unwrap_or(defaults.ghostscript),
            magick: get("MAGICK_BIN").unwrap_or(defaults.magick),
            convert: get("CONVERT_BIN").unwrap_or(defaults.convert),
            qpdf: get("QPDF_BIN").unwrap_or(defaults.qpdf),
            pdftk: get("PDFTK_BIN").unwrap_or(defaults.pdftk),
        };

        let timeout_secs: u64 = parse_or(&get, "TOOL_TIMEOUT_SECS", 120)?;
        let max_upload_mb: usize = parse_or(&get, "MAX_UPLOAD_MB", 50)?;
        let concurrency: usize = parse_or(&get, "COMPOSITE_CONCURRENCY", 4)?;
        let default_dpi: u32 = parse_or(&get, "DEFAULT_DPI", 300)?;
        let job_ttl_secs: u64 = parse_or(&get, "JOB_TTL_SECS", 86_400)?;

        if timeout_secs == 0 {
            bail!("TOOL_TIMEOUT_SECS must be greater than zero");
        }
        if max_upload_mb == 0 {
            bail!("MAX_UPLOAD_MB must be greater than zero");
        }
        if concurrency == 0 {
            bail!("COMPOSITE_CONCURRENCY must be greater than zero");
        }
        if !crate::validation::DPI_RANGE.contains(&default_dpi) {
            bail!(
                "DEFAULT_DPI must be within {}..={}",
                crate::validation::DPI_RANGE.start(),
                crate::validation::DPI_RANGE.end()
            );
        }

        Ok(Self {
            bind_addr,
            tools,
            tool_timeout: Duration::from_secs(timeout_secs),
            max_upload_bytes: max_upload_mb * 1024 * 1024,
            concurrency,
            default_dpi,
            default_layer_name: get("DEFAULT_LAYER_NAME")
                .unwrap_or_else(|| DEFAULT_LAYER_NAME.to_string()),
            work_dir: get("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            redis_url: get("REDIS_URL"),
            job_ttl_secs,
            json_logs: get("LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            tools: ToolPaths::default(),
            tool_timeout: Duration::from_secs(120),
            max_upload_bytes: 50 * 1024 * 1024,
            concurrency: 4,
            default_dpi: 300,
            default_layer_name: DEFAULT_LAYER_NAME.to_string(),
            work_dir: std::env::temp_dir(),
            redis_url: None,
            job_ttl_secs: 86_400,
            json_logs: false,
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {}: {}", key, raw)),
        None => Ok(default),
    }
}
