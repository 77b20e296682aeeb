//! Environment-driven configuration. The raw HTTPS listener and TLS
//! termination are out of scope (a reverse proxy is expected in front of
//! this process); `TLS_CERT`/`TLS_KEY` are accepted and logged only.

use anyhow::Result;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub host: String,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub page_size: u32,
    pub delivery_workers: u32,
    pub delivery_max_attempts: u32,
    pub data_dir: PathBuf,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_var(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let data_dir = match env_var("DATA_DIR") {
            Some(v) => PathBuf::from(v),
            None => default_data_dir()?,
        };

        let cfg = Self {
            port: env_parse("PORT", 8080u16),
            host: env_var("HOST").unwrap_or_else(|| "localhost".to_string()),
            tls_cert: env_var("TLS_CERT"),
            tls_key: env_var("TLS_KEY"),
            page_size: env_parse("PAGE_SIZE", 20u32),
            delivery_workers: env_parse("DELIVERY_WORKERS", 4u32),
            delivery_max_attempts: env_parse("DELIVERY_MAX_ATTEMPTS", 8u32),
            data_dir,
        };

        if cfg.tls_cert.is_some() || cfg.tls_key.is_some() {
            tracing::info!(
                "TLS_CERT/TLS_KEY configured but ignored by this process; terminate TLS upstream"
            );
        }

        Ok(cfg)
    }

    /// Scheme + host used to mint IRIs. This process itself only ever binds plain HTTP.
    pub fn base_url(&self) -> String {
        format!("https://{}", self.host)
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("actorhub.sqlite3")
    }
}

fn default_data_dir() -> Result<PathBuf> {
    use anyhow::Context;
    let proj = directories::ProjectDirs::from("social", "actorhub", "ActorHub")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_uses_https() {
        let cfg = Config {
            port: 8080,
            host: "example.com".into(),
            tls_cert: None,
            tls_key: None,
            page_size: 20,
            delivery_workers: 4,
            delivery_max_attempts: 8,
            data_dir: PathBuf::from("/tmp"),
        };
        assert_eq!(cfg.base_url(), "https://example.com");
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8080");
    }
}
