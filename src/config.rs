use crate::crl_validator::TlsFiles;
use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Configuration controller settings. Every flag also reads its environment variable.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Base URL of the SAS; request type paths are appended to it
    #[arg(long, env = "SAS_URL")]
    pub sas_url: String,

    /// Optional relay that receives a copy of every successful bulk request
    #[arg(long, env = "RC_INGEST_URL")]
    pub rc_ingest_url: Option<String>,

    /// Client certificate (PEM) presented to the SAS
    #[arg(long, env = "CC_CERT_PATH")]
    pub cc_cert_path: PathBuf,

    /// Private key (PKCS#8 PEM) for the client certificate
    #[arg(long, env = "CC_SSL_KEY_PATH")]
    pub cc_ssl_key_path: PathBuf,

    /// CA bundle used to verify the SAS server certificate
    #[arg(long, env = "SAS_CERT_PATH")]
    pub sas_cert_path: PathBuf,

    /// Max pending requests fetched per tick and request type
    #[arg(long, env = "REQUEST_PROCESSING_LIMIT", default_value_t = 100)]
    pub request_processing_limit: usize,

    #[arg(long, env = "REQUEST_PROCESSING_INTERVAL_SEC", default_value_t = 10)]
    pub request_processing_interval_sec: u64,

    /// Seconds a fetched CRL is trusted before it is considered stale
    #[arg(long, env = "CRL_CACHE_TIME", default_value_t = 3600)]
    pub crl_cache_time: u64,

    #[arg(long, env = "CRL_REFRESH_INTERVAL_SEC", default_value_t = 3600)]
    pub crl_refresh_interval_sec: u64,

    #[arg(long, env = "METRICS_PROCESSING_INTERVAL_SEC", default_value_t = 60)]
    pub metrics_processing_interval_sec: u64,

    /// Socket timeout for SAS and CRL calls, in seconds
    #[arg(long, env = "SAS_TIMEOUT_SEC", default_value_t = 30)]
    pub sas_timeout_sec: u64,

    /// JSON-lines journal for the request store; in-memory when unset
    #[arg(long, env = "DATABASE_PATH")]
    pub database_path: Option<PathBuf>,

    /// JSON file with inbound bulk request bodies to enqueue at startup
    #[arg(long, env = "SEED_REQUESTS")]
    pub seed_requests: Option<PathBuf>,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.sas_url.trim().is_empty() {
            bail!("SAS_URL must not be empty");
        }
        for (name, value) in [
            ("REQUEST_PROCESSING_LIMIT", self.request_processing_limit as u64),
            ("REQUEST_PROCESSING_INTERVAL_SEC", self.request_processing_interval_sec),
            ("CRL_CACHE_TIME", self.crl_cache_time),
            ("CRL_REFRESH_INTERVAL_SEC", self.crl_refresh_interval_sec),
            ("METRICS_PROCESSING_INTERVAL_SEC", self.metrics_processing_interval_sec),
            ("SAS_TIMEOUT_SEC", self.sas_timeout_sec),
        ] {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        self.log_level()?;
        Ok(())
    }

    pub fn log_level(&self) -> Result<Level> {
        match self.log_level.parse::<Level>() {
            Ok(level) => Ok(level),
            Err(_) => bail!("unknown LOG_LEVEL '{}'", self.log_level),
        }
    }

    pub fn tls_files(&self) -> TlsFiles {
        TlsFiles {
            cert_path: self.cc_cert_path.clone(),
            key_path: self.cc_ssl_key_path.clone(),
            ca_path: self.sas_cert_path.clone(),
        }
    }

    /// Endpoints whose server certificates are checked against CRLs.
    pub fn protected_endpoints(&self) -> Vec<String> {
        std::iter::once(self.sas_url.clone())
            .chain(self.rc_ingest_url.clone())
            .collect()
    }

    pub fn request_processing_interval(&self) -> Duration {
        Duration::from_secs(self.request_processing_interval_sec)
    }

    pub fn crl_cache_time(&self) -> Duration {
        Duration::from_secs(self.crl_cache_time)
    }

    pub fn crl_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.crl_refresh_interval_sec)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_processing_interval_sec)
    }

    pub fn sas_timeout(&self) -> Duration {
        Duration::from_secs(self.sas_timeout_sec)
    }
}
