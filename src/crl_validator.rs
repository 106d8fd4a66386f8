//! Certificate Revocation List cache guarding outbound SAS calls.
//!
//! Each protected endpoint's server certificate is fetched once and remembered
//! (serial + CRL distribution points). CRLs are cached per distribution point
//! URL. A cached list older than the configured cache time, or past its own
//! `nextUpdate`, is stale and is refreshed before being trusted; if that
//! refresh fails the stale list keeps answering until a later refresh works.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;
use x509_parser::prelude::{
    parse_x509_certificate, parse_x509_crl, DistributionPointName, GeneralName, ParsedExtension,
};

#[derive(Debug, Error)]
pub enum CrlFetchError {
    #[error("failed to fetch CRL from {url}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("CRL fetch returned HTTP error from {url}: {status}")]
    HttpStatus { url: String, status: String },

    #[error("failed to parse CRL from {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("TLS handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("failed to read {}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Serials (lowercase hex, no leading zero bytes) listed by one CRL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RevocationList {
    pub revoked_serials: HashSet<String>,
    pub next_update: Option<DateTime<Utc>>,
}

impl RevocationList {
    pub fn contains(&self, serial: &str) -> bool {
        self.revoked_serials.contains(serial)
    }
}

#[derive(Debug, Clone)]
pub struct CachedCrl {
    pub list: Arc<RevocationList>,
    pub fetched_at: Instant,
}

/// What the validator needs to know about a peer certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerCertificate {
    pub serial: String,
    pub distribution_points: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrlState {
    Uninitialized,
    Cached,
    Stale,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CrlRefreshReport {
    pub refreshed: usize,
    pub failed: usize,
}

pub trait CrlFetcher: Send + Sync {
    fn fetch_crl(&self, url: &str) -> Result<RevocationList, CrlFetchError>;
}

pub trait CertificateSource: Send + Sync {
    fn server_certificate(&self, endpoint: &str) -> Result<ServerCertificate, CrlFetchError>;
}

pub struct CrlValidator {
    endpoints: Vec<String>,
    cache_time: Duration,
    crl_cache: DashMap<String, CachedCrl>,
    certificates: DashMap<String, ServerCertificate>,
    fetcher: Box<dyn CrlFetcher>,
    cert_source: Box<dyn CertificateSource>,
}

impl CrlValidator {
    pub fn new(
        endpoints: Vec<String>,
        cache_time: Duration,
        fetcher: Box<dyn CrlFetcher>,
        cert_source: Box<dyn CertificateSource>,
    ) -> Self {
        Self {
            endpoints,
            cache_time,
            crl_cache: DashMap::new(),
            certificates: DashMap::new(),
            fetcher,
            cert_source,
        }
    }

    /// Validator that fetches certificates over TLS and CRLs over HTTP(S).
    pub fn with_network(
        endpoints: Vec<String>,
        cache_time: Duration,
        tls: &TlsFiles,
        timeout: Duration,
    ) -> Result<Self, CrlFetchError> {
        let fetcher = HttpCrlFetcher::new(timeout)?;
        let cert_source = TlsCertificateSource::new(tls, timeout)?;
        Ok(Self::new(endpoints, cache_time, Box::new(fetcher), Box::new(cert_source)))
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Refreshes endpoint certificates, then every missing or stale CRL they point at.
    /// One failing endpoint or distribution point never stops the others.
    pub fn update_certificates(&self) -> CrlRefreshReport {
        let mut report = CrlRefreshReport::default();

        for endpoint in &self.endpoints {
            match self.cert_source.server_certificate(endpoint) {
                Ok(cert) => {
                    debug!(
                        "Server certificate for {}: serial {} ({} distribution points)",
                        endpoint,
                        cert.serial,
                        cert.distribution_points.len()
                    );
                    self.certificates.insert(endpoint.clone(), cert);
                }
                Err(e) => {
                    warn!("Could not fetch server certificate for {}: {}", endpoint, e);
                    report.failed += 1;
                }
            }
        }

        let mut points: Vec<String> = self
            .certificates
            .iter()
            .flat_map(|entry| entry.value().distribution_points.clone())
            .collect();
        points.sort();
        points.dedup();

        for url in points {
            if self.state(&url) == CrlState::Cached {
                continue;
            }
            match self.refresh_distribution_point(&url) {
                Ok(()) => report.refreshed += 1,
                Err(_) => report.failed += 1,
            }
        }

        info!(
            "CRL refresh finished: {} refreshed, {} failed, {} cached",
            report.refreshed,
            report.failed,
            self.crl_cache.len()
        );
        report
    }

    /// Fetches one CRL and swaps it into the cache. On failure the previous entry stays.
    pub fn refresh_distribution_point(&self, url: &str) -> Result<(), CrlFetchError> {
        match self.fetcher.fetch_crl(url) {
            Ok(list) => {
                debug!("Cached CRL from {} ({} revoked serials)", url, list.revoked_serials.len());
                self.crl_cache.insert(
                    url.to_string(),
                    CachedCrl {
                        list: Arc::new(list),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(())
            }
            Err(e) => {
                warn!("CRL refresh failed for {}: {}", url, e);
                Err(e)
            }
        }
    }

    pub fn state(&self, url: &str) -> CrlState {
        match self.crl_cache.get(url) {
            None => CrlState::Uninitialized,
            Some(entry) if self.is_stale(entry.value()) => CrlState::Stale,
            Some(_) => CrlState::Cached,
        }
    }

    /// Last successfully fetched list for a distribution point, stale or not.
    pub fn cached(&self, url: &str) -> Option<Arc<RevocationList>> {
        self.crl_cache.get(url).map(|entry| Arc::clone(&entry.value().list))
    }

    fn is_stale(&self, cached: &CachedCrl) -> bool {
        if cached.fetched_at.elapsed() >= self.cache_time {
            return true;
        }
        matches!(cached.list.next_update, Some(next) if next <= Utc::now())
    }

    /// Answers from the cache after refreshing missing or stale lists (fail-open).
    pub fn is_serial_revoked(&self, serial: &str, distribution_points: &[String]) -> bool {
        distribution_points.iter().any(|url| {
            if self.state(url) != CrlState::Cached {
                // Failure already logged; the old list, if any, still applies.
                let _ = self.refresh_distribution_point(url);
            }
            match self.cached(url) {
                Some(list) => list.contains(serial),
                None => {
                    warn!("No CRL available from {}; treating serial {} as not revoked", url, serial);
                    false
                }
            }
        })
    }

    /// Checks a DER-encoded certificate against the CRLs it names.
    pub fn is_certificate_revoked(&self, cert_der: &[u8]) -> Result<bool, CrlFetchError> {
        let cert = parse_server_certificate(cert_der)?;
        Ok(self.is_serial_revoked(&cert.serial, &cert.distribution_points))
    }

    /// Guard used right before a POST: is the endpoint's server certificate revoked?
    pub fn is_endpoint_revoked(&self, endpoint: &str) -> bool {
        let known = self.certificates.get(endpoint).map(|entry| entry.value().clone());
        let cert = match known {
            Some(cert) => cert,
            None => match self.cert_source.server_certificate(endpoint) {
                Ok(cert) => {
                    self.certificates.insert(endpoint.to_string(), cert.clone());
                    cert
                }
                Err(e) => {
                    warn!("Skipping revocation check for {}: {}", endpoint, e);
                    return false;
                }
            },
        };
        self.is_serial_revoked(&cert.serial, &cert.distribution_points)
    }
}

fn normalize_serial(raw: &[u8]) -> String {
    let start = raw.iter().position(|b| *b != 0).unwrap_or(raw.len().saturating_sub(1));
    hex::encode(&raw[start..])
}

/// Extracts serial and CRL distribution point URIs from a DER certificate.
pub fn parse_server_certificate(der: &[u8]) -> Result<ServerCertificate, CrlFetchError> {
    let (_, cert) = parse_x509_certificate(der).map_err(|e| CrlFetchError::InvalidCertificate(e.to_string()))?;

    let mut distribution_points = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() {
            for point in points.iter() {
                if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                    for name in names {
                        if let GeneralName::URI(uri) = name {
                            distribution_points.push(uri.to_string());
                        }
                    }
                }
            }
        }
    }

    Ok(ServerCertificate {
        serial: normalize_serial(cert.raw_serial()),
        distribution_points,
    })
}

/// Parses a DER or PEM encoded CRL.
pub fn parse_crl(url: &str, bytes: &[u8]) -> Result<RevocationList, CrlFetchError> {
    let parse_err = |reason: String| CrlFetchError::Parse {
        url: url.to_string(),
        reason,
    };

    let der = if bytes.starts_with(b"-----BEGIN") {
        let (_, pem) = x509_parser::pem::parse_x509_pem(bytes).map_err(|e| parse_err(e.to_string()))?;
        pem.contents
    } else {
        bytes.to_vec()
    };

    let (_, crl) = parse_x509_crl(&der).map_err(|e| parse_err(e.to_string()))?;
    let revoked_serials = crl
        .iter_revoked_certificates()
        .map(|revoked| normalize_serial(revoked.raw_serial()))
        .collect();
    let next_update = crl
        .next_update()
        .and_then(|t| DateTime::<Utc>::from_timestamp(t.timestamp(), 0));

    Ok(RevocationList {
        revoked_serials,
        next_update,
    })
}

pub struct HttpCrlFetcher {
    client: reqwest::blocking::Client,
}

impl HttpCrlFetcher {
    pub fn new(timeout: Duration) -> Result<Self, CrlFetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| CrlFetchError::Http {
                url: String::new(),
                source,
            })?;
        Ok(Self { client })
    }
}

impl CrlFetcher for HttpCrlFetcher {
    fn fetch_crl(&self, url: &str) -> Result<RevocationList, CrlFetchError> {
        let http_err = |source| CrlFetchError::Http {
            url: url.to_string(),
            source,
        };
        let resp = self.client.get(url).send().map_err(http_err)?;
        if !resp.status().is_success() {
            return Err(CrlFetchError::HttpStatus {
                url: url.to_string(),
                status: resp.status().to_string(),
            });
        }
        let body = resp.bytes().map_err(http_err)?;
        parse_crl(url, &body)
    }
}

/// Client certificate, key and CA bundle paths shared by the router and the validator.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
}

impl TlsFiles {
    pub fn read(path: &Path) -> Result<Vec<u8>, CrlFetchError> {
        std::fs::read(path).map_err(|source| CrlFetchError::ReadFile {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Reads the peer certificate from a mutually authenticated handshake.
pub struct TlsCertificateSource {
    connector: native_tls::TlsConnector,
    timeout: Duration,
}

impl TlsCertificateSource {
    pub fn new(tls: &TlsFiles, timeout: Duration) -> Result<Self, CrlFetchError> {
        let invalid = |e: native_tls::Error| CrlFetchError::InvalidCertificate(e.to_string());
        let cert = TlsFiles::read(&tls.cert_path)?;
        let key = TlsFiles::read(&tls.key_path)?;
        let ca = TlsFiles::read(&tls.ca_path)?;

        let connector = native_tls::TlsConnector::builder()
            .identity(native_tls::Identity::from_pkcs8(&cert, &key).map_err(invalid)?)
            .add_root_certificate(native_tls::Certificate::from_pem(&ca).map_err(invalid)?)
            .build()
            .map_err(invalid)?;
        Ok(Self { connector, timeout })
    }
}

impl CertificateSource for TlsCertificateSource {
    fn server_certificate(&self, endpoint: &str) -> Result<ServerCertificate, CrlFetchError> {
        let invalid = |reason: String| CrlFetchError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason,
        };
        let handshake = |reason: String| CrlFetchError::Handshake {
            endpoint: endpoint.to_string(),
            reason,
        };

        let url = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
        let host = url.host_str().ok_or_else(|| invalid("missing host".into()))?;
        let port = url.port_or_known_default().unwrap_or(443);
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| invalid(e.to_string()))?
            .next()
            .ok_or_else(|| invalid("host did not resolve".into()))?;

        let stream = TcpStream::connect_timeout(&addr, self.timeout).map_err(|e| handshake(e.to_string()))?;
        stream.set_read_timeout(Some(self.timeout)).map_err(|e| handshake(e.to_string()))?;
        stream.set_write_timeout(Some(self.timeout)).map_err(|e| handshake(e.to_string()))?;

        let tls = self.connector.connect(host, stream).map_err(|e| handshake(e.to_string()))?;
        let cert = tls
            .peer_certificate()
            .map_err(|e| handshake(e.to_string()))?
            .ok_or_else(|| handshake("peer sent no certificate".into()))?;
        let der = cert.to_der().map_err(|e| handshake(e.to_string()))?;
        parse_server_certificate(&der)
    }
}
