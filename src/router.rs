use crate::crl_validator::{CrlFetchError, CrlValidator, TlsFiles};
use crate::merger::BulkEnvelope;
use reqwest::blocking::Client;
use serde_json::Value;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("could not build SAS client: {0}")]
    Client(String),

    #[error("SAS server certificate for {endpoint} is revoked")]
    CertificateRevoked { endpoint: String },

    #[error("POST {url} failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl From<CrlFetchError> for RouterError {
    fn from(e: CrlFetchError) -> Self {
        RouterError::Client(e.to_string())
    }
}

/// Raw SAS answer. Status and body are left for the response processor to judge.
#[derive(Debug, Clone, PartialEq)]
pub struct SasResponse {
    pub status: u16,
    pub body: String,
}

impl SasResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait SasRouter: Send + Sync {
    fn post_to_sas(&self, envelope: &BulkEnvelope) -> Result<SasResponse, RouterError>;
}

/// Mutual-TLS client for the SAS, plus an optional RC-ingest relay.
pub struct RequestRouter {
    sas_url: String,
    rc_ingest_url: Option<String>,
    client: Client,
    crl_validator: Arc<CrlValidator>,
}

impl RequestRouter {
    /// Builds the client from the client certificate/key pair and the SAS CA bundle.
    pub fn new(
        sas_url: &str,
        rc_ingest_url: Option<&str>,
        tls: &TlsFiles,
        timeout: Duration,
        crl_validator: Arc<CrlValidator>,
    ) -> Result<Self, RouterError> {
        let mut identity_pem = TlsFiles::read(&tls.cert_path)?;
        identity_pem.push(b'\n');
        identity_pem.extend(TlsFiles::read(&tls.key_path)?);
        let ca_pem = TlsFiles::read(&tls.ca_path)?;

        let identity = reqwest::Identity::from_pem(&identity_pem).map_err(|e| RouterError::Client(e.to_string()))?;
        let ca = reqwest::Certificate::from_pem(&ca_pem).map_err(|e| RouterError::Client(e.to_string()))?;

        let client = Client::builder()
            .identity(identity)
            .add_root_certificate(ca)
            .tls_built_in_root_certs(false)
            .timeout(timeout)
            .build()
            .map_err(|e| RouterError::Client(e.to_string()))?;

        Ok(Self::with_client(sas_url, rc_ingest_url, client, crl_validator))
    }

    pub fn with_client(
        sas_url: &str,
        rc_ingest_url: Option<&str>,
        client: Client,
        crl_validator: Arc<CrlValidator>,
    ) -> Self {
        Self {
            sas_url: sas_url.trim_end_matches('/').to_string(),
            rc_ingest_url: rc_ingest_url.map(|u| u.trim_end_matches('/').to_string()),
            client,
            crl_validator,
        }
    }

    pub fn endpoint_for(base: &str, envelope: &BulkEnvelope) -> String {
        format!("{}/{}", base, envelope.request_type.api_name())
    }

    /// Refuses endpoints whose server certificate appears on a cached CRL.
    pub fn validate_endpoint(&self, endpoint: &str) -> Result<(), RouterError> {
        if self.crl_validator.is_endpoint_revoked(endpoint) {
            return Err(RouterError::CertificateRevoked {
                endpoint: endpoint.to_string(),
            });
        }
        Ok(())
    }

    /// Relays the envelope to RC-ingest on a detached thread. Failures are
    /// logged there and never reach the caller. `None` when no relay is
    /// configured or the thread could not be started.
    pub fn forward_to_rc_ingest(&self, envelope: &BulkEnvelope) -> Option<JoinHandle<()>> {
        let base = self.rc_ingest_url.clone()?;
        let url = Self::endpoint_for(&base, envelope);
        let client = self.client.clone();
        let validator = Arc::clone(&self.crl_validator);
        let body = envelope.to_json();
        let entries = envelope.len();

        let spawned = thread::Builder::new().name("rc-ingest-relay".to_string()).spawn(move || {
            if validator.is_endpoint_revoked(&base) {
                warn!("RC-ingest relay skipped: certificate for {} is revoked", base);
                return;
            }
            match post_json(&client, &url, &body) {
                Ok(resp) if resp.is_success() => debug!("Relayed {} entries to RC-ingest", entries),
                Ok(resp) => warn!("RC-ingest relay answered HTTP {}", resp.status),
                Err(e) => warn!("RC-ingest relay failed: {}", e),
            }
        });
        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Could not start RC-ingest relay: {}", e);
                None
            }
        }
    }
}

fn post_json(client: &Client, url: &str, body: &Value) -> Result<SasResponse, RouterError> {
    let transport = |source| RouterError::Transport {
        url: url.to_string(),
        source,
    };
    let resp = client.post(url).json(body).send().map_err(transport)?;
    let status = resp.status().as_u16();
    let body = resp.text().map_err(transport)?;
    Ok(SasResponse { status, body })
}

impl SasRouter for RequestRouter {
    fn post_to_sas(&self, envelope: &BulkEnvelope) -> Result<SasResponse, RouterError> {
        self.validate_endpoint(&self.sas_url)?;

        let url = Self::endpoint_for(&self.sas_url, envelope);
        debug!("POST {} ({} entries)", url, envelope.len());
        let resp = post_json(&self.client, &url, &envelope.to_json())?;

        if resp.is_success() {
            // Detached: the tick does not wait for the relay.
            let _ = self.forward_to_rc_ingest(envelope);
        }
        Ok(resp)
    }
}
