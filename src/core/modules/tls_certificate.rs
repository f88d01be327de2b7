// src/core/modules/tls_certificate.rs

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use native_tls::TlsConnector;
use serde_json::json;
use tokio::task::spawn_blocking;
use tracing::{debug, error, info};
use x509_parser::prelude::*;

use crate::core::error::ModuleError;
use crate::core::models::{event_types, Event, EventDraft};
use crate::core::registry::{Module, ModuleConfig, ModuleDescriptor};

pub const NAME: &str = "tls_certificate";

const WATCHED: &[&str] = &[event_types::DOMAIN_NAME, event_types::INTERNET_NAME];
const PRODUCED: &[&str] = &[
    event_types::SSL_CERTIFICATE_ISSUED,
    event_types::SSL_CERTIFICATE_ISSUER,
    event_types::SSL_CERTIFICATE_EXPIRED,
    event_types::SSL_CERTIFICATE_EXPIRING,
];

pub fn descriptor() -> ModuleDescriptor {
    ModuleDescriptor::new(NAME, WATCHED, PRODUCED, |config| Ok(Box::new(TlsCertificate::new(&config))))
        .summary("Fetches the TLS certificate a host presents and checks its validity window.")
        .max_instances(2)
        .option("port", json!(443))
        .option("connect_timeout_secs", json!(10))
        .option("expiry_warning_days", json!(30))
}

pub struct TlsCertificate {
    port: u16,
    connect_timeout: Duration,
    warning_days: i64,
}

/// The parts of a certificate the module reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl TlsCertificate {
    fn new(config: &ModuleConfig) -> Self {
        Self {
            port: config.get_u64("port").and_then(|p| u16::try_from(p).ok()).unwrap_or(443),
            connect_timeout: Duration::from_secs(config.get_u64("connect_timeout_secs").unwrap_or(10)),
            warning_days: config.get_u64("expiry_warning_days").unwrap_or(30) as i64,
        }
    }
}

#[async_trait]
impl Module for TlsCertificate {
    fn watched_types(&self) -> Vec<String> {
        WATCHED.iter().map(|t| t.to_string()).collect()
    }

    fn produced_types(&self) -> Vec<String> {
        PRODUCED.iter().map(|t| t.to_string()).collect()
    }

    async fn handle(&self, event: &Event) -> Result<Vec<EventDraft>, ModuleError> {
        info!(target = %event.data, port = self.port, "Starting TLS certificate check.");
        let host = event.data.clone();
        let (port, timeout) = (self.port, self.connect_timeout);

        debug!("Spawning blocking task for TLS connection.");
        let fetched = spawn_blocking(move || fetch_certificate(&host, port, timeout))
            .await
            .map_err(|e| {
                error!(panic = %e, "Blocking TLS task failed.");
                ModuleError::Panicked { module: NAME.to_string() }
            })??;

        let Some(certificate) = fetched else {
            debug!(target = %event.data, "No TLS endpoint or no certificate presented.");
            return Ok(Vec::new());
        };
        let drafts = certificate_findings(&certificate, Utc::now(), self.warning_days);
        info!(target = %event.data, findings = drafts.len(), "TLS certificate check finished.");
        Ok(drafts)
    }
}

/// Connects, performs the handshake and parses the peer certificate.
///
/// Hosts that refuse the TCP connection simply have no certificate; handshake
/// and parsing problems are module errors.
fn fetch_certificate(host: &str, port: u16, timeout: Duration) -> Result<Option<CertificateInfo>, ModuleError> {
    let fail = |message: String| ModuleError::failed(NAME, message);

    // Expired and self-signed certificates are exactly what we want to see.
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| fail(format!("TlsConnector Error: {e}")))?;

    let Some(address) = (host, port).to_socket_addrs().ok().and_then(|mut a| a.next()) else {
        return Ok(None);
    };
    debug!(target = host, %address, "Connecting TCP stream.");
    let stream = match TcpStream::connect_timeout(&address, timeout) {
        Ok(stream) => stream,
        Err(e) => {
            debug!(target = host, error = %e, "TCP connection failed.");
            return Ok(None);
        }
    };
    let _ = stream.set_read_timeout(Some(timeout));

    debug!(target = host, "Performing TLS handshake.");
    let stream = connector.connect(host, stream).map_err(|e| fail(format!("TLS Handshake Error: {e}")))?;
    let certificate = match stream.peer_certificate() {
        Ok(Some(c)) => c,
        Ok(None) => return Ok(None),
        Err(e) => return Err(fail(format!("Could not get peer certificate: {e}"))),
    };
    let der = certificate.to_der().map_err(|e| fail(format!("Could not convert certificate to DER: {e}")))?;
    let (_, x509) = parse_x509_certificate(&der).map_err(|e| fail(format!("X.509 Parse Error: {e}")))?;

    let validity = x509.validity();
    Ok(Some(CertificateInfo {
        subject: x509.subject().to_string(),
        issuer: x509.issuer().to_string(),
        not_before: asn1_time_to_chrono_utc(&validity.not_before),
        not_after: asn1_time_to_chrono_utc(&validity.not_after),
    }))
}

fn asn1_time_to_chrono_utc(time: &ASN1Time) -> DateTime<Utc> {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or_default()
}

/// Turns a parsed certificate into events, flagging expiry relative to `now`.
pub fn certificate_findings(certificate: &CertificateInfo, now: DateTime<Utc>, warning_days: i64) -> Vec<EventDraft> {
    let mut drafts = vec![
        EventDraft::new(event_types::SSL_CERTIFICATE_ISSUED, certificate.subject.clone()),
        EventDraft::new(event_types::SSL_CERTIFICATE_ISSUER, certificate.issuer.clone()),
    ];
    let expiry = certificate.not_after.to_rfc3339();
    if now > certificate.not_after {
        debug!(expiry_date = %certificate.not_after, "Certificate is expired.");
        drafts.push(EventDraft::new(event_types::SSL_CERTIFICATE_EXPIRED, expiry).with_risk(80));
    } else if certificate.not_after.signed_duration_since(now).num_days() <= warning_days {
        debug!(expiry_date = %certificate.not_after, "Certificate is expiring soon.");
        drafts.push(EventDraft::new(event_types::SSL_CERTIFICATE_EXPIRING, expiry).with_risk(40));
    }
    drafts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn certificate(expires_in_days: i64) -> CertificateInfo {
        let now = Utc::now();
        CertificateInfo {
            subject: "CN=example.com".into(),
            issuer: "CN=Example CA".into(),
            not_before: now - ChronoDuration::days(90),
            not_after: now + ChronoDuration::days(expires_in_days),
        }
    }

    fn types(drafts: &[EventDraft]) -> Vec<&str> {
        drafts.iter().map(|d| d.event_type.as_str()).collect()
    }

    #[test]
    fn test_healthy_certificate_reports_subject_and_issuer() {
        let drafts = certificate_findings(&certificate(200), Utc::now(), 30);
        assert_eq!(
            types(&drafts),
            vec![event_types::SSL_CERTIFICATE_ISSUED, event_types::SSL_CERTIFICATE_ISSUER]
        );
        assert_eq!(drafts[0].data, "CN=example.com");
    }

    #[test]
    fn test_expiry_windows() {
        let expiring = certificate_findings(&certificate(10), Utc::now(), 30);
        assert!(types(&expiring).contains(&event_types::SSL_CERTIFICATE_EXPIRING));

        let expired = certificate_findings(&certificate(-1), Utc::now(), 30);
        assert!(types(&expired).contains(&event_types::SSL_CERTIFICATE_EXPIRED));
        assert!(!types(&expired).contains(&event_types::SSL_CERTIFICATE_EXPIRING));
    }
}
