// src/core/modules/http_headers.rs

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::core::error::ModuleError;
use crate::core::models::{event_types, Event, EventDraft};
use crate::core::modules::{http_client, landing_url, scheme};
use crate::core::registry::{Module, ModuleDescriptor};

pub const NAME: &str = "http_headers";

const WATCHED: &[&str] = &[event_types::DOMAIN_NAME, event_types::INTERNET_NAME];
const PRODUCED: &[&str] = &[
    event_types::WEBSERVER_BANNER,
    event_types::WEBSERVER_HTTPHEADERS,
    event_types::HTTP_HEADER_MISSING,
];

/// Security headers a well-configured site is expected to send, with the
/// risk of leaving each one out.
const SECURITY_HEADERS: &[(&str, u32)] = &[
    ("strict-transport-security", 40),
    ("content-security-policy", 40),
    ("x-frame-options", 30),
    ("x-content-type-options", 20),
    ("referrer-policy", 10),
    ("permissions-policy", 10),
];

pub fn descriptor() -> ModuleDescriptor {
    ModuleDescriptor::new(NAME, WATCHED, PRODUCED, |config| {
        Ok(Box::new(HttpHeaders { client: http_client(&config)?, scheme: scheme(&config) }))
    })
    .summary("Fetches a host's landing page and reports its banner and missing security headers.")
    .max_instances(3)
    .option("scheme", json!("https"))
    .option("timeout_secs", json!(10))
}

pub struct HttpHeaders {
    client: reqwest::Client,
    scheme: String,
}

#[async_trait]
impl Module for HttpHeaders {
    fn watched_types(&self) -> Vec<String> {
        WATCHED.iter().map(|t| t.to_string()).collect()
    }

    fn produced_types(&self) -> Vec<String> {
        PRODUCED.iter().map(|t| t.to_string()).collect()
    }

    async fn handle(&self, event: &Event) -> Result<Vec<EventDraft>, ModuleError> {
        let url = landing_url(&self.scheme, &event.data);
        info!(target = %event.data, %url, "Starting headers check.");

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                // An unreachable web server is an absence of data, not a module fault.
                warn!(url = %url, error = %e, "HTTP request failed for headers check.");
                return Ok(Vec::new());
            }
        };
        info!(status = %response.status(), "Received HTTP response for headers check.");
        let drafts = header_findings(response.headers());
        info!(target = %event.data, findings = drafts.len(), "Headers check finished.");
        Ok(drafts)
    }
}

/// Derives banner, raw-headers and missing-header events from a response's headers.
pub fn header_findings(headers: &HeaderMap) -> Vec<EventDraft> {
    let mut drafts = Vec::new();

    if let Some(server) = headers.get("server").and_then(|v| v.to_str().ok()) {
        debug!(server, "Server banner found.");
        drafts.push(EventDraft::new(event_types::WEBSERVER_BANNER, server));
    }

    let mut raw: Vec<String> = headers
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value.to_str().unwrap_or("[Invalid UTF-8]")))
        .collect();
    raw.sort();
    if !raw.is_empty() {
        drafts.push(EventDraft::new(event_types::WEBSERVER_HTTPHEADERS, raw.join("\n")));
    }

    for (name, risk) in SECURITY_HEADERS {
        if !headers.contains_key(*name) {
            debug!(header_name = name, "Header not found.");
            drafts.push(EventDraft::new(event_types::HTTP_HEADER_MISSING, *name).with_risk(*risk));
        }
    }
    drafts
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_reports_banner_and_missing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("server", HeaderValue::from_static("nginx/1.25.3"));
        headers.insert("strict-transport-security", HeaderValue::from_static("max-age=63072000"));
        headers.insert("x-frame-options", HeaderValue::from_static("DENY"));

        let drafts = header_findings(&headers);
        assert_eq!(drafts[0].event_type, event_types::WEBSERVER_BANNER);
        assert_eq!(drafts[0].data, "nginx/1.25.3");
        assert_eq!(drafts[1].event_type, event_types::WEBSERVER_HTTPHEADERS);

        let missing: Vec<&str> = drafts
            .iter()
            .filter(|d| d.event_type == event_types::HTTP_HEADER_MISSING)
            .map(|d| d.data.as_str())
            .collect();
        assert_eq!(
            missing,
            vec!["content-security-policy", "x-content-type-options", "referrer-policy", "permissions-policy"]
        );
    }

    #[test]
    fn test_empty_response_reports_every_header_missing() {
        let drafts = header_findings(&HeaderMap::new());
        assert_eq!(drafts.len(), SECURITY_HEADERS.len());
    }
}
