// src/core/modules/dns_resolve.rs

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::core::error::ModuleError;
use crate::core::models::{event_types, Event, EventDraft};
use crate::core::registry::{Module, ModuleConfig, ModuleDescriptor};

pub const NAME: &str = "dns_resolve";

const WATCHED: &[&str] = &[event_types::DOMAIN_NAME, event_types::INTERNET_NAME];
const PRODUCED: &[&str] = &[
    event_types::IP_ADDRESS,
    event_types::IPV6_ADDRESS,
    event_types::DNS_SPF,
    event_types::DNS_TEXT,
];

pub fn descriptor() -> ModuleDescriptor {
    ModuleDescriptor::new(NAME, WATCHED, PRODUCED, |config| Ok(Box::new(DnsResolve::new(config))))
        .summary("Resolves host names to addresses and collects TXT/SPF records.")
        .max_instances(4)
        .option("lookup_txt", json!(true))
}

/// Resolves names with the system-independent default resolver.
pub struct DnsResolve {
    resolver: TokioAsyncResolver,
    lookup_txt: bool,
}

impl DnsResolve {
    fn new(config: ModuleConfig) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
            lookup_txt: config.get_bool("lookup_txt").unwrap_or(true),
        }
    }

    async fn addresses(&self, name: &str) -> Result<Vec<EventDraft>, ModuleError> {
        debug!(target = name, "Looking up addresses.");
        match self.resolver.lookup_ip(name).await {
            Ok(lookup) => Ok(lookup.iter().map(address_event).collect()),
            Err(e) if is_empty_answer(&e) => {
                debug!(target = name, "No address records found.");
                Ok(Vec::new())
            }
            Err(e) => {
                warn!(target = name, error = %e, "Address lookup failed.");
                Err(ModuleError::failed(NAME, format!("DNS Error: {e}")))
            }
        }
    }

    async fn text_records(&self, name: &str) -> Result<Vec<EventDraft>, ModuleError> {
        debug!(target = name, "Looking up TXT records.");
        match self.resolver.txt_lookup(name).await {
            Ok(records) => Ok(records.iter().map(|r| txt_event(&r.to_string())).collect()),
            Err(e) if is_empty_answer(&e) => Ok(Vec::new()),
            Err(e) => {
                warn!(target = name, error = %e, "TXT lookup failed.");
                Err(ModuleError::failed(NAME, format!("DNS Error: {e}")))
            }
        }
    }
}

#[async_trait]
impl Module for DnsResolve {
    fn watched_types(&self) -> Vec<String> {
        WATCHED.iter().map(|t| t.to_string()).collect()
    }

    fn produced_types(&self) -> Vec<String> {
        PRODUCED.iter().map(|t| t.to_string()).collect()
    }

    async fn handle(&self, event: &Event) -> Result<Vec<EventDraft>, ModuleError> {
        let name = event.data.trim_end_matches('.');
        info!(target = name, "Starting DNS resolution.");

        let mut drafts = self.addresses(name).await?;
        // TXT policy records live on the registered domain, not on every host.
        if self.lookup_txt && event.event_type == event_types::DOMAIN_NAME {
            drafts.extend(self.text_records(name).await?);
        }
        info!(target = name, found = drafts.len(), "DNS resolution finished.");
        Ok(drafts)
    }
}

fn is_empty_answer(error: &ResolveError) -> bool {
    matches!(error.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

fn address_event(ip: IpAddr) -> EventDraft {
    match ip {
        IpAddr::V4(v4) => EventDraft::new(event_types::IP_ADDRESS, v4.to_string()),
        IpAddr::V6(v6) => EventDraft::new(event_types::IPV6_ADDRESS, v6.to_string()),
    }
}

/// SPF policies are stored in TXT records and start with "v=spf1".
fn txt_event(record: &str) -> EventDraft {
    if record.starts_with("v=spf1") {
        EventDraft::new(event_types::DNS_SPF, record)
    } else {
        EventDraft::new(event_types::DNS_TEXT, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_family_selects_type() {
        assert_eq!(address_event("93.184.216.34".parse().unwrap()).event_type, event_types::IP_ADDRESS);
        assert_eq!(address_event("2606:2800:220:1::".parse().unwrap()).event_type, event_types::IPV6_ADDRESS);
    }

    #[test]
    fn test_spf_records_are_recognised() {
        assert_eq!(txt_event("v=spf1 include:_spf.example.com -all").event_type, event_types::DNS_SPF);
        assert_eq!(txt_event("google-site-verification=abc").event_type, event_types::DNS_TEXT);
    }
}
