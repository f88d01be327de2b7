// src/core/models.rs

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};

// --- Identifiers ---

/// Identifier of one scan. Generated as a UUIDv4 unless supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(pub String);

impl ScanId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScanId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// --- Event Types ---

/// Well-known event type names. Event types are plain strings so that
/// external modules can introduce their own without touching the engine.
pub mod event_types {
    pub const ROOT_MODULE: &str = "";
    pub const WILDCARD: &str = "*";

    pub const DOMAIN_NAME: &str = "DOMAIN_NAME";
    pub const INTERNET_NAME: &str = "INTERNET_NAME";
    pub const IP_ADDRESS: &str = "IP_ADDRESS";
    pub const IPV6_ADDRESS: &str = "IPV6_ADDRESS";
    pub const NETBLOCK_OWNER: &str = "NETBLOCK_OWNER";
    pub const EMAILADDR: &str = "EMAILADDR";
    pub const PHONE_NUMBER: &str = "PHONE_NUMBER";
    pub const BGP_AS_OWNER: &str = "BGP_AS_OWNER";
    pub const HUMAN_NAME: &str = "HUMAN_NAME";
    pub const USERNAME: &str = "USERNAME";
    pub const TCP_PORT_OPEN: &str = "TCP_PORT_OPEN";
    pub const DNS_SPF: &str = "DNS_SPF";
    pub const DNS_TEXT: &str = "DNS_TEXT";
    pub const SSL_CERTIFICATE_ISSUED: &str = "SSL_CERTIFICATE_ISSUED";
    pub const SSL_CERTIFICATE_ISSUER: &str = "SSL_CERTIFICATE_ISSUER";
    pub const SSL_CERTIFICATE_EXPIRED: &str = "SSL_CERTIFICATE_EXPIRED";
    pub const SSL_CERTIFICATE_EXPIRING: &str = "SSL_CERTIFICATE_EXPIRING";
    pub const WEBSERVER_BANNER: &str = "WEBSERVER_BANNER";
    pub const WEBSERVER_HTTPHEADERS: &str = "WEBSERVER_HTTPHEADERS";
    pub const HTTP_HEADER_MISSING: &str = "HTTP_HEADER_MISSING";
    pub const WEBSERVER_TECHNOLOGY: &str = "WEBSERVER_TECHNOLOGY";

    /// Types that identify an entity on their own; used by `entity.*` rule fields.
    pub const ENTITY_TYPES: &[&str] = &[
        DOMAIN_NAME,
        INTERNET_NAME,
        IP_ADDRESS,
        IPV6_ADDRESS,
        NETBLOCK_OWNER,
        EMAILADDR,
        PHONE_NUMBER,
        BGP_AS_OWNER,
        HUMAN_NAME,
        USERNAME,
    ];
}

// --- Scores ---

/// A 0-100 score. Values outside the range are clamped on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u8")]
pub struct Score(u8);

impl Score {
    pub const MAX: Score = Score(100);
    pub const MIN: Score = Score(0);

    pub fn new(value: u32) -> Self {
        Self(value.min(100) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl From<u32> for Score {
    fn from(value: u32) -> Self {
        Score::new(value)
    }
}

impl From<Score> for u8 {
    fn from(score: Score) -> Self {
        score.0
    }
}

// --- Events ---

/// Content address of an event: SHA-256 over (type, data, producing module, source hash).
///
/// Each field is length-prefixed so that no two distinct tuples share an encoding.
pub fn compute_event_hash(event_type: &str, data: &str, module: &str, source: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    for part in [event_type, data, module, source.unwrap_or("")] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    // Distinguishes a root event from one whose parent hash is the empty string.
    hasher.update([source.is_some() as u8]);
    format!("{:x}", hasher.finalize())
}

/// What a module hands back to the engine. The engine fills in provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDraft {
    pub event_type: String,
    pub data: String,
    pub confidence: Score,
    pub visibility: Score,
    pub risk: Score,
}

impl EventDraft {
    pub fn new(event_type: &str, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.to_string(),
            data: data.into(),
            confidence: Score::MAX,
            visibility: Score::MAX,
            risk: Score::MIN,
        }
    }

    pub fn with_confidence(mut self, confidence: u32) -> Self {
        self.confidence = Score::new(confidence);
        self
    }

    pub fn with_visibility(mut self, visibility: u32) -> Self {
        self.visibility = Score::new(visibility);
        self
    }

    pub fn with_risk(mut self, risk: u32) -> Self {
        self.risk = Score::new(risk);
        self
    }
}

/// An immutable unit of discovered data with its provenance.
///
/// Only `false_positive` may change after the event has been stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub hash: String,
    pub event_type: String,
    pub data: String,
    pub module: String,
    pub source_hash: Option<String>,
    pub scan_id: ScanId,
    pub confidence: Score,
    pub visibility: Score,
    pub risk: Score,
    /// Length of the source chain; the seed event has depth 0.
    pub depth: u32,
    pub generated: DateTime<Utc>,
    pub false_positive: bool,
}

impl Event {
    /// Builds the seed event of a scan.
    pub fn seed(scan_id: &ScanId, event_type: &str, data: &str) -> Self {
        Self {
            hash: compute_event_hash(event_type, data, event_types::ROOT_MODULE, None),
            event_type: event_type.to_string(),
            data: data.to_string(),
            module: event_types::ROOT_MODULE.to_string(),
            source_hash: None,
            scan_id: scan_id.clone(),
            confidence: Score::MAX,
            visibility: Score::MAX,
            risk: Score::MIN,
            depth: 0,
            generated: Utc::now(),
            false_positive: false,
        }
    }

    /// Builds a child of `parent` produced by `module` from a draft.
    pub fn derive(parent: &Event, module: &str, draft: EventDraft) -> Self {
        Self {
            hash: compute_event_hash(&draft.event_type, &draft.data, module, Some(&parent.hash)),
            event_type: draft.event_type,
            data: draft.data,
            module: module.to_string(),
            source_hash: Some(parent.hash.clone()),
            scan_id: parent.scan_id.clone(),
            confidence: draft.confidence,
            visibility: draft.visibility,
            risk: draft.risk,
            depth: parent.depth + 1,
            generated: Utc::now(),
            false_positive: false,
        }
    }

    pub fn is_seed(&self) -> bool {
        self.source_hash.is_none()
    }
}

/// Result of an idempotent insert into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    Duplicate,
}

/// Read filter for stored events. An empty type list means every type.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_types: Vec<String>,
    pub module: Option<String>,
    pub include_false_positives: bool,
}

impl EventFilter {
    pub fn types(types: &[&str]) -> Self {
        Self {
            event_types: types.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.include_false_positives && event.false_positive {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.iter().any(|t| *t == event.event_type) {
            return false;
        }
        match &self.module {
            Some(module) => *module == event.module,
            None => true,
        }
    }
}

// --- Scans ---

/// Lifecycle state of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum ScanStatus {
    #[strum(serialize = "CREATED")]
    #[serde(rename = "CREATED")]
    Created,
    #[strum(serialize = "STARTING")]
    #[serde(rename = "STARTING")]
    Starting,
    #[strum(serialize = "RUNNING")]
    #[serde(rename = "RUNNING")]
    Running,
    #[strum(serialize = "FINISHED")]
    #[serde(rename = "FINISHED")]
    Finished,
    #[strum(serialize = "ABORTED")]
    #[serde(rename = "ABORTED")]
    Aborted,
    #[strum(serialize = "ERROR-FAILED")]
    #[serde(rename = "ERROR-FAILED")]
    ErrorFailed,
    #[strum(serialize = "STOPPED")]
    #[serde(rename = "STOPPED")]
    Stopped,
    #[strum(serialize = "SKIPPED")]
    #[serde(rename = "SKIPPED")]
    Skipped,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanStatus::Finished
                | ScanStatus::Aborted
                | ScanStatus::ErrorFailed
                | ScanStatus::Stopped
                | ScanStatus::Skipped
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        use ScanStatus::*;
        match (self, next) {
            (Created, Starting) | (Created, Skipped) | (Created, ErrorFailed) => true,
            (Starting, Running) | (Starting, ErrorFailed) | (Starting, Stopped) | (Starting, Aborted) => true,
            (Running, Finished) | (Running, Aborted) | (Running, ErrorFailed) | (Running, Stopped) => true,
            _ => false,
        }
    }
}

/// Durable record of a scan, written to the store at every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: ScanId,
    pub name: String,
    pub target: String,
    pub target_type: TargetType,
    pub module_set: Vec<String>,
    pub status: ScanStatus,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub event_count: usize,
}

// --- Scan Log ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum LogLevel {
    #[strum(serialize = "DEBUG")]
    Debug,
    #[strum(serialize = "INFO")]
    Info,
    #[strum(serialize = "WARNING")]
    Warning,
    #[strum(serialize = "ERROR")]
    Error,
}

/// A structured log line attached to a scan (or a correlation run over it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanLogEntry {
    pub scan_id: ScanId,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ScanLogEntry {
    pub fn new(scan_id: &ScanId, level: LogLevel, component: &str, message: impl Into<String>) -> Self {
        Self {
            scan_id: scan_id.clone(),
            level,
            component: component.to_string(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

// --- Targets ---

/// The kind of entity a scan starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    IpAddress,
    Ipv6Address,
    NetblockOwner,
    EmailAddress,
    PhoneNumber,
    BgpAsOwner,
    HumanName,
    Username,
    DomainName,
}

static RE_NETBLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}/\d{1,2}$").unwrap());
static RE_EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").unwrap());
static RE_PHONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+\d{6,15}$").unwrap());
static RE_ASN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,10}$").unwrap());
static RE_HUMAN_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^"[^"\d@]+ [^"\d@]+"$"#).unwrap());
static RE_USERNAME: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^"[^"\s@]+"$"#).unwrap());
static RE_DOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)([a-z0-9]([a-z0-9\-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}\.?$").unwrap()
});

impl TargetType {
    /// Classifies a raw target string, or `None` if it matches no supported type.
    ///
    /// Human names and usernames must be double-quoted to be told apart from
    /// other identifiers.
    pub fn detect(target: &str) -> Option<TargetType> {
        let target = target.trim();
        if target.is_empty() {
            return None;
        }
        if let Ok(ip) = target.parse::<IpAddr>() {
            return Some(if ip.is_ipv4() { TargetType::IpAddress } else { TargetType::Ipv6Address });
        }
        if RE_NETBLOCK.is_match(target) {
            return Some(TargetType::NetblockOwner);
        }
        if RE_EMAIL.is_match(target) {
            return Some(TargetType::EmailAddress);
        }
        if RE_PHONE.is_match(target) {
            return Some(TargetType::PhoneNumber);
        }
        if RE_ASN.is_match(target) {
            return Some(TargetType::BgpAsOwner);
        }
        if RE_HUMAN_NAME.is_match(target) {
            return Some(TargetType::HumanName);
        }
        if RE_USERNAME.is_match(target) {
            return Some(TargetType::Username);
        }
        if RE_DOMAIN.is_match(target) {
            return Some(TargetType::DomainName);
        }
        None
    }

    /// Checks that `target` is a well-formed instance of this type.
    pub fn validate(self, target: &str) -> Result<(), String> {
        match TargetType::detect(target) {
            Some(detected) if detected == self => Ok(()),
            Some(detected) => Err(format!("target looks like {detected}, not {self}")),
            None => Err("target is not a recognised identifier".to_string()),
        }
    }

    /// Event type used for the seed event of a scan against this kind of target.
    pub fn seed_event_type(self) -> &'static str {
        match self {
            TargetType::IpAddress => event_types::IP_ADDRESS,
            TargetType::Ipv6Address => event_types::IPV6_ADDRESS,
            TargetType::NetblockOwner => event_types::NETBLOCK_OWNER,
            TargetType::EmailAddress => event_types::EMAILADDR,
            TargetType::PhoneNumber => event_types::PHONE_NUMBER,
            TargetType::BgpAsOwner => event_types::BGP_AS_OWNER,
            TargetType::HumanName => event_types::HUMAN_NAME,
            TargetType::Username => event_types::USERNAME,
            TargetType::DomainName => event_types::DOMAIN_NAME,
        }
    }

    /// The seed data for a target: surrounding quotes are stripped and
    /// domain names are lower-cased.
    pub fn normalize(self, target: &str) -> String {
        let trimmed = target.trim();
        match self {
            TargetType::HumanName | TargetType::Username => trimmed.trim_matches('"').to_string(),
            TargetType::DomainName => trimmed.trim_end_matches('.').to_lowercase(),
            _ => trimmed.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let a = compute_event_hash("IP_ADDRESS", "1.2.3.4", "dns_resolve", Some("abc"));
        let b = compute_event_hash("IP_ADDRESS", "1.2.3.4", "dns_resolve", Some("abc"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_hash_depends_on_every_field() {
        let base = compute_event_hash("IP_ADDRESS", "1.2.3.4", "dns_resolve", Some("abc"));
        assert_ne!(base, compute_event_hash("IPV6_ADDRESS", "1.2.3.4", "dns_resolve", Some("abc")));
        assert_ne!(base, compute_event_hash("IP_ADDRESS", "1.2.3.5", "dns_resolve", Some("abc")));
        assert_ne!(base, compute_event_hash("IP_ADDRESS", "1.2.3.4", "port_scan", Some("abc")));
        assert_ne!(base, compute_event_hash("IP_ADDRESS", "1.2.3.4", "dns_resolve", Some("abd")));
        assert_ne!(
            compute_event_hash("A", "", "m", None),
            compute_event_hash("A", "", "m", Some(""))
        );
    }

    #[test]
    fn test_field_boundaries_do_not_collide() {
        assert_ne!(
            compute_event_hash("AB", "C", "m", None),
            compute_event_hash("A", "BC", "m", None)
        );
    }

    #[test]
    fn test_derive_tracks_provenance() {
        let scan = ScanId::from("scan-1");
        let seed = Event::seed(&scan, event_types::DOMAIN_NAME, "example.com");
        let child = Event::derive(&seed, "dns_resolve", EventDraft::new(event_types::IP_ADDRESS, "93.184.216.34"));
        assert!(seed.is_seed());
        assert_eq!(child.source_hash.as_deref(), Some(seed.hash.as_str()));
        assert_eq!(child.depth, 1);
        assert_eq!(child.scan_id, scan);
        assert_eq!(child.module, "dns_resolve");
    }

    #[test]
    fn test_score_is_clamped() {
        assert_eq!(Score::new(250).value(), 100);
        assert_eq!(EventDraft::new("X", "y").with_risk(70).risk.value(), 70);
        let parsed: Score = serde_json::from_str("300").unwrap();
        assert_eq!(parsed.value(), 100);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ScanStatus::ErrorFailed.to_string(), "ERROR-FAILED");
        assert_eq!("SKIPPED".parse::<ScanStatus>().unwrap(), ScanStatus::Skipped);
        assert_eq!(serde_json::to_string(&ScanStatus::Running).unwrap(), "\"RUNNING\"");
    }

    #[test]
    fn test_status_transitions() {
        assert!(ScanStatus::Created.can_transition_to(ScanStatus::Starting));
        assert!(ScanStatus::Created.can_transition_to(ScanStatus::Skipped));
        assert!(!ScanStatus::Running.can_transition_to(ScanStatus::Skipped));
        assert!(!ScanStatus::Finished.can_transition_to(ScanStatus::Running));
        assert!(ScanStatus::Running.can_transition_to(ScanStatus::Aborted));
    }

    #[test]
    fn test_target_detection() {
        assert_eq!(TargetType::detect("example.com"), Some(TargetType::DomainName));
        assert_eq!(TargetType::detect("93.184.216.34"), Some(TargetType::IpAddress));
        assert_eq!(TargetType::detect("2001:db8::1"), Some(TargetType::Ipv6Address));
        assert_eq!(TargetType::detect("10.0.0.0/8"), Some(TargetType::NetblockOwner));
        assert_eq!(TargetType::detect("alice@example.com"), Some(TargetType::EmailAddress));
        assert_eq!(TargetType::detect("+441234567890"), Some(TargetType::PhoneNumber));
        assert_eq!(TargetType::detect("15169"), Some(TargetType::BgpAsOwner));
        assert_eq!(TargetType::detect("\"John Smith\""), Some(TargetType::HumanName));
        assert_eq!(TargetType::detect("\"jsmith\""), Some(TargetType::Username));
        assert_eq!(TargetType::detect("not a target!"), None);
        assert_eq!(TargetType::detect(""), None);
    }

    #[test]
    fn test_target_validation_and_normalisation() {
        assert!(TargetType::DomainName.validate("Example.COM").is_ok());
        assert!(TargetType::IpAddress.validate("example.com").is_err());
        assert_eq!(TargetType::DomainName.normalize("Example.COM."), "example.com");
        assert_eq!(TargetType::HumanName.normalize("\"John Smith\""), "John Smith");
        assert_eq!(TargetType::DomainName.seed_event_type(), event_types::DOMAIN_NAME);
    }
}
