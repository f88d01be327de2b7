// src/core/modules/web_technology.rs

use std::collections::BTreeMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;
use scraper::{Html, Selector};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::core::error::ModuleError;
use crate::core::models::{event_types, Event, EventDraft};
use crate::core::modules::{http_client, landing_url, scheme};
use crate::core::registry::{Module, ModuleDescriptor};

pub const NAME: &str = "web_technology";

const WATCHED: &[&str] = &[event_types::DOMAIN_NAME, event_types::INTERNET_NAME];
const PRODUCED: &[&str] = &[event_types::WEBSERVER_TECHNOLOGY];

/// Where in a response a signature looks.
enum Evidence {
    Header(&'static str),
    MetaTag(&'static str),
    Body,
    ScriptSrc,
    LinkHref,
    Cookie,
}

/// One way of recognising a technology. Capture group 1, when present, is its version.
struct Signature {
    technology: &'static str,
    evidence: Evidence,
    pattern: &'static Lazy<Regex>,
}

static RE_NGINX: Lazy<Regex> = Lazy::new(|| Regex::new(r"nginx(?:/([\d\.]+))?").unwrap());
static RE_APACHE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Apache(?:/([\d\.]+))?").unwrap());
static RE_IIS: Lazy<Regex> = Lazy::new(|| Regex::new(r"Microsoft-IIS/([\d\.]+)").unwrap());
static RE_CLOUDFLARE: Lazy<Regex> = Lazy::new(|| Regex::new(r"cloudflare").unwrap());
static RE_LITESPEED: Lazy<Regex> = Lazy::new(|| Regex::new(r"LiteSpeed").unwrap());
static RE_WORDPRESS: Lazy<Regex> = Lazy::new(|| Regex::new(r"WordPress ?([\d\.]+)?").unwrap());
static RE_WP_ASSETS: Lazy<Regex> = Lazy::new(|| Regex::new(r"/wp-content/|/wp-includes/").unwrap());
static RE_JOOMLA: Lazy<Regex> = Lazy::new(|| Regex::new(r"Joomla!").unwrap());
static RE_DRUPAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"Drupal ?([\d\.]+)?").unwrap());
static RE_PHP: Lazy<Regex> = Lazy::new(|| Regex::new(r"PHP/([\d\.]+)").unwrap());
static RE_PHPSESSID: Lazy<Regex> = Lazy::new(|| Regex::new(r"PHPSESSID").unwrap());
static RE_ASPNET: Lazy<Regex> = Lazy::new(|| Regex::new(r"ASP\.NET").unwrap());
static RE_JSESSIONID: Lazy<Regex> = Lazy::new(|| Regex::new(r"JSESSIONID").unwrap());
static RE_DJANGO_CSRF: Lazy<Regex> = Lazy::new(|| Regex::new(r"csrftoken").unwrap());
static RE_RAILS: Lazy<Regex> = Lazy::new(|| Regex::new(r"_rails_session").unwrap());
static RE_NEXTJS: Lazy<Regex> = Lazy::new(|| Regex::new(r"/_next/static/").unwrap());
static RE_NUXTJS: Lazy<Regex> = Lazy::new(|| Regex::new(r"__NUXT__").unwrap());
static RE_ANGULAR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"ng-version="([\d\.]+)""#).unwrap());
static RE_REACT: Lazy<Regex> = Lazy::new(|| Regex::new(r"react-dom|data-reactroot").unwrap());
static RE_VUE: Lazy<Regex> = Lazy::new(|| Regex::new(r"data-v-app|__VUE_").unwrap());
static RE_JQUERY: Lazy<Regex> = Lazy::new(|| Regex::new(r"jquery(?:[-.]([\d\.]+\d))?(?:\.min)?\.js").unwrap());
static RE_BOOTSTRAP: Lazy<Regex> = Lazy::new(|| Regex::new(r"bootstrap(?:\.min)?\.css").unwrap());
static RE_GOOGLE_ANALYTICS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"google-analytics\.com/|googletagmanager\.com/").unwrap());

static SIGNATURES: &[Signature] = &[
    Signature { technology: "Nginx", evidence: Evidence::Header("server"), pattern: &RE_NGINX },
    Signature { technology: "Apache", evidence: Evidence::Header("server"), pattern: &RE_APACHE },
    Signature { technology: "IIS", evidence: Evidence::Header("server"), pattern: &RE_IIS },
    Signature { technology: "Cloudflare", evidence: Evidence::Header("server"), pattern: &RE_CLOUDFLARE },
    Signature { technology: "LiteSpeed", evidence: Evidence::Header("server"), pattern: &RE_LITESPEED },
    Signature { technology: "WordPress", evidence: Evidence::MetaTag("generator"), pattern: &RE_WORDPRESS },
    Signature { technology: "WordPress", evidence: Evidence::Body, pattern: &RE_WP_ASSETS },
    Signature { technology: "Joomla", evidence: Evidence::MetaTag("generator"), pattern: &RE_JOOMLA },
    Signature { technology: "Drupal", evidence: Evidence::MetaTag("generator"), pattern: &RE_DRUPAL },
    Signature { technology: "PHP", evidence: Evidence::Header("x-powered-by"), pattern: &RE_PHP },
    Signature { technology: "PHP", evidence: Evidence::Cookie, pattern: &RE_PHPSESSID },
    Signature { technology: "ASP.NET", evidence: Evidence::Header("x-powered-by"), pattern: &RE_ASPNET },
    Signature { technology: "Java", evidence: Evidence::Cookie, pattern: &RE_JSESSIONID },
    Signature { technology: "Django", evidence: Evidence::Cookie, pattern: &RE_DJANGO_CSRF },
    Signature { technology: "Ruby on Rails", evidence: Evidence::Cookie, pattern: &RE_RAILS },
    Signature { technology: "Next.js", evidence: Evidence::ScriptSrc, pattern: &RE_NEXTJS },
    Signature { technology: "Nuxt.js", evidence: Evidence::Body, pattern: &RE_NUXTJS },
    Signature { technology: "Angular", evidence: Evidence::Body, pattern: &RE_ANGULAR },
    Signature { technology: "React", evidence: Evidence::Body, pattern: &RE_REACT },
    Signature { technology: "Vue.js", evidence: Evidence::Body, pattern: &RE_VUE },
    Signature { technology: "jQuery", evidence: Evidence::ScriptSrc, pattern: &RE_JQUERY },
    Signature { technology: "Bootstrap", evidence: Evidence::LinkHref, pattern: &RE_BOOTSTRAP },
    Signature { technology: "Google Analytics", evidence: Evidence::ScriptSrc, pattern: &RE_GOOGLE_ANALYTICS },
];

pub fn descriptor() -> ModuleDescriptor {
    ModuleDescriptor::new(NAME, WATCHED, PRODUCED, |config| {
        Ok(Box::new(WebTechnology { client: http_client(&config)?, scheme: scheme(&config) }))
    })
    .summary("Fingerprints the server software and front-end libraries behind a host's landing page.")
    .max_instances(3)
    .option("scheme", json!("https"))
    .option("timeout_secs", json!(10))
}

pub struct WebTechnology {
    client: reqwest::Client,
    scheme: String,
}

#[async_trait]
impl Module for WebTechnology {
    fn watched_types(&self) -> Vec<String> {
        WATCHED.iter().map(|t| t.to_string()).collect()
    }

    fn produced_types(&self) -> Vec<String> {
        PRODUCED.iter().map(|t| t.to_string()).collect()
    }

    async fn handle(&self, event: &Event) -> Result<Vec<EventDraft>, ModuleError> {
        let url = landing_url(&self.scheme, &event.data);
        info!(target = %event.data, "Starting fingerprint check.");

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "HTTP request failed for fingerprint check.");
                return Ok(Vec::new());
            }
        };
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| ModuleError::failed(NAME, format!("Failed to read response body: {e}")))?;
        debug!(bytes = body.len(), "Read response body.");

        let found = fingerprint(&headers, &body);
        info!(target = %event.data, count = found.len(), "Fingerprint check finished.");
        Ok(found
            .into_iter()
            .map(|(name, version)| {
                let label = match version {
                    Some(version) => format!("{name} {version}"),
                    None => name.to_string(),
                };
                EventDraft::new(event_types::WEBSERVER_TECHNOLOGY, label)
            })
            .collect())
    }
}

/// Technologies recognised in a response, with a version when one was seen.
pub fn fingerprint(headers: &HeaderMap, body: &str) -> BTreeMap<&'static str, Option<String>> {
    let document = Html::parse_document(body);
    let cookies = headers
        .get_all("set-cookie")
        .into_iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join("; ");

    let mut found: BTreeMap<&'static str, Option<String>> = BTreeMap::new();
    for signature in SIGNATURES {
        let pattern: &Regex = signature.pattern;
        let hit = match signature.evidence {
            Evidence::Header(name) => match_text(headers.get(name).and_then(|v| v.to_str().ok()), pattern),
            Evidence::MetaTag(name) => match_meta(&document, name, pattern),
            Evidence::Body => match_text(Some(body), pattern),
            Evidence::ScriptSrc => match_attribute(&document, "script[src]", "src", pattern),
            Evidence::LinkHref => match_attribute(&document, "link[href]", "href", pattern),
            Evidence::Cookie => match_text(Some(&cookies), pattern),
        };
        if let Some(version) = hit {
            debug!(tech = signature.technology, version = ?version, "Signature matched.");
            let entry = found.entry(signature.technology).or_insert(None);
            if entry.is_none() {
                *entry = version;
            }
        }
    }
    found
}

/// `Some(version)` when `pattern` matches; the version is capture group 1, if any.
fn match_text(text: Option<&str>, pattern: &Regex) -> Option<Option<String>> {
    let captures = pattern.captures(text?)?;
    Some(captures.get(1).map(|m| m.as_str().to_string()).filter(|s| !s.is_empty()))
}

fn match_meta(document: &Html, name: &str, pattern: &Regex) -> Option<Option<String>> {
    let selector = Selector::parse(&format!("meta[name='{name}']")).ok()?;
    let content = document.select(&selector).next().and_then(|el| el.value().attr("content"));
    match_text(content, pattern)
}

fn match_attribute(document: &Html, selector: &str, attribute: &str, pattern: &Regex) -> Option<Option<String>> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .filter_map(|el| el.value().attr(attribute))
        .find_map(|value| match_text(Some(value), pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_fingerprints_headers_markup_and_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert("server", HeaderValue::from_static("nginx/1.25.3"));
        headers.append("set-cookie", HeaderValue::from_static("PHPSESSID=abc; path=/"));
        let body = r#"<html><head>
            <meta name="generator" content="WordPress 6.4.2">
            <script src="/assets/jquery-3.7.1.min.js"></script>
            <link rel="stylesheet" href="/css/bootstrap.min.css">
            </head><body><img src="/wp-content/uploads/logo.png"></body></html>"#;

        let found = fingerprint(&headers, body);
        assert_eq!(found.get("Nginx"), Some(&Some("1.25.3".to_string())));
        assert_eq!(found.get("WordPress"), Some(&Some("6.4.2".to_string())));
        assert_eq!(found.get("jQuery"), Some(&Some("3.7.1".to_string())));
        assert_eq!(found.get("Bootstrap"), Some(&None));
        assert_eq!(found.get("PHP"), Some(&None));
        assert!(!found.contains_key("React"));
    }

    #[test]
    fn test_plain_page_has_no_fingerprint() {
        assert!(fingerprint(&HeaderMap::new(), "<html><body>hello</body></html>").is_empty());
    }
}
