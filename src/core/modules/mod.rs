// src/core/modules/mod.rs

// Built-in collection modules. Each file holds one module: its `Module`
// implementation, its descriptor and the pure analysis helpers it relies on.
pub mod dns_resolve;
pub mod http_headers;
pub mod port_scan;
pub mod tls_certificate;
pub mod web_technology;

use std::time::Duration;

use crate::core::error::ModuleError;
use crate::core::registry::{ModuleConfig, ModuleRegistry};

/// User agent sent by every HTTP-speaking module.
pub const USER_AGENT: &str = concat!("reconflow/", env!("CARGO_PKG_VERSION"));

/// A registry holding every built-in module.
pub fn builtin_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry
        .register(dns_resolve::descriptor())
        .register(tls_certificate::descriptor())
        .register(http_headers::descriptor())
        .register(web_technology::descriptor())
        .register(port_scan::descriptor());
    registry
}

/// Builds the HTTP client shared by one module instance from its options.
///
/// # Arguments
/// * `config` - The module's validated options. `timeout_secs` is honoured when present.
///
/// # Returns
/// A ready `reqwest::Client`, or a module error if TLS setup fails.
pub(crate) fn http_client(config: &ModuleConfig) -> Result<reqwest::Client, ModuleError> {
    let timeout = Duration::from_secs(config.get_u64("timeout_secs").unwrap_or(10));
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| ModuleError::failed(&config.module, format!("Failed to build HTTP client: {e}")))
}

/// The `scheme` option, `https` unless overridden.
pub(crate) fn scheme(config: &ModuleConfig) -> String {
    config.get_str("scheme").unwrap_or("https").to_string()
}

/// URL of a host's landing page.
pub(crate) fn landing_url(scheme: &str, host: &str) -> String {
    format!("{scheme}://{host}/")
}
