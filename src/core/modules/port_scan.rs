// src/core/modules/port_scan.rs

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::core::error::ModuleError;
use crate::core::models::{event_types, Event, EventDraft};
use crate::core::registry::{Module, ModuleConfig, ModuleDescriptor};

pub const NAME: &str = "port_scan";

const WATCHED: &[&str] = &[event_types::IP_ADDRESS, event_types::IPV6_ADDRESS];
const PRODUCED: &[&str] = &[event_types::TCP_PORT_OPEN];

const DEFAULT_PORTS: &[u16] = &[21, 22, 25, 53, 80, 110, 143, 443, 445, 993, 3306, 3389, 5432, 8080, 8443];

pub fn descriptor() -> ModuleDescriptor {
    ModuleDescriptor::new(NAME, WATCHED, PRODUCED, |config| Ok(Box::new(PortScan::from_config(&config)?)))
        .summary("Checks a short list of common TCP ports with plain connect attempts.")
        .max_instances(4)
        .option("ports", json!(DEFAULT_PORTS))
        .option("connect_timeout_ms", json!(1500))
        .option("batch_size", json!(16))
}

pub struct PortScan {
    ports: Vec<u16>,
    connect_timeout: Duration,
    batch_size: usize,
}

impl PortScan {
    fn from_config(config: &ModuleConfig) -> Result<Self, ModuleError> {
        let ports = config
            .get("ports")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|v| v.as_u64().and_then(|p| u16::try_from(p).ok()).filter(|p| *p != 0))
                    .collect::<Option<Vec<u16>>>()
            })
            .unwrap_or_else(|| Some(DEFAULT_PORTS.to_vec()))
            .ok_or_else(|| ModuleError::InvalidOptions {
                module: NAME.to_string(),
                message: "ports must be numbers between 1 and 65535".to_string(),
            })?;
        Ok(Self {
            ports,
            connect_timeout: Duration::from_millis(config.get_u64("connect_timeout_ms").unwrap_or(1500)),
            batch_size: config.get_u64("batch_size").unwrap_or(16).max(1) as usize,
        })
    }

    /// Ports on `ip` that accepted a TCP connection, in ascending order.
    pub async fn open_ports(&self, ip: IpAddr) -> Vec<u16> {
        let connect_timeout = self.connect_timeout;
        let mut open: Vec<u16> = stream::iter(self.ports.iter().copied())
            .map(|port| async move {
                let address = SocketAddr::new(ip, port);
                match timeout(connect_timeout, TcpStream::connect(address)).await {
                    Ok(Ok(_)) => Some(port),
                    Ok(Err(e)) => {
                        debug!(%address, error = %e, "Port closed.");
                        None
                    }
                    Err(_) => {
                        debug!(%address, "Port connect timed out.");
                        None
                    }
                }
            })
            .buffer_unordered(self.batch_size)
            .filter_map(|port| async move { port })
            .collect()
            .await;
        open.sort_unstable();
        open
    }
}

#[async_trait]
impl Module for PortScan {
    fn watched_types(&self) -> Vec<String> {
        WATCHED.iter().map(|t| t.to_string()).collect()
    }

    fn produced_types(&self) -> Vec<String> {
        PRODUCED.iter().map(|t| t.to_string()).collect()
    }

    async fn handle(&self, event: &Event) -> Result<Vec<EventDraft>, ModuleError> {
        let ip: IpAddr = event
            .data
            .parse()
            .map_err(|e| ModuleError::failed(NAME, format!("'{}' is not an IP address: {e}", event.data)))?;
        info!(target = %ip, ports = self.ports.len(), "Starting port scan.");
        let open = self.open_ports(ip).await;
        info!(target = %ip, open = open.len(), "Port scan finished.");
        Ok(open
            .into_iter()
            .map(|port| EventDraft::new(event_types::TCP_PORT_OPEN, SocketAddr::new(ip, port).to_string()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ScanId;
    use tokio::net::TcpListener;

    fn scanner(ports: Vec<u16>) -> PortScan {
        PortScan { ports, connect_timeout: Duration::from_millis(500), batch_size: 4 }
    }

    #[tokio::test]
    async fn test_reports_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();
        let closed_port = {
            let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
            spare.local_addr().unwrap().port()
        };

        let seed = Event::seed(&ScanId::from("s"), event_types::IP_ADDRESS, "127.0.0.1");
        let drafts = scanner(vec![open_port, closed_port]).handle(&seed).await.unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].data, format!("127.0.0.1:{open_port}"));
        drop(listener);
    }

    #[tokio::test]
    async fn test_rejects_non_ip_data() {
        let seed = Event::seed(&ScanId::from("s"), event_types::IP_ADDRESS, "example.com");
        assert!(scanner(vec![80]).handle(&seed).await.is_err());
    }

    #[test]
    fn test_invalid_port_option() {
        let overrides = json!({"ports": [80, 70000]}).as_object().cloned().unwrap();
        assert!(descriptor().instantiate(&overrides).is_err());
    }
}
