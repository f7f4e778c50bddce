//! Optional per-attempt proxy acquisition.
//!
//! The provider endpoint returns an `ip:port` either as plain text or
//! wrapped in a small JSON object. Every candidate is probed against the
//! target site before use; any failure just means the attempt runs
//! without a proxy.

use std::time::Duration;

use lazy_static::lazy_static;
use log::{info, warn};
use regex::Regex;

lazy_static! {
    static ref HOST_PORT_RGX: Regex = Regex::new(r"^[A-Za-z0-9.\-]+:\d{2,5}$").unwrap();
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Provider endpoint. `None` disables proxying entirely.
    pub api_url: Option<String>,
    /// Site used for the live connectivity probe.
    pub probe_url: String,
    pub probe_timeout: Duration,
}

/// Fetch and validate a proxy. `None` means "go direct".
pub async fn acquire(http: &reqwest::Client, cfg: &ProxyConfig) -> Option<String> {
    let api_url = cfg.api_url.as_ref()?;
    let body = match http.get(api_url).send().await.and_then(|r| r.error_for_status()) {
        Ok(resp) => match resp.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!("proxy provider response unreadable: {}", e);
                return None;
            }
        },
        Err(e) => {
            warn!("proxy provider unreachable: {}", e);
            return None;
        }
    };

    let addr = match parse_provider_body(&body) {
        Some(addr) => addr,
        None => {
            warn!("proxy provider returned no usable address");
            return None;
        }
    };

    if validate(&addr, &cfg.probe_url, cfg.probe_timeout).await {
        info!("using proxy {}", addr);
        Some(addr)
    } else {
        warn!("proxy {} failed the connectivity probe, going direct", addr);
        None
    }
}

/// Accepts `ip:port` as plain text, a JSON string, `{"proxy": "ip:port"}`,
/// or `{"ip": "...", "port": ...}`.
fn parse_provider_body(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        match value {
            serde_json::Value::String(s) if HOST_PORT_RGX.is_match(s.trim()) => {
                return Some(s.trim().to_owned());
            }
            serde_json::Value::Object(map) => {
                if let Some(addr) = map.get("proxy").and_then(|v| v.as_str()) {
                    if HOST_PORT_RGX.is_match(addr.trim()) {
                        return Some(addr.trim().to_owned());
                    }
                }
                let ip = map.get("ip").and_then(|v| v.as_str())?;
                let port = match map.get("port")? {
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::String(s) => s.clone(),
                    _ => return None,
                };
                let addr = format!("{}:{}", ip, port);
                return HOST_PORT_RGX.is_match(&addr).then_some(addr);
            }
            _ => return None,
        }
    }
    HOST_PORT_RGX.is_match(trimmed).then(|| trimmed.to_owned())
}

/// Live probe through the proxy. Any HTTP response counts as
/// connectivity; the site may well redirect unauthenticated requests.
async fn validate(addr: &str, probe_url: &str, timeout: Duration) -> bool {
    let proxy = match reqwest::Proxy::all(format!("http://{}", addr)) {
        Ok(proxy) => proxy,
        Err(_) => return false,
    };
    let client = match reqwest::Client::builder().proxy(proxy).timeout(timeout).build() {
        Ok(client) => client,
        Err(_) => return false,
    };
    client.get(probe_url).send().await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_text() {
        assert_eq!(
            parse_provider_body("203.0.113.9:8080\n"),
            Some("203.0.113.9:8080".to_owned())
        );
    }

    #[test]
    fn parses_json_string() {
        assert_eq!(
            parse_provider_body(r#""203.0.113.9:8080""#),
            Some("203.0.113.9:8080".to_owned())
        );
    }

    #[test]
    fn parses_json_objects() {
        assert_eq!(
            parse_provider_body(r#"{"proxy": "198.51.100.2:3128"}"#),
            Some("198.51.100.2:3128".to_owned())
        );
        assert_eq!(
            parse_provider_body(r#"{"ip": "198.51.100.2", "port": 3128}"#),
            Some("198.51.100.2:3128".to_owned())
        );
        assert_eq!(
            parse_provider_body(r#"{"ip": "198.51.100.2", "port": "3128"}"#),
            Some("198.51.100.2:3128".to_owned())
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_provider_body("no proxies available"), None);
        assert_eq!(parse_provider_body(r#"{"error": "out of stock"}"#), None);
        assert_eq!(parse_provider_body(""), None);
    }
}
