//! Gateway configuration.
//!
//! Process settings come from the environment; listeners and routes come
//! from a JSON file named by `GATEWAY_CONFIG`.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::proxy::handler::{EchoHandler, StreamHandler};
use crate::proxy::router::{ListenerConfig, RouteTable};
use crate::proxy::stream::Protocol;
use crate::proxy::tls;

/// Gateway configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the listener and route file.
    pub config_path: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Default bound on a sniff phase.
    pub sniff_timeout: Duration,

    /// Upstream connect timeout.
    pub connect_timeout: Duration,

    /// Bound on a local TLS handshake.
    pub tls_handshake_timeout: Duration,

    /// Address for the debug HTTP surface. Disabled when unset.
    pub debug_addr: Option<SocketAddr>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config_path = var("GATEWAY_CONFIG")
            .map(PathBuf::from)
            .context("Missing config file. Set GATEWAY_CONFIG to a JSON listener/route file.")?;

        let log_level = var("GATEWAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let sniff_timeout = millis(&var, "GATEWAY_SNIFF_TIMEOUT_MS", 5_000)?;
        let connect_timeout = millis(&var, "GATEWAY_CONNECT_TIMEOUT_MS", 5_000)?;
        let tls_handshake_timeout = millis(&var, "GATEWAY_TLS_HANDSHAKE_TIMEOUT_MS", 10_000)?;

        let debug_addr = var("GATEWAY_DEBUG_ADDR")
            .map(|v| v.parse())
            .transpose()
            .context("GATEWAY_DEBUG_ADDR must be a socket address (example: 127.0.0.1:9090).")?;

        Ok(Self {
            config_path,
            log_level,
            sniff_timeout,
            connect_timeout,
            tls_handshake_timeout,
            debug_addr,
        })
    }
}

fn millis(var: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<Duration> {
    let ms: u64 = var(name)
        .map(|v| v.parse())
        .transpose()
        .with_context(|| format!("{name} must be an integer (milliseconds)."))?
        .unwrap_or(default);
    if ms == 0 {
        bail!("{name} must be greater than zero.");
    }
    Ok(Duration::from_millis(ms))
}

/// PEM certificate chain and private key paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Built-in in-process handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Echo,
}

impl HandlerKind {
    fn build(self) -> Arc<dyn StreamHandler> {
        match self {
            Self::Echo => Arc::new(EchoHandler),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerSpec {
    /// `host:port`, or `unix:/path` for a Unix socket.
    pub address: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub forward_to: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsFiles>,
    #[serde(default)]
    pub handler: Option<HandlerKind>,
    #[serde(default)]
    pub sni_port: Option<u16>,
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub sniff_timeout_ms: Option<u64>,
}

/// Per-host override. `host` is exact, `host:port`, or `*.suffix`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    pub host: String,
    #[serde(default)]
    pub forward_to: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsFiles>,
    #[serde(default)]
    pub handler: Option<HandlerKind>,
    #[serde(default)]
    pub sni_port: Option<u16>,
}

impl RouteSpec {
    fn target(&self) -> RouteTarget {
        RouteTarget {
            forward_to: self.forward_to.clone(),
            tls: self.tls.clone(),
            handler: self.handler,
            sni_port: self.sni_port,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteTarget {
    #[serde(default)]
    pub forward_to: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsFiles>,
    #[serde(default)]
    pub handler: Option<HandlerKind>,
    #[serde(default)]
    pub sni_port: Option<u16>,
}

/// Contents of the `GATEWAY_CONFIG` file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub listeners: Vec<ListenerSpec>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub default_route: Option<RouteTarget>,
}

/// Listeners and routes ready to hand to the gateway.
pub struct Resolved {
    pub listeners: Vec<Arc<ListenerConfig>>,
    pub routes: Arc<RouteTable>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Validate, load TLS material and build runtime configs.
    pub fn resolve(&self) -> Result<Resolved> {
        if self.listeners.is_empty() {
            bail!("at least one listener is required");
        }

        let listeners = self
            .listeners
            .iter()
            .map(|spec| build_listener(spec).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let routes = RouteTable::new();
        let entries = self
            .routes
            .iter()
            .map(|route| {
                let config = build_route(&route.host, &route.target())
                    .with_context(|| format!("route {}", route.host))?;
                Ok((route.host.clone(), Arc::new(config)))
            })
            .collect::<Result<Vec<_>>>()?;
        let default = self
            .default_route
            .as_ref()
            .map(|target| build_route("default", target).map(Arc::new))
            .transpose()
            .context("default_route")?;
        routes.update(entries, default);

        Ok(Resolved {
            listeners,
            routes: Arc::new(routes),
        })
    }
}

fn build_listener(spec: &ListenerSpec) -> Result<ListenerConfig> {
    let mut config = ListenerConfig::new(spec.address.clone(), spec.protocol);
    config.forward_to = spec.forward_to.clone();
    config.handler = spec.handler.map(HandlerKind::build);
    config.sni_port = spec.sni_port;
    config.max_connections = spec.max_connections;
    config.sniff_timeout = spec.sniff_timeout_ms.map(Duration::from_millis);
    if let Some(files) = &spec.tls {
        config.tls = Some(load_tls(files).with_context(|| format!("listener {}", spec.address))?);
    }

    if config.max_connections == Some(0) {
        bail!("listener {}: max_connections must be greater than zero", spec.address);
    }
    match spec.protocol {
        Protocol::Tcp if config.forward_to.is_none() && config.handler.is_none() => {
            bail!("listener {}: tcp needs forward_to or handler", spec.address)
        }
        Protocol::Https if config.tls.is_none() => {
            bail!("listener {}: https needs tls", spec.address)
        }
        _ => {}
    }
    Ok(config)
}

fn build_route(host: &str, target: &RouteTarget) -> Result<ListenerConfig> {
    let mut config = ListenerConfig::new(host, Protocol::Tcp);
    config.forward_to = target.forward_to.clone();
    config.handler = target.handler.map(HandlerKind::build);
    config.sni_port = target.sni_port;
    if let Some(files) = &target.tls {
        config.tls = Some(load_tls(files)?);
    }
    Ok(config)
}

/// Load a PEM certificate chain and key into a server config.
pub fn load_tls(files: &TlsFiles) -> Result<Arc<rustls::ServerConfig>> {
    let cert_file = File::open(&files.cert)
        .with_context(|| format!("Failed to open certificate {}", files.cert.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificate {}", files.cert.display()))?;
    if certs.is_empty() {
        bail!("no certificates in {}", files.cert.display());
    }

    let key_file = File::open(&files.key)
        .with_context(|| format!("Failed to open private key {}", files.key.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("Failed to parse private key {}", files.key.display()))?
        .with_context(|| format!("no private key in {}", files.key.display()))?;

    tls::server_config(certs, key).context("certificate and key do not form a valid TLS config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_env_defaults() {
        let config = Config::from_lookup(env(&[("GATEWAY_CONFIG", "/etc/gw.json")])).unwrap();
        assert_eq!(config.config_path, PathBuf::from("/etc/gw.json"));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.sniff_timeout, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.tls_handshake_timeout, Duration::from_secs(10));
        assert!(config.debug_addr.is_none());
    }

    #[test]
    fn test_env_overrides_and_errors() {
        let config = Config::from_lookup(env(&[
            ("GATEWAY_CONFIG", "gw.json"),
            ("GATEWAY_SNIFF_TIMEOUT_MS", "250"),
            ("GATEWAY_DEBUG_ADDR", "127.0.0.1:9090"),
        ]))
        .unwrap();
        assert_eq!(config.sniff_timeout, Duration::from_millis(250));
        assert_eq!(config.debug_addr, Some("127.0.0.1:9090".parse().unwrap()));

        assert!(Config::from_lookup(env(&[])).is_err());
        assert!(Config::from_lookup(env(&[
            ("GATEWAY_CONFIG", "gw.json"),
            ("GATEWAY_CONNECT_TIMEOUT_MS", "soon"),
        ]))
        .is_err());
        assert!(Config::from_lookup(env(&[
            ("GATEWAY_CONFIG", "gw.json"),
            ("GATEWAY_SNIFF_TIMEOUT_MS", "0"),
        ]))
        .is_err());
    }

    #[test]
    fn test_resolve_listeners_and_routes() {
        let file = FileConfig::parse(
            r#"{
                "listeners": [
                    {"address": "127.0.0.1:1080", "protocol": "socks5", "max_connections": 64},
                    {"address": "127.0.0.1:7000", "protocol": "tcp", "handler": "echo"},
                    {"address": "unix:/tmp/gw.sock", "protocol": "connect", "sniff_timeout_ms": 200}
                ],
                "routes": [
                    {"host": "api.example.com", "forward_to": "10.0.0.1:443"},
                    {"host": "*.internal", "handler": "echo"}
                ],
                "default_route": {"forward_to": "10.0.0.9:80"}
            }"#,
        )
        .unwrap();
        let resolved = file.resolve().unwrap();

        assert_eq!(resolved.listeners.len(), 3);
        assert_eq!(resolved.listeners[0].protocol, Protocol::Socks5);
        assert_eq!(resolved.listeners[0].max_connections, Some(64));
        assert!(resolved.listeners[1].handler.is_some());
        assert_eq!(resolved.listeners[2].unix_path(), Some("/tmp/gw.sock"));
        assert_eq!(
            resolved.listeners[2].sniff_timeout,
            Some(Duration::from_millis(200))
        );

        assert_eq!(resolved.routes.len(), 2);
        let api = resolved.routes.get("api.example.com:443").unwrap();
        assert_eq!(api.forward_to.as_deref(), Some("10.0.0.1:443"));
        assert!(resolved.routes.get("db.internal").unwrap().handler.is_some());
        let fallback = resolved.routes.get("unknown.test").unwrap();
        assert_eq!(fallback.forward_to.as_deref(), Some("10.0.0.9:80"));
    }

    #[test]
    fn test_invalid_listeners_rejected() {
        let cases = [
            r#"{"listeners": []}"#,
            r#"{"listeners": [{"address": "127.0.0.1:1", "protocol": "tcp"}]}"#,
            r#"{"listeners": [{"address": "127.0.0.1:1", "protocol": "https"}]}"#,
            r#"{"listeners": [{"address": "127.0.0.1:1", "protocol": "socks5", "max_connections": 0}]}"#,
        ];
        for raw in cases {
            let file = FileConfig::parse(raw).unwrap();
            assert!(file.resolve().is_err(), "accepted {raw}");
        }

        assert!(FileConfig::parse(r#"{"listeners": [{"address": "a", "protocol": "gopher"}]}"#).is_err());
        assert!(FileConfig::parse(r#"{"listenres": []}"#).is_err());
    }

    #[test]
    fn test_load_tls_from_pem() {
        let dir = std::env::temp_dir().join(format!("meshgate-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["gw.test".to_string()]).unwrap();
        let files = TlsFiles {
            cert: dir.join("cert.pem"),
            key: dir.join("key.pem"),
        };
        std::fs::write(&files.cert, cert.cert.pem()).unwrap();
        std::fs::write(&files.key, cert.key_pair.serialize_pem()).unwrap();

        assert!(load_tls(&files).is_ok());

        let swapped = TlsFiles {
            cert: files.key.clone(),
            key: files.cert.clone(),
        };
        assert!(load_tls(&swapped).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
