use crate::error::ServerError;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata_core::LayerKind;

/// CLI arguments for the layer server.
#[derive(Parser, Debug, Clone)]
#[command(name = "strata-server")]
#[command(about = "Layered session server")]
#[command(version)]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,
    /// Validate the configuration and exit.
    #[arg(long)]
    pub check: bool,
}

/// Address and advertising settings of one layer listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenerConfig {
    pub enabled: bool,
    pub host: String,
    /// 0 binds an ephemeral port; the bound port is advertised.
    pub port: u16,
    /// URL path the WebSocket upgrade must target. Empty means `/<layer>`.
    pub path: String,
    /// Advertise `wss://`. TLS itself is terminated in front of the server.
    pub secure: bool,
    /// Advertised URL when it differs from the bind address.
    pub external_url: Option<String>,
    /// Disable send coalescing (TCP_NODELAY).
    pub no_delay: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 0,
            path: String::new(),
            secure: false,
            external_url: None,
            no_delay: true,
        }
    }
}

impl ListenerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The URL peers are told to connect to, given the actually bound port.
    pub fn advertised_url(&self, bound_port: u16) -> String {
        if let Some(url) = &self.external_url {
            return url.clone();
        }
        let scheme = if self.secure { "wss" } else { "ws" };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("{scheme}://{host}:{bound_port}{}", self.path)
    }
}

/// Per-layer listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayersConfig {
    pub cc: ListenerConfig,
    #[serde(rename = "static")]
    pub static_content: ListenerConfig,
    pub actor: ListenerConfig,
    pub dynamic: ListenerConfig,
    pub environ: ListenerConfig,
}

impl Default for LayersConfig {
    fn default() -> Self {
        let mut layers = Self {
            cc: ListenerConfig {
                port: 9000,
                ..ListenerConfig::default()
            },
            static_content: ListenerConfig::default(),
            actor: ListenerConfig::default(),
            dynamic: ListenerConfig::default(),
            environ: ListenerConfig::default(),
        };
        layers.fill_paths();
        layers
    }
}

impl LayersConfig {
    pub fn get(&self, kind: LayerKind) -> &ListenerConfig {
        match kind {
            LayerKind::Cc => &self.cc,
            LayerKind::Static => &self.static_content,
            LayerKind::Actor => &self.actor,
            LayerKind::Dynamic => &self.dynamic,
            LayerKind::Environ => &self.environ,
        }
    }

    pub fn get_mut(&mut self, kind: LayerKind) -> &mut ListenerConfig {
        match kind {
            LayerKind::Cc => &mut self.cc,
            LayerKind::Static => &mut self.static_content,
            LayerKind::Actor => &mut self.actor,
            LayerKind::Dynamic => &mut self.dynamic,
            LayerKind::Environ => &mut self.environ,
        }
    }

    fn fill_paths(&mut self) {
        for kind in LayerKind::ALL {
            let layer = self.get_mut(kind);
            if layer.path.is_empty() {
                layer.path = format!("/{kind}");
            }
        }
    }
}

/// A circuit known ahead of time, for development without a login service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitConfig {
    pub agent_id: String,
    pub session_id: String,
    pub secure_session_id: String,
    pub circuit_code: u32,
}

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Reported to peers as `ServerVersion`.
    pub server_version: String,
    pub region_name: String,
    /// Lifetime of an unclaimed invitation.
    pub invite_ttl_secs: u64,
    /// Interval between sweeps of expired invitations.
    pub sweep_interval_secs: u64,
    /// Connections still unauthenticated after this long are closed.
    pub handshake_timeout_secs: u64,
    /// WebSocket upgrade deadline.
    pub upgrade_timeout_secs: u64,
    /// AliveCheck interval on command sessions. 0 = disabled.
    pub alive_check_secs: u64,
    /// Deadline for answers to server-originated requests.
    pub request_timeout_secs: u64,
    /// Service directory sent to peers as `Services`.
    pub services: BTreeMap<String, String>,
    pub layers: LayersConfig,
    pub circuits: Vec<CircuitConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            region_name: "Region".to_string(),
            invite_ttl_secs: 60,
            sweep_interval_secs: 15,
            handshake_timeout_secs: 30,
            upgrade_timeout_secs: 5,
            alive_check_secs: 0,
            request_timeout_secs: 10,
            services: BTreeMap::new(),
            layers: LayersConfig::default(),
            circuits: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        config.validate().map_err(ServerError::Config)?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ServerError> {
        let mut config: ServerConfig =
            toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))?;
        config.layers.fill_paths();
        Ok(config)
    }

    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        let timeouts = [
            ("invite_ttl_secs", self.invite_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("upgrade_timeout_secs", self.upgrade_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
            if value > 86_400 {
                return Err(format!("{name} exceeds reasonable limit (86400 seconds)"));
            }
        }

        if !self.layers.cc.enabled {
            return Err("layers.cc must be enabled; peers bootstrap through it".to_string());
        }

        let mut bound = HashSet::new();
        for kind in LayerKind::ALL {
            let layer = self.layers.get(kind);
            if !layer.enabled {
                continue;
            }
            if !layer.path.starts_with('/') {
                return Err(format!("layers.{kind}.path must start with '/'"));
            }
            if layer.host.is_empty() {
                return Err(format!("layers.{kind}.host must not be empty"));
            }
            if layer.port != 0 && !bound.insert(layer.bind_addr()) {
                return Err(format!(
                    "layers.{kind} reuses address {} of another layer",
                    layer.bind_addr()
                ));
            }
        }
        Ok(())
    }

    pub fn invite_ttl(&self) -> Duration {
        Duration::from_secs(self.invite_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_secs(self.upgrade_timeout_secs)
    }

    pub fn alive_check(&self) -> Option<Duration> {
        (self.alive_check_secs > 0).then(|| Duration::from_secs(self.alive_check_secs))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
