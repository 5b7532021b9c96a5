// Copyright 2020 Joyent, Inc.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_REGISTRY_PORT: u16 = 6601;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30);
pub const DEFAULT_EVICTION_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_DISCOVER_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_POOL_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Where a client connects and how often it sends heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub heartbeat_interval: Duration,
}

impl ClientConfig {
    pub fn new<H: Into<String>>(host: H, port: u16) -> ClientConfig {
        ClientConfig {
            server_host: host.into(),
            server_port: port,
            ..ClientConfig::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_host: String::from("127.0.0.1"),
            server_port: DEFAULT_REGISTRY_PORT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Settings of a registry center process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub bind_host: String,
    pub bind_port: u16,
    /// How long a Down endpoint is kept before it is evicted.
    pub retention: Duration,
    pub eviction_period: Duration,
}

impl RegistryConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            bind_host: String::from("0.0.0.0"),
            bind_port: DEFAULT_REGISTRY_PORT,
            retention: DEFAULT_RETENTION,
            eviction_period: DEFAULT_EVICTION_PERIOD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedClientConfig {
    /// Registry centers, consulted in order.
    pub registries: Vec<ClientConfig>,
    /// Logical names of the services this client calls.
    pub dependencies: Vec<String>,
    pub discover_timeout: Duration,
    /// Heartbeat interval of the connections opened to service endpoints.
    pub pool_heartbeat_interval: Duration,
}

impl Default for DistributedClientConfig {
    fn default() -> Self {
        DistributedClientConfig {
            registries: Vec::new(),
            dependencies: Vec::new(),
            discover_timeout: DEFAULT_DISCOVER_TIMEOUT,
            pool_heartbeat_interval: DEFAULT_POOL_HEARTBEAT_INTERVAL,
        }
    }
}
