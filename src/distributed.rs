// Copyright 2020 Joyent, Inc.

//! Calling services by logical name.
//!
//! A [`DistributedClient`] asks registry centers where each of its
//! dependencies runs, keeps one connection per live endpoint, and sends each
//! call to the pool member picked by [`route`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use slog::{debug, info, o, warn, Logger};

use crate::client::Client;
use crate::config::{ClientConfig, DistributedClientConfig};
use crate::error::RpcError;
use crate::protocol::{RpcMessage, DISCOVER};
use crate::registry::ServiceEndpoint;

/// Index of the pool member that serves `command`: CRC32 (IEEE) of the
/// command modulo the pool size. Panics if `pool_size` is 0.
pub fn route(command: &str, pool_size: usize) -> usize {
    assert!(pool_size > 0, "route called with an empty pool");
    crc32fast::hash(command.as_bytes()) as usize % pool_size
}

type Pool = Vec<Arc<Client>>;

pub struct DistributedClient {
    conf: DistributedClientConfig,
    registries: Vec<Client>,
    pools: RwLock<HashMap<String, Pool>>,
    discovery: tokio::sync::Mutex<()>,
    log: Logger,
}

impl DistributedClient {
    /// Connects to every reachable registry center and builds a pool for
    /// each dependency. Unreachable registries are skipped; it is an error
    /// only if none can be reached.
    pub async fn connect(
        conf: DistributedClientConfig,
        log: Option<&Logger>,
    ) -> Result<DistributedClient, RpcError> {
        let log = crate::default_logger(log);

        let mut registries = Vec::new();
        for registry in conf.registries.iter() {
            match Client::connect(registry, Some(&log)).await {
                Ok(client) => registries.push(client),
                Err(e) => {
                    warn!(log, "registry center unreachable";
                        "registry" => registry.addr(), "err" => %e);
                }
            }
        }

        if registries.is_empty() && !conf.registries.is_empty() {
            return Err(RpcError::Discovery(String::from(
                "no registry center reachable",
            )));
        }

        let client = DistributedClient {
            conf,
            registries,
            pools: RwLock::new(HashMap::new()),
            discovery: tokio::sync::Mutex::new(()),
            log,
        };
        client.rediscover().await;
        Ok(client)
    }

    /// Asks each registry center in turn for the endpoints of
    /// `service_name` and returns the first answer that parses.
    pub async fn discover(
        &self,
        service_name: &str,
    ) -> Result<Vec<ServiceEndpoint>, RpcError> {
        let _guard = self.discovery.lock().await;

        for registry in self.registries.iter() {
            match self.discover_from(registry, service_name).await {
                Ok(endpoints) => {
                    debug!(self.log, "discovered";
                        "service" => service_name,
                        "registry" => %registry.remote_addr(),
                        "endpoints" => endpoints.len());
                    return Ok(endpoints);
                }
                Err(e) => {
                    warn!(self.log, "discovery failed, trying next registry";
                        "service" => service_name,
                        "registry" => %registry.remote_addr(),
                        "err" => %e);
                }
            }
        }

        Err(RpcError::Discovery(format!(
            "no registry center answered for {}",
            service_name
        )))
    }

    async fn discover_from(
        &self,
        registry: &Client,
        service_name: &str,
    ) -> Result<Vec<ServiceEndpoint>, RpcError> {
        let msg = RpcMessage::json(DISCOVER, service_name.to_string());
        let reply = registry
            .call(msg)
            .await?
            .timeout(self.conf.discover_timeout)
            .await?;

        let endpoints: Option<Vec<ServiceEndpoint>> =
            serde_json::from_slice(&reply.body)
                .map_err(|e| RpcError::Discovery(e.to_string()))?;
        Ok(endpoints.unwrap_or_default())
    }

    async fn build_pool(&self, endpoints: Vec<ServiceEndpoint>) -> Pool {
        let mut pool = Vec::new();
        for endpoint in endpoints.into_iter().filter(|e| !e.is_down()) {
            let conf = ClientConfig::new(
                endpoint.service_host.clone(),
                endpoint.service_port,
            )
            .with_heartbeat_interval(self.conf.pool_heartbeat_interval);

            let log = self.log.new(o!("endpoint" => endpoint.id().to_string()));
            match Client::connect(&conf, Some(&log)).await {
                Ok(client) => pool.push(Arc::new(client)),
                Err(e) => {
                    warn!(log, "skipping unreachable endpoint"; "err" => %e);
                }
            }
        }
        pool
    }

    /// Rebuilds the pool of every dependency from a fresh discovery. A
    /// dependency no registry center answers for is left without a pool.
    pub async fn rediscover(&self) {
        let mut pools = HashMap::new();
        for service in self.conf.dependencies.iter() {
            match self.discover(service).await {
                Ok(endpoints) => {
                    let pool = self.build_pool(endpoints).await;
                    info!(self.log, "pool ready";
                        "service" => service, "size" => pool.len());
                    pools.insert(service.clone(), pool);
                }
                Err(e) => {
                    warn!(self.log, "dependency unresolved";
                        "service" => service, "err" => %e);
                }
            }
        }

        let old = std::mem::replace(&mut *self.pools.write(), pools);
        for client in old.values().flatten() {
            client.close();
        }
    }

    /// Sends `body` on `command` to the member of `service_name`'s pool
    /// picked by [`route`]. See [`Client::execute_command`] for the meaning
    /// of `synchronous`.
    pub async fn execute_command<B: Into<Bytes>>(
        &self,
        service_name: &str,
        command: &str,
        body: B,
        synchronous: bool,
    ) -> Result<Option<Bytes>, RpcError> {
        let client = {
            let pools = self.pools.read();
            let pool = pools.get(service_name).ok_or_else(|| {
                RpcError::ServiceNotFound(service_name.to_string())
            })?;
            if pool.is_empty() {
                return Err(RpcError::NoProvider(service_name.to_string()));
            }
            Arc::clone(&pool[route(command, pool.len())])
        };

        client.execute_command(command, body, synchronous).await
    }

    /// Size of the pool of `service_name`, if it has one.
    pub fn pool_size(&self, service_name: &str) -> Option<usize> {
        self.pools.read().get(service_name).map(Vec::len)
    }

    /// Remote address of every member of `service_name`'s pool, in routing
    /// order.
    pub fn pool_addrs(
        &self,
        service_name: &str,
    ) -> Option<Vec<std::net::SocketAddr>> {
        self.pools
            .read()
            .get(service_name)
            .map(|pool| pool.iter().map(|c| c.remote_addr()).collect())
    }

    pub fn registry_count(&self) -> usize {
        self.registries.len()
    }

    /// Closes every registry and pool connection.
    pub fn close(&self) {
        for registry in self.registries.iter() {
            registry.close();
        }
        for client in self.pools.write().drain().flat_map(|(_, pool)| pool) {
            client.close();
        }
    }
}
