// Copyright 2020 Joyent, Inc.

//! The registry center's store of service endpoints and live connections.
//!
//! Endpoint liveness follows a small state machine:
//!
//! ```text
//! REGISTER -> Up -> (owning connection closed) -> Down(lost at T)
//!                                                   |
//!                   Up <- (fresh REGISTER) <--------+
//!                                                   |
//!             removed <- (now - T > retention) <----+
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::Deserializer;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use slog::{debug, info, warn, Logger};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::RegistryConfig;
use crate::connection::Connection;
use crate::protocol::{RpcMessage, CONNECT_CLOSED};

/// Metadata key holding the endpoint status.
pub const STATUS_KEY: &str = "status";
/// Metadata key holding the RFC 3339 time an endpoint went Down.
pub const LOST_AT_KEY: &str = "lost_at";

/// Introspection code reported when the registry holds no endpoint.
pub const NO_DATA_CODE: i64 = 10001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStatus {
    Up,
    Down,
}

impl EndpointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointStatus::Up => "Up",
            EndpointStatus::Down => "Down",
        }
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn null_as_empty<'de, D>(
    deserializer: D,
) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let meta: Option<Map<String, Value>> =
        serde::Deserialize::deserialize(deserializer)?;
    Ok(meta.unwrap_or_default())
}

/// A registered service instance. This is also the `REGISTER` body and the
/// element type of the `DISCOVER` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service_name: String,
    pub service_host: String,
    pub service_port: u16,
    #[serde(default)]
    pub service_protoc: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub additional_meta: Map<String, Value>,
}

impl ServiceEndpoint {
    pub fn new<N, H, P>(name: N, host: H, port: u16, protoc: P) -> Self
    where
        N: Into<String>,
        H: Into<String>,
        P: Into<String>,
    {
        ServiceEndpoint {
            service_name: name.into(),
            service_host: host.into(),
            service_port: port,
            service_protoc: protoc.into(),
            additional_meta: Map::new(),
        }
    }

    pub fn id(&self) -> EndpointId {
        EndpointId {
            service_name: self.service_name.clone(),
            host: self.service_host.clone(),
            port: self.service_port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.service_host, self.service_port)
    }

    pub fn status(&self) -> Option<EndpointStatus> {
        match self.additional_meta.get(STATUS_KEY).and_then(Value::as_str) {
            Some("Up") => Some(EndpointStatus::Up),
            Some("Down") => Some(EndpointStatus::Down),
            _ => None,
        }
    }

    pub fn is_down(&self) -> bool {
        self.status() == Some(EndpointStatus::Down)
    }

    pub fn lost_at(&self) -> Option<DateTime<Utc>> {
        self.additional_meta
            .get(LOST_AT_KEY)
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    fn set_status(&mut self, status: EndpointStatus) {
        self.additional_meta
            .insert(STATUS_KEY.to_string(), Value::from(status.as_str()));
    }
}

/// Identity of an endpoint: `{service name, host, port}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointId {
    pub service_name: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.service_name, self.host, self.port)
    }
}

struct EndpointEntry {
    endpoint: ServiceEndpoint,
    lost_at: Option<Instant>,
}

impl EndpointEntry {
    fn matches(&self, id: &EndpointId) -> bool {
        self.endpoint.service_name == id.service_name
            && self.endpoint.service_host == id.host
            && self.endpoint.service_port == id.port
    }
}

/// A live connection to the registry center and the endpoints registered
/// through it.
pub struct ConnectionRecord {
    pub conn: Connection,
    pub endpoints: Vec<EndpointId>,
}

pub struct ServiceRegistry {
    endpoints: RwLock<Vec<EndpointEntry>>,
    connections: RwLock<HashMap<SocketAddr, ConnectionRecord>>,
    retention: Duration,
    eviction_period: Duration,
    log: Logger,
}

impl ServiceRegistry {
    pub fn new(
        conf: &RegistryConfig,
        log: Option<&Logger>,
    ) -> ServiceRegistry {
        ServiceRegistry {
            endpoints: RwLock::new(Vec::new()),
            connections: RwLock::new(HashMap::new()),
            retention: conf.retention,
            eviction_period: conf.eviction_period,
            log: crate::default_logger(log),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Inserts `info`, or updates the endpoint with the same identity. Either
    /// way the stored endpoint ends up Up.
    pub fn add_service_endpoint(&self, info: ServiceEndpoint) {
        let id = info.id();
        let mut endpoints = self.endpoints.write();

        match endpoints.iter_mut().find(|e| e.matches(&id)) {
            Some(entry) => {
                entry.endpoint.additional_meta = info.additional_meta;
                entry.endpoint.service_protoc = info.service_protoc;
                entry.endpoint.additional_meta.remove(LOST_AT_KEY);
                entry.endpoint.set_status(EndpointStatus::Up);
                entry.lost_at = None;
                debug!(self.log, "endpoint refreshed"; "endpoint" => %id);
            }
            None => {
                let mut endpoint = info;
                endpoint.additional_meta.remove(LOST_AT_KEY);
                endpoint.set_status(EndpointStatus::Up);
                endpoints.push(EndpointEntry {
                    endpoint,
                    lost_at: None,
                });
                info!(self.log, "endpoint registered"; "endpoint" => %id);
            }
        }
    }

    /// Every endpoint of `service_name`, whatever its status.
    pub fn find_by_name(&self, service_name: &str) -> Vec<ServiceEndpoint> {
        self.endpoints
            .read()
            .iter()
            .filter(|e| e.endpoint.service_name == service_name)
            .map(|e| e.endpoint.clone())
            .collect()
    }

    pub fn endpoints(&self) -> Vec<ServiceEndpoint> {
        self.endpoints
            .read()
            .iter()
            .map(|e| e.endpoint.clone())
            .collect()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn mark_down(&self, id: &EndpointId) -> bool {
        self.mark_down_at(id, Instant::now())
    }

    /// Marks the endpoint Down as of `now`. An endpoint already Down keeps
    /// its original lost-at time.
    pub fn mark_down_at(&self, id: &EndpointId, now: Instant) -> bool {
        let mut endpoints = self.endpoints.write();
        let entry = match endpoints.iter_mut().find(|e| e.matches(id)) {
            Some(entry) => entry,
            None => return false,
        };

        if entry.lost_at.is_none() {
            entry.lost_at = Some(now);
            entry.endpoint.additional_meta.insert(
                LOST_AT_KEY.to_string(),
                Value::from(Utc::now().to_rfc3339()),
            );
        }
        entry.endpoint.set_status(EndpointStatus::Down);
        info!(self.log, "endpoint down"; "endpoint" => %id);
        true
    }

    /// Removes every Down endpoint lost for longer than the retention window
    /// as of `now`, and returns how many were removed.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let retention = self.retention;
        let mut endpoints = self.endpoints.write();
        let before = endpoints.len();

        endpoints.retain_mut(|entry| match entry.lost_at {
            Some(lost) if now.saturating_duration_since(lost) > retention => {
                info!(self.log, "endpoint evicted";
                    "endpoint" => %entry.endpoint.id());
                false
            }
            Some(_) => {
                entry.endpoint.set_status(EndpointStatus::Down);
                true
            }
            None => true,
        });

        before - endpoints.len()
    }

    /// Runs [`evict_expired`](Self::evict_expired) every eviction period for
    /// as long as the registry is alive.
    pub fn spawn_eviction(self: &Arc<Self>) -> JoinHandle<()> {
        let registry: Weak<ServiceRegistry> = Arc::downgrade(self);
        let period = self.eviction_period;

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => {
                        registry.evict_expired(Instant::now());
                    }
                    None => break,
                }
            }
        })
    }

    /// Tracks `conn`. A record already created by [`bind_endpoint`] for the
    /// same address is kept with its endpoints.
    ///
    /// [`bind_endpoint`]: ServiceRegistry::bind_endpoint
    pub fn add_connection(&self, conn: Connection) {
        let addr = conn.remote_addr();
        debug!(self.log, "connection added"; "remote" => %addr);
        self.connections
            .write()
            .entry(addr)
            .or_insert_with(|| ConnectionRecord {
                conn,
                endpoints: Vec::new(),
            });
    }

    /// Records that `id` was registered through `conn`. An endpoint is owned
    /// by one connection at a time: the latest registration takes it over,
    /// so only the closing of that connection marks it Down.
    pub fn bind_endpoint(&self, conn: &Connection, id: EndpointId) {
        let addr = conn.remote_addr();
        let mut connections = self.connections.write();
        for (other, record) in connections.iter_mut() {
            if *other != addr {
                record.endpoints.retain(|owned| *owned != id);
            }
        }

        let record =
            connections.entry(addr).or_insert_with(|| ConnectionRecord {
                conn: conn.clone(),
                endpoints: Vec::new(),
            });
        if !record.endpoints.contains(&id) {
            record.endpoints.push(id);
        }
    }

    pub fn remove_connection(
        &self,
        addr: &SocketAddr,
    ) -> Option<ConnectionRecord> {
        self.connections.write().remove(addr)
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.connections
            .read()
            .values()
            .map(|record| record.conn.clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Drops the record of a closed connection, marks the endpoints it
    /// registered Down and tells every other connection about it.
    pub fn connection_closed(&self, conn: &Connection) {
        let addr = conn.remote_addr();
        if let Some(record) = self.remove_connection(&addr) {
            for id in record.endpoints.iter() {
                self.mark_down(id);
            }
        }

        let notice = format!("{} disconnected", addr);
        self.broadcast(&RpcMessage::json(CONNECT_CLOSED, notice), Some(addr));
    }

    /// Queues `msg` on every connection except `except`. Connections whose
    /// queue is full or closed are skipped.
    pub fn broadcast(&self, msg: &RpcMessage, except: Option<SocketAddr>) {
        for conn in self.connections() {
            if Some(conn.remote_addr()) == except {
                continue;
            }
            if let Err(e) = conn.try_send(msg.clone()) {
                warn!(self.log, "failed to broadcast";
                    "command" => &msg.command,
                    "remote" => %conn.remote_addr(),
                    "err" => %e);
            }
        }
    }

    /// The payload of the introspection endpoint.
    pub fn snapshot_json(&self) -> Value {
        let endpoints = self.endpoints();
        if endpoints.is_empty() {
            json!({"msg": "no data", "code": NO_DATA_CODE})
        } else {
            json!({"msg": "success", "data": endpoints, "code": 0})
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use futures::future::{self, FutureExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::connection::{self, Dispatch};

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(&RegistryConfig::default(), None)
    }

    fn arith(port: u16) -> ServiceEndpoint {
        ServiceEndpoint::new("Arith", "127.0.0.1", port, "json")
    }

    #[test]
    fn register_payload_shape() {
        let body = r#"{"service_name":"Arith","service_host":"0.0.0.0",
            "service_port":3302,"service_protoc":"prc",
            "additional_meta":null}"#;
        let info: ServiceEndpoint = serde_json::from_str(body).unwrap();
        assert_eq!(info.service_name, "Arith");
        assert_eq!(info.service_port, 3302);
        assert!(info.additional_meta.is_empty());

        let value = serde_json::to_value(&info).unwrap();
        for key in &[
            "service_name",
            "service_host",
            "service_port",
            "service_protoc",
            "additional_meta",
        ] {
            assert!(value.get(*key).is_some(), "missing {}", key);
        }
    }

    #[test]
    fn upsert_is_idempotent_and_last_metadata_wins() {
        let registry = registry();

        let mut first = arith(3302);
        first.additional_meta.insert("zone".into(), json!("a"));
        registry.add_service_endpoint(first);

        assert!(registry.mark_down(&arith(3302).id()));

        let mut second = arith(3302);
        second.service_protoc = String::from("grpc");
        second.additional_meta.insert("zone".into(), json!("b"));
        registry.add_service_endpoint(second);

        let found = registry.find_by_name("Arith");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].service_protoc, "grpc");
        assert_eq!(found[0].additional_meta["zone"], json!("b"));
        assert_eq!(found[0].status(), Some(EndpointStatus::Up));
        assert!(found[0].lost_at().is_none());
    }

    #[test]
    fn find_by_name_ignores_status_and_other_services() {
        let registry = registry();
        registry.add_service_endpoint(arith(3302));
        registry.add_service_endpoint(arith(3303));
        registry.add_service_endpoint(ServiceEndpoint::new(
            "Echo", "127.0.0.1", 4000, "json",
        ));
        registry.mark_down(&arith(3303).id());

        assert_eq!(registry.find_by_name("Arith").len(), 2);
        assert_eq!(registry.find_by_name("Echo").len(), 1);
        assert!(registry.find_by_name("Nope").is_empty());
    }

    #[test]
    fn down_endpoint_is_evicted_after_retention() {
        let registry = registry();
        let retention = registry.retention();
        let epsilon = Duration::from_millis(10);
        registry.add_service_endpoint(arith(3302));

        let lost = Instant::now();
        assert!(registry.mark_down_at(&arith(3302).id(), lost));
        assert!(registry.find_by_name("Arith")[0].lost_at().is_some());

        assert_eq!(registry.evict_expired(lost + retention - epsilon), 0);
        let found = registry.find_by_name("Arith");
        assert_eq!(found.len(), 1);
        assert!(found[0].is_down());

        assert_eq!(registry.evict_expired(lost + retention + epsilon), 1);
        assert!(registry.find_by_name("Arith").is_empty());
    }

    #[test]
    fn up_endpoints_are_never_evicted() {
        let registry = registry();
        registry.add_service_endpoint(arith(3302));
        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(registry.evict_expired(later), 0);
        assert_eq!(registry.endpoint_count(), 1);
    }

    #[test]
    fn mark_down_of_unknown_endpoint() {
        let registry = registry();
        assert!(!registry.mark_down(&arith(1).id()));
    }

    #[test]
    fn snapshot_payloads() {
        let registry = registry();
        let empty = registry.snapshot_json();
        assert_eq!(empty["msg"], json!("no data"));
        assert_eq!(empty["code"], json!(NO_DATA_CODE));

        registry.add_service_endpoint(arith(3302));
        let full = registry.snapshot_json();
        assert_eq!(full["code"], json!(0));
        assert_eq!(full["data"][0]["service_name"], json!("Arith"));
    }

    async fn open_connection() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (ours, theirs) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        let dispatch: Dispatch =
            Arc::new(|_conn, _msg| future::ready(()).boxed());
        let conn = connection::start(
            ours.unwrap(),
            None,
            dispatch,
            None,
            &crate::default_logger(None),
        )
        .unwrap();
        (conn, theirs.unwrap().0)
    }

    #[tokio::test]
    async fn reregistration_moves_endpoint_to_new_connection() {
        let registry = registry();
        let (first, _first_peer) = open_connection().await;
        let (second, _second_peer) = open_connection().await;
        registry.add_connection(first.clone());
        registry.add_connection(second.clone());

        registry.add_service_endpoint(arith(3302));
        registry.bind_endpoint(&first, arith(3302).id());
        registry.add_service_endpoint(arith(3302));
        registry.bind_endpoint(&second, arith(3302).id());

        registry.connection_closed(&first);
        let found = registry.find_by_name("Arith");
        assert_eq!(found[0].status(), Some(EndpointStatus::Up));
        assert!(found[0].lost_at().is_none());

        registry.connection_closed(&second);
        assert!(registry.find_by_name("Arith")[0].is_down());
    }

    #[tokio::test]
    async fn binding_before_tracking_is_kept() {
        let registry = registry();
        let (conn, _peer) = open_connection().await;

        registry.add_service_endpoint(arith(3302));
        registry.bind_endpoint(&conn, arith(3302).id());
        registry.add_connection(conn.clone());
        assert_eq!(registry.connection_count(), 1);

        registry.connection_closed(&conn);
        assert_eq!(registry.connection_count(), 0);
        assert!(registry.find_by_name("Arith")[0].is_down());
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_task_follows_the_clock() {
        let registry = Arc::new(registry());
        let task = registry.spawn_eviction();
        registry.add_service_endpoint(arith(3302));
        registry.mark_down(&arith(3302).id());

        time::sleep(Duration::from_secs(29)).await;
        assert_eq!(registry.endpoint_count(), 1);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.endpoint_count(), 0);

        drop(registry);
        task.await.unwrap();
    }
}
