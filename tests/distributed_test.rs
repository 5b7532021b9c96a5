// Copyright 2020 Joyent, Inc.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio::time::{sleep, Instant};

use evolving_rpc::config::{
    ClientConfig, DistributedClientConfig, RegistryConfig,
};
use evolving_rpc::connection::Connection;
use evolving_rpc::protocol::{RpcMessage, DISCOVER};
use evolving_rpc::rpc_server::DistributedServer;
use evolving_rpc::service::{MethodSet, RpcService};
use evolving_rpc::{
    route, DistributedClient, RpcError, Server, ServiceEndpoint,
    ServiceRegistry,
};

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Args {
    a: i64,
    b: i64,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reply {
    pro: i64,
}

struct Arith {
    port: u16,
}

impl RpcService for Arith {
    fn register_methods(methods: &mut MethodSet<Self>) {
        methods.add_method("Multiply", |_: &Arith, args: Args| Reply {
            pro: args.a * args.b,
        });
        methods.add_method("Whoami", |arith: &Arith, _: ()| arith.port);
    }
}

fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        std::sync::Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!(),
    )
}

async fn start_center(log: &Logger) -> (Arc<ServiceRegistry>, SocketAddr) {
    let registry =
        Arc::new(ServiceRegistry::new(&RegistryConfig::default(), Some(log)));
    let server = Server::registry_center(Arc::clone(&registry), Some(log));
    let listener = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { server.serve(listener).await });
    (registry, addr)
}

/// A registry center whose `DISCOVER` replies cannot be parsed.
async fn start_broken_center(log: &Logger) -> SocketAddr {
    let server = Server::new(Some(log));
    server.set_command(DISCOVER, |conn: Connection, msg: RpcMessage| async move {
        let _ = conn.send(msg.with_body("garbage")).await;
    });
    let listener = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { server.serve(listener).await });
    addr
}

/// An address nothing listens on.
async fn dead_addr() -> SocketAddr {
    let listener = Server::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn start_arith(
    center: SocketAddr,
    registry: &ServiceRegistry,
    log: &Logger,
) -> u16 {
    let listener = Server::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let endpoint = ServiceEndpoint::new("Arith", "127.0.0.1", 0, "json");
    let registry_conf = ClientConfig::new("127.0.0.1", center.port());
    let mut server = DistributedServer::new(endpoint, registry_conf, Some(log));
    server.register(Arith { port }).unwrap();
    tokio::spawn(async move { server.serve(listener).await });

    let deadline = Instant::now() + Duration::from_secs(5);
    while !registry
        .find_by_name("Arith")
        .iter()
        .any(|e| e.service_port == port)
    {
        assert!(Instant::now() < deadline, "Arith never registered");
        sleep(Duration::from_millis(10)).await;
    }
    port
}

fn client_config(registries: &[SocketAddr]) -> DistributedClientConfig {
    DistributedClientConfig {
        registries: registries
            .iter()
            .map(|addr| ClientConfig::new("127.0.0.1", addr.port()))
            .collect(),
        dependencies: vec![String::from("Arith"), String::from("Ghost")],
        discover_timeout: Duration::from_secs(2),
        ..DistributedClientConfig::default()
    }
}

async fn multiply(client: &DistributedClient, a: i64, b: i64) -> i64 {
    let args = serde_json::to_vec(&Args { a, b }).unwrap();
    let body = client
        .execute_command("Arith", "Arith.Multiply", args, true)
        .await
        .unwrap()
        .unwrap();
    serde_json::from_slice::<Reply>(&body).unwrap().pro
}

#[tokio::test]
async fn unreachable_registry_is_skipped() {
    let log = test_logger();
    let (registry, center) = start_center(&log).await;
    start_arith(center, &registry, &log).await;

    let conf = client_config(&[dead_addr().await, center]);
    let client = DistributedClient::connect(conf, Some(&log)).await.unwrap();
    assert_eq!(client.registry_count(), 1);
    assert_eq!(client.pool_size("Arith"), Some(1));
    assert_eq!(multiply(&client, 6, 7).await, 42);
    client.close();
}

#[tokio::test]
async fn unparseable_discovery_fails_over() {
    let log = test_logger();
    let broken = start_broken_center(&log).await;
    let (registry, center) = start_center(&log).await;
    start_arith(center, &registry, &log).await;

    let conf = client_config(&[broken, center]);
    let client = DistributedClient::connect(conf, Some(&log)).await.unwrap();
    assert_eq!(client.registry_count(), 2);
    assert_eq!(client.pool_size("Arith"), Some(1));
    assert_eq!(multiply(&client, 3, 5).await, 15);
}

#[tokio::test]
async fn no_reachable_registry_is_an_error() {
    let log = test_logger();
    let conf = client_config(&[dead_addr().await]);
    let res = DistributedClient::connect(conf, Some(&log)).await;
    assert!(matches!(res, Err(RpcError::Discovery(_))));
}

#[tokio::test]
async fn routing_errors() {
    let log = test_logger();
    let (_registry, center) = start_center(&log).await;

    let client = DistributedClient::connect(client_config(&[center]), Some(&log))
        .await
        .unwrap();
    assert_eq!(client.pool_size("Ghost"), Some(0));
    assert_eq!(client.pool_size("Unknown"), None);

    let ghost = client.execute_command("Ghost", "Ghost.Boo", "{}", true).await;
    assert!(matches!(ghost, Err(RpcError::NoProvider(_))));

    let unknown = client
        .execute_command("Unknown", "Unknown.Call", "{}", true)
        .await;
    assert!(matches!(unknown, Err(RpcError::ServiceNotFound(_))));
}

#[tokio::test]
async fn calls_are_routed_by_command() {
    let log = test_logger();
    let (registry, center) = start_center(&log).await;
    let mut ports = Vec::new();
    for _ in 0..3 {
        ports.push(start_arith(center, &registry, &log).await);
    }

    let client = DistributedClient::connect(client_config(&[center]), Some(&log))
        .await
        .unwrap();
    assert_eq!(client.pool_size("Arith"), Some(3));

    let addrs = client.pool_addrs("Arith").unwrap();
    let expected = addrs[route("Arith.Whoami", addrs.len())].port();
    assert!(ports.contains(&expected));

    for _ in 0..10 {
        let body = client
            .execute_command("Arith", "Arith.Whoami", "", true)
            .await
            .unwrap()
            .unwrap();
        let port: u16 = serde_json::from_slice(&body).unwrap();
        assert_eq!(port, expected);
    }
}

#[tokio::test]
async fn rediscover_drops_closed_providers() {
    let log = test_logger();
    let (registry, center) = start_center(&log).await;
    start_arith(center, &registry, &log).await;

    let client = DistributedClient::connect(client_config(&[center]), Some(&log))
        .await
        .unwrap();
    assert_eq!(client.pool_size("Arith"), Some(1));

    let endpoint = registry.find_by_name("Arith").remove(0);
    registry.mark_down(&endpoint.id());
    client.rediscover().await;
    assert_eq!(client.pool_size("Arith"), Some(0));
}
