// Copyright 2020 Joyent, Inc.

//! Servers exposing registered service methods: directly on a listener, or
//! additionally announced to a registry center.

use std::io;

use parking_lot::Mutex;
use slog::{info, warn, Logger};
use tokio::net::{TcpListener, ToSocketAddrs};

use crate::client::Client;
use crate::codec::Codec;
use crate::config::ClientConfig;
use crate::error::RegisterError;
use crate::protocol::OK;
use crate::registry::ServiceEndpoint;
use crate::server::Server;
use crate::service::{MethodRegistry, RpcService};

/// A [`Server`] whose commands are the methods of registered services.
pub struct RpcServer {
    server: Server,
    methods: MethodRegistry,
    log: Logger,
}

impl RpcServer {
    pub fn new(log: Option<&Logger>) -> RpcServer {
        let log = crate::default_logger(log);
        RpcServer {
            server: Server::new(Some(&log)),
            methods: MethodRegistry::new(Some(&log)),
            log,
        }
    }

    pub fn register<Svc: RpcService>(
        &mut self,
        service: Svc,
    ) -> Result<(), RegisterError> {
        self.methods.register(service)
    }

    pub fn set_codec<P, C>(&self, protoc: P, codec: C)
    where
        P: Into<String>,
        C: Codec + 'static,
    {
        self.methods.set_codec(protoc, codec);
    }

    pub fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Installs one command per registered method on the underlying server.
    pub fn install(&self) {
        self.methods.install(&self.server);
        info!(self.log, "methods installed";
            "commands" => self.methods.commands().join(","));
    }

    pub async fn serve(&self, listener: TcpListener) {
        self.install();
        self.server.serve(listener).await
    }

    pub async fn run<A: ToSocketAddrs>(&self, addr: A) -> io::Result<()> {
        let listener = Server::bind(addr).await?;
        self.serve(listener).await;
        Ok(())
    }
}

/// An [`RpcServer`] that registers its endpoint with a registry center
/// before serving. The registration connection stays open, with heartbeats,
/// for as long as the server runs; the registry marks the endpoint Down once
/// it closes.
pub struct DistributedServer {
    rpc: RpcServer,
    registry_conf: ClientConfig,
    endpoint: ServiceEndpoint,
    registration: Mutex<Option<Client>>,
    log: Logger,
}

impl DistributedServer {
    pub fn new(
        endpoint: ServiceEndpoint,
        registry_conf: ClientConfig,
        log: Option<&Logger>,
    ) -> DistributedServer {
        let log = crate::default_logger(log)
            .new(slog::o!("service" => endpoint.service_name.clone()));
        DistributedServer {
            rpc: RpcServer::new(Some(&log)),
            registry_conf,
            endpoint,
            registration: Mutex::new(None),
            log,
        }
    }

    pub fn register<Svc: RpcService>(
        &mut self,
        service: Svc,
    ) -> Result<(), RegisterError> {
        self.rpc.register(service)
    }

    pub fn rpc(&self) -> &RpcServer {
        &self.rpc
    }

    pub fn endpoint(&self) -> &ServiceEndpoint {
        &self.endpoint
    }

    /// Binds the endpoint's own address and serves.
    pub async fn start(&self) -> io::Result<()> {
        let addr = format!("0.0.0.0:{}", self.endpoint.service_port);
        let listener = Server::bind(addr).await?;
        self.serve(listener).await
    }

    /// Registers with the registry center, then serves `listener`. When the
    /// endpoint's port is 0 the listener's port is announced instead.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        self.rpc.install();

        let mut endpoint = self.endpoint.clone();
        if endpoint.service_port == 0 {
            endpoint.service_port = listener.local_addr()?.port();
        }

        let client = Client::connect(&self.registry_conf, Some(&self.log)).await?;
        let ack_log = self.log.clone();
        client
            .register_service(&endpoint, move |reply| {
                if reply.body == OK {
                    info!(ack_log, "registered with registry center");
                } else {
                    warn!(ack_log, "unexpected registration reply";
                        "body" => String::from_utf8_lossy(&reply.body).into_owned());
                }
            })
            .await?;
        info!(self.log, "registering endpoint";
            "endpoint" => %endpoint.id(),
            "registry" => self.registry_conf.addr());

        if let Some(old) = self.registration.lock().replace(client) {
            old.close();
        }

        self.rpc.server().serve(listener).await;
        Ok(())
    }

    /// Closes the registration connection.
    pub fn close(&self) {
        if let Some(client) = self.registration.lock().take() {
            client.close();
        }
    }
}
