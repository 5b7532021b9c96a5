// Copyright 2020 Joyent, Inc.

//! Server side of a connection: one command table shared by every accepted
//! connection, plus the registry center's built-in commands.

use std::future::Future;
use std::io;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use slog::{debug, error, info, warn, Logger};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::command::CommandTable;
use crate::connection::{self, Connection, Dispatch, OnClose};
use crate::protocol::{RpcMessage, ALIVE, DEFAULT, DISCOVER, OK, REGISTER};
use crate::registry::{ServiceEndpoint, ServiceRegistry};

/// Body of the reply to a command nobody handles.
pub const UNKNOWN_COMMAND: &str = "error: unknown command";

/// Handler invoked with the connection a message arrived on and the message.
pub type ServerHandler =
    dyn Fn(Connection, RpcMessage) -> BoxFuture<'static, ()> + Send + Sync;

#[derive(Clone)]
pub struct Server {
    commands: Arc<CommandTable<ServerHandler>>,
    registry: Option<Arc<ServiceRegistry>>,
    log: Logger,
}

impl Server {
    /// A server answering `ALIVE` and replying to unknown commands with an
    /// error text.
    pub fn new(log: Option<&Logger>) -> Server {
        let server = Server {
            commands: Arc::new(CommandTable::new()),
            registry: None,
            log: crate::default_logger(log),
        };
        server.set_command(ALIVE, alive_handler);
        server.set_command(DEFAULT, default_handler);
        server
    }

    /// A server that also handles `REGISTER` and `DISCOVER` against
    /// `registry` and tracks its connections there.
    pub fn registry_center(
        registry: Arc<ServiceRegistry>,
        log: Option<&Logger>,
    ) -> Server {
        let mut server = Server::new(log);

        let register_registry = Arc::clone(&registry);
        server.set_command(REGISTER, move |conn, msg| {
            register_handler(Arc::clone(&register_registry), conn, msg)
        });

        let discover_registry = Arc::clone(&registry);
        server.set_command(DISCOVER, move |conn, msg| {
            discover_handler(Arc::clone(&discover_registry), conn, msg)
        });

        server.registry = Some(registry);
        server
    }

    pub fn registry(&self) -> Option<&Arc<ServiceRegistry>> {
        self.registry.as_ref()
    }

    pub fn commands(&self) -> &CommandTable<ServerHandler> {
        &self.commands
    }

    pub fn set_command<C, F, Fut>(&self, command: C, handler: F)
    where
        C: Into<String>,
        F: Fn(Connection, RpcMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Arc<ServerHandler> =
            Arc::new(move |conn, msg| handler(conn, msg).boxed());
        self.commands.set(command, handler);
    }

    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }

    /// Accepts connections until the listener fails permanently. Accept
    /// errors are logged and the loop continues.
    pub async fn serve(&self, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(self.log, "listening for rpc requests"; "address" => addr);
        }

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    if let Err(e) = self.accept_connection(stream) {
                        warn!(self.log, "failed to start connection";
                            "err" => %e);
                    }
                }
                Err(e) => {
                    error!(self.log, "failed to accept socket"; "err" => %e);
                }
            }
        }
    }

    /// Starts a connection engine for an accepted stream.
    pub fn accept_connection(&self, stream: TcpStream) -> io::Result<Connection> {
        let table = Arc::clone(&self.commands);
        let dispatch: Dispatch = Arc::new(move |conn, msg| {
            match table.get_or_default(&msg.command) {
                Some(handler) => handler(conn, msg),
                None => future::ready(()).boxed(),
            }
        });

        let on_close: Option<OnClose> = self.registry.as_ref().map(|registry| {
            let registry = Arc::clone(registry);
            let hook: OnClose = Box::new(move |conn: &Connection| {
                registry.connection_closed(conn)
            });
            hook
        });

        let conn = connection::start(stream, None, dispatch, on_close, &self.log)?;
        debug!(conn.logger(), "connection accepted");
        if let Some(registry) = &self.registry {
            registry.add_connection(conn.clone());
            if conn.is_closed() {
                registry.remove_connection(&conn.remote_addr());
            }
        }
        Ok(conn)
    }
}

async fn reply(conn: Connection, msg: RpcMessage) {
    let command = msg.command.clone();
    if let Err(e) = conn.send(msg).await {
        warn!(conn.logger(), "failed to queue reply";
            "command" => command, "err" => %e);
    }
}

async fn alive_handler(conn: Connection, msg: RpcMessage) {
    reply(conn, msg.with_body(OK)).await
}

async fn default_handler(conn: Connection, msg: RpcMessage) {
    debug!(conn.logger(), "unknown command"; "command" => &msg.command);
    reply(conn, msg.with_body(UNKNOWN_COMMAND)).await
}

async fn register_handler(
    registry: Arc<ServiceRegistry>,
    conn: Connection,
    msg: RpcMessage,
) {
    let info: ServiceEndpoint = match serde_json::from_slice(&msg.body) {
        Ok(info) => info,
        Err(e) => {
            warn!(conn.logger(), "dropping malformed registration";
                "err" => %e,
                "body" => String::from_utf8_lossy(&msg.body).into_owned());
            return;
        }
    };

    let id = info.id();
    registry.add_service_endpoint(info);
    registry.bind_endpoint(&conn, id);
    reply(conn, msg.with_body(OK)).await
}

async fn discover_handler(
    registry: Arc<ServiceRegistry>,
    conn: Connection,
    msg: RpcMessage,
) {
    let service_name = String::from_utf8_lossy(&msg.body).into_owned();
    let endpoints = registry.find_by_name(&service_name);
    match serde_json::to_vec(&endpoints) {
        Ok(body) => reply(conn, msg.with_body(body)).await,
        Err(e) => {
            error!(conn.logger(), "failed to encode endpoints";
                "service" => service_name, "err" => %e);
        }
    }
}
