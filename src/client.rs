// Copyright 2020 Joyent, Inc.

//! Client side of a connection: a command table of reply callbacks on top
//! of a connection engine with heartbeats.

use std::future::Future;
use std::io;
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use slog::{debug, info, trace, Logger};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::command::CommandTable;
use crate::config::ClientConfig;
use crate::connection::{self, Connection, Dispatch};
use crate::error::RpcError;
use crate::protocol::{
    RpcMessage, ALIVE, CONNECT_CLOSED, DEFAULT, DISCOVER, REGISTER,
};
use crate::registry::ServiceEndpoint;

/// Handler invoked with an inbound message on a client connection.
pub type ClientHandler = dyn Fn(RpcMessage) + Send + Sync;

pub struct Client {
    conn: Connection,
    commands: Arc<CommandTable<ClientHandler>>,
    sync_calls: tokio::sync::Mutex<()>,
    log: Logger,
}

impl Client {
    /// Connects to `conf.addr()` and starts the engine with heartbeats every
    /// `conf.heartbeat_interval`.
    pub async fn connect(
        conf: &ClientConfig,
        log: Option<&Logger>,
    ) -> io::Result<Client> {
        let log = crate::default_logger(log);
        let stream = TcpStream::connect(conf.addr()).await?;
        let client =
            Client::from_stream(stream, Some(conf.heartbeat_interval), &log)?;
        info!(log, "connected"; "address" => conf.addr());
        Ok(client)
    }

    pub fn from_stream(
        stream: TcpStream,
        heartbeat: Option<Duration>,
        log: &Logger,
    ) -> io::Result<Client> {
        let commands: Arc<CommandTable<ClientHandler>> =
            Arc::new(CommandTable::new());
        install_builtin_commands(&commands, log);

        let table = Arc::clone(&commands);
        let dispatch: Dispatch = Arc::new(move |_conn, msg| {
            if let Some(handler) = table.get_or_default(&msg.command) {
                handler(msg);
            }
            future::ready(()).boxed()
        });
        let conn = connection::start(stream, heartbeat, dispatch, None, log)?;

        Ok(Client {
            log: conn.logger().clone(),
            conn,
            commands,
            sync_calls: tokio::sync::Mutex::new(()),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn set_command<C, F>(&self, command: C, handler: F)
    where
        C: Into<String>,
        F: Fn(RpcMessage) + Send + Sync + 'static,
    {
        self.commands.set(command, Arc::new(handler));
    }

    /// Installs `callback` for replies on `msg.command` and queues `msg`.
    /// Waits while the outbound queue is full.
    pub async fn execute<F>(
        &self,
        msg: RpcMessage,
        callback: F,
    ) -> io::Result<()>
    where
        F: Fn(RpcMessage) + Send + Sync + 'static,
    {
        self.commands.set(msg.command.clone(), Arc::new(callback));
        self.conn.send(msg).await
    }

    /// Queues `msg` without touching the command table.
    pub async fn send(&self, msg: RpcMessage) -> io::Result<()> {
        self.conn.send(msg).await
    }

    /// Sends `msg` and returns a future for the next reply on its command.
    ///
    /// Replies are matched by command name only. A later call on the same
    /// command replaces this call's slot, and this call then resolves to
    /// [`RpcError::Superseded`]. Closing the connection resolves it to
    /// [`RpcError::Closed`].
    pub async fn call(&self, msg: RpcMessage) -> io::Result<ReplyFuture> {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let command = msg.command.clone();

        self.execute(msg, move |reply| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(reply);
            }
        })
        .await?;

        let conn = self.conn.clone();
        Ok(ReplyFuture {
            command,
            rx,
            closed: async move { conn.closed().await }.boxed(),
            conn: self.conn.clone(),
        })
    }

    /// Sends `body` as a `json` message on `command`.
    ///
    /// Synchronous calls wait for the reply and return its body; they are
    /// serialized per client so they do not steal each other's replies.
    /// Asynchronous calls return `None` as soon as the message is queued and
    /// the reply, if any, is not observed.
    pub async fn execute_command<B: Into<Bytes>>(
        &self,
        command: &str,
        body: B,
        synchronous: bool,
    ) -> Result<Option<Bytes>, RpcError> {
        let msg = RpcMessage::json(command, body);
        if synchronous {
            let _guard = self.sync_calls.lock().await;
            let reply = self.call(msg).await?.await?;
            Ok(Some(reply.body))
        } else {
            self.send(msg).await?;
            Ok(None)
        }
    }

    /// Upserts `info` on the registry center at the other end.
    pub async fn register_service<F>(
        &self,
        info: &ServiceEndpoint,
        callback: F,
    ) -> io::Result<()>
    where
        F: Fn(RpcMessage) + Send + Sync + 'static,
    {
        let body = serde_json::to_vec(info)?;
        self.execute(RpcMessage::json(REGISTER, body), callback).await
    }

    /// Asks the registry center at the other end for the endpoints of
    /// `service_name`; the reply body is a JSON array.
    pub async fn discover<F>(
        &self,
        service_name: &str,
        callback: F,
    ) -> io::Result<()>
    where
        F: Fn(RpcMessage) + Send + Sync + 'static,
    {
        if service_name.is_empty() {
            let msg = "service name must not be empty";
            return Err(Error::new(ErrorKind::InvalidInput, msg));
        }
        let msg = RpcMessage::json(DISCOVER, service_name.to_string());
        self.execute(msg, callback).await
    }

    pub fn close(&self) {
        debug!(self.log, "closing client");
        self.conn.close();
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }
}

fn install_builtin_commands(
    commands: &CommandTable<ClientHandler>,
    log: &Logger,
) {
    let default_log = log.clone();
    commands.set(
        DEFAULT,
        Arc::new(move |msg: RpcMessage| {
            info!(default_log, "unhandled message";
                "command" => msg.command,
                "body" => String::from_utf8_lossy(&msg.body).into_owned());
        }),
    );

    let alive_log = log.clone();
    commands.set(
        ALIVE,
        Arc::new(move |msg: RpcMessage| {
            trace!(alive_log, "heartbeat acknowledged";
                "body" => String::from_utf8_lossy(&msg.body).into_owned());
        }),
    );

    let closed_log = log.clone();
    commands.set(
        CONNECT_CLOSED,
        Arc::new(move |msg: RpcMessage| {
            info!(closed_log, "peer disconnected";
                "notice" => String::from_utf8_lossy(&msg.body).into_owned());
        }),
    );
}

/// The reply to one [`Client::call`].
pub struct ReplyFuture {
    command: String,
    rx: oneshot::Receiver<RpcMessage>,
    closed: BoxFuture<'static, ()>,
    conn: Connection,
}

impl ReplyFuture {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Waits at most `limit` for the reply.
    pub async fn timeout(
        self,
        limit: Duration,
    ) -> Result<RpcMessage, RpcError> {
        match tokio::time::timeout(limit, self).await {
            Ok(reply) => reply,
            Err(_) => Err(RpcError::Timeout),
        }
    }
}

impl Future for ReplyFuture {
    type Output = Result<RpcMessage, RpcError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(Ok(reply)),
            Poll::Ready(Err(_)) if self.conn.is_closed() => {
                Poll::Ready(Err(RpcError::Closed))
            }
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(RpcError::Superseded(self.command.clone())))
            }
            Poll::Pending => match self.closed.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Err(RpcError::Closed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
