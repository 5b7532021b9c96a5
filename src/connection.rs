// Copyright 2020 Joyent, Inc.

//! The send/receive task pair that owns one framed TCP connection.
//!
//! Every connection, client or server side, is driven by two tasks:
//!
//! * the send loop waits on the outbound queue and, when configured, a
//!   heartbeat timer, and writes exactly one frame per wakeup.
//! * the receive loop reads one frame at a time and hands it to the
//!   dispatcher, awaiting the dispatcher before reading the next frame.
//!
//! Either loop ending marks the connection closed, which stops the other
//! loop and releases the socket. Nothing is retried here: a failed
//! connection has to be recreated by its owner.

use std::any::Any;
use std::io::{Error, ErrorKind};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io};

use futures::future::{self, BoxFuture};
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use slog::{debug, error, o, trace, warn, Logger};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::protocol::{RpcCodec, RpcMessage};

/// Capacity of the outbound queue of every connection.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Receives every inbound message of a connection, on its receive task.
pub type Dispatch =
    Arc<dyn Fn(Connection, RpcMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs once, on the receive task, after the connection is closed.
pub type OnClose = Box<dyn FnOnce(&Connection) + Send>;

type FrameSink = SplitSink<Framed<TcpStream, RpcCodec>, RpcMessage>;
type FrameStream = SplitStream<Framed<TcpStream, RpcCodec>>;

/// Cloneable handle to a running connection engine.
#[derive(Clone)]
pub struct Connection {
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    tx: mpsc::Sender<RpcMessage>,
    closed: CancellationToken,
    log: Logger,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn closed_error() -> Error {
    Error::new(ErrorKind::NotConnected, "connection is closed")
}

impl Connection {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn logger(&self) -> &Logger {
        &self.log
    }

    /// Queues `msg` for the send loop. Waits while the outbound queue is
    /// full.
    pub async fn send(&self, msg: RpcMessage) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.tx.send(msg).await.map_err(|_| closed_error())
    }

    /// Queues `msg` without waiting. A full queue is reported as
    /// `ErrorKind::WouldBlock`.
    pub fn try_send(&self, msg: RpcMessage) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => {
                Error::new(ErrorKind::WouldBlock, "outbound queue is full")
            }
            TrySendError::Closed(_) => closed_error(),
        })
    }

    /// Stops both loops and drops the socket.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed, by either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

/// Starts the engine for `stream`.
///
/// `heartbeat` enables `ALIVE` frames on the given period; `None` or a zero
/// period disables them.
pub fn start(
    stream: TcpStream,
    heartbeat: Option<Duration>,
    dispatch: Dispatch,
    on_close: Option<OnClose>,
    log: &Logger,
) -> io::Result<Connection> {
    let remote_addr = stream.peer_addr()?;
    let local_addr = stream.local_addr()?;
    let log = log.new(o!("remote" => remote_addr.to_string()));

    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let conn = Connection {
        remote_addr,
        local_addr,
        tx,
        closed: CancellationToken::new(),
        log: log.clone(),
    };

    let (sink, frames) = Framed::new(stream, RpcCodec).split();
    let heartbeat = heartbeat.filter(|period| *period > Duration::from_secs(0));

    tokio::spawn(send_loop(conn.closed.clone(), sink, rx, heartbeat, log));
    tokio::spawn(recv_loop(conn.clone(), frames, dispatch, on_close));

    Ok(conn)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

async fn send_loop(
    closed: CancellationToken,
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<RpcMessage>,
    heartbeat: Option<Duration>,
    log: Logger,
) {
    let mut ticker = heartbeat.map(|period| {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let msg = tokio::select! {
            _ = closed.cancelled() => break,
            _ = next_tick(&mut ticker) => {
                trace!(log, "sending heartbeat");
                RpcMessage::alive()
            }
            queued = rx.recv() => match queued {
                Some(msg) => msg,
                None => break,
            },
        };

        let command = msg.command.clone();
        if let Err(e) = sink.send(msg).await {
            error!(log, "failed to write message";
                "command" => command, "err" => %e);
            break;
        }
    }

    closed.cancel();
    rx.close();
    if let Err(e) = sink.close().await {
        debug!(log, "error shutting down connection"; "err" => %e);
    }
}

async fn recv_loop(
    conn: Connection,
    mut frames: FrameStream,
    dispatch: Dispatch,
    on_close: Option<OnClose>,
) {
    loop {
        let frame = tokio::select! {
            _ = conn.closed.cancelled() => break,
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(msg)) => {
                let command = msg.command.clone();
                let handled = AssertUnwindSafe(async {
                    dispatch(conn.clone(), msg).await
                })
                .catch_unwind()
                .await;
                if let Err(panic) = handled {
                    error!(conn.log, "command handler panicked";
                        "command" => command,
                        "panic" => panic_message(panic.as_ref()));
                }
            }
            Some(Err(e)) => {
                warn!(conn.log, "failed to read message"; "err" => %e);
                break;
            }
            None => {
                debug!(conn.log, "connection closed by peer");
                break;
            }
        }
    }

    conn.closed.cancel();
    if let Some(on_close) = on_close {
        on_close(&conn);
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        String::from(*s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}
