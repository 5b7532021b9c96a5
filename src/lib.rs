// Copyright 2020 Joyent, Inc.

//! Evolving RPC: a small framed RPC protocol with a service registry
//!
//! Peers exchange messages over a long-lived TCP connection. A message names
//! a command, which selects the handler on the receiving side, and carries a
//! protocol tag that selects the codec used for its body. Replies reuse the
//! command of the request they answer.
//!
//! Protocol definition
//!
//! Messages have the following structure:
//!
//! * VERSION   1-byte integer.  The only supported value is "1".
//!
//! * CRC1...CRC4        4-byte big-endian unsigned integer representing the CRC16
//!                     value of the body
//!
//! * CLEN1...CLEN2      2-byte big-endian unsigned integer, the number of bytes
//!                    of the command
//!
//! * PLEN1...PLEN2      2-byte big-endian unsigned integer, the number of bytes
//!                    of the protocol tag
//!
//! * DLEN1...DLEN4      4-byte big-endian unsigned integer representing the number
//!                    of bytes of body that follow
//!
//! * COMMAND, PROTOC, BODY   The command and protocol tag as UTF-8, followed by
//!                    the body bytes.
//!
//! Built-in commands: `ALIVE` is the heartbeat, `REGISTER` and `DISCOVER`
//! talk to a registry center, `CONNECT_CLOSED` is a registry notice that a
//! peer went away, and `DEFAULT` is the handler used when a command has none
//! of its own.

#![allow(missing_docs)]

use slog::{o, Drain, Logger};

pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod distributed;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod rpc_server;
pub mod server;
pub mod service;

pub use crate::client::{Client, ReplyFuture};
pub use crate::distributed::{route, DistributedClient};
pub use crate::error::{DispatchError, RegisterError, RpcError};
pub use crate::protocol::RpcMessage;
pub use crate::registry::{ServiceEndpoint, ServiceRegistry};
pub use crate::rpc_server::{DistributedServer, RpcServer};
pub use crate::server::Server;
pub use crate::service::{MethodRegistry, MethodSet, RpcService};

/// Clones `log`, or builds a logger over the `log` crate when none is given.
pub(crate) fn default_logger(log: Option<&Logger>) -> Logger {
    log.cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
}
