// Copyright 2020 Joyent, Inc.

use std::io;

use thiserror::Error;

/// Failures surfaced to callers of the client and router APIs.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("service {0} not found")]
    ServiceNotFound(String),

    #[error("service {0} has no provider")]
    NoProvider(String),

    #[error("connection closed before a reply arrived")]
    Closed,

    /// Another call on the same command replaced this call's reply slot.
    #[error("reply slot for command {0} was taken by a newer call")]
    Superseded(String),

    #[error("timed out waiting for a reply")]
    Timeout,

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reasons a service object is refused by a method registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("no service name for type {0}")]
    NoServiceName(String),

    #[error("{0} has no exported methods of suitable type")]
    NoSuitableMethods(String),
}

/// Failures while executing one method call. The display text of these is
/// what travels back to the caller as the reply body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("error: unknown protocol {0}")]
    UnknownProtocol(String),

    #[error("error: unknown method {0}")]
    UnknownMethod(String),

    #[error("{0}")]
    Codec(String),

    #[error("error: method {0} panicked: {1}")]
    Panicked(String, String),
}
