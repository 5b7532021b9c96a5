// Copyright 2020 Joyent, Inc.

//! Concurrency-safe mapping from command names to handlers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::protocol::DEFAULT;

/// One table per client and per server. `H` is the handler type, e.g.
/// `dyn Fn(RpcMessage) + Send + Sync`.
pub struct CommandTable<H: ?Sized> {
    handlers: RwLock<HashMap<String, Arc<H>>>,
}

impl<H: ?Sized> CommandTable<H> {
    pub fn new() -> Self {
        CommandTable {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Installs `handler` under `command`, replacing any previous one.
    pub fn set<C: Into<String>>(&self, command: C, handler: Arc<H>) {
        self.handlers.write().insert(command.into(), handler);
    }

    pub fn get(&self, command: &str) -> Option<Arc<H>> {
        self.handlers.read().get(command).cloned()
    }

    /// The handler for `command`, or the `DEFAULT` handler when none is set.
    pub fn get_or_default(&self, command: &str) -> Option<Arc<H>> {
        let handlers = self.handlers.read();
        handlers
            .get(command)
            .or_else(|| handlers.get(DEFAULT))
            .cloned()
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.read().contains_key(command)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl<H: ?Sized> Default for CommandTable<H> {
    fn default() -> Self {
        CommandTable::new()
    }
}
