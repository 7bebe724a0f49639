//! Command dispatch.
//!
//! Decoded JSON messages route by their `type` string to registered
//! handlers. A missing handler is a logged dispatch miss, never a channel
//! fault; a handler error is contained the same way. Handlers run on the
//! link task and must return promptly — long work belongs on the bus and
//! a subscriber's own executor.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum HandlerError {
    /// Payload did not deserialize to the expected shape.
    Malformed(String),
    /// Handler ran and refused the message.
    Failed(String),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Malformed(s) => write!(f, "malformed payload: {}", s),
            HandlerError::Failed(s) => write!(f, "handler failed: {}", s),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Anything that can take a decoded message payload.
pub trait CommandHandler: Send {
    fn handle(&mut self, payload: &Value) -> Result<(), HandlerError>;
}

impl<F> CommandHandler for F
where
    F: FnMut(&Value) -> Result<(), HandlerError> + Send,
{
    fn handle(&mut self, payload: &Value) -> Result<(), HandlerError> {
        self(payload)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Outcome of a dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Handled,
    /// Nothing registered for this type; logged and dropped.
    NoHandler,
}

/// Registry mapping `type` strings to handlers.
pub struct Dispatcher {
    handlers: HashMap<String, Box<dyn CommandHandler>>,
    /// Alternate type strings kept for older firmware: alias → canonical.
    aliases: HashMap<String, String>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher {
            handlers: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    /// Register (or replace) the handler for a message type.
    pub fn register<H>(&mut self, msg_type: &str, handler: H)
    where
        H: CommandHandler + 'static,
    {
        self.handlers.insert(msg_type.to_owned(), Box::new(handler));
    }

    pub fn register_boxed(&mut self, msg_type: &str, handler: Box<dyn CommandHandler>) {
        self.handlers.insert(msg_type.to_owned(), handler);
    }

    /// Route an alternate type string to an already-registered handler.
    /// Older firmware emits a handful of renamed commands; the canonical
    /// handler serves both spellings.
    pub fn add_alias(&mut self, legacy_type: &str, canonical_type: &str) {
        self.aliases
            .insert(legacy_type.to_owned(), canonical_type.to_owned());
    }

    pub fn is_registered(&self, msg_type: &str) -> bool {
        self.handlers.contains_key(msg_type) || self.aliases.contains_key(msg_type)
    }

    /// Invoke the handler for `msg_type` with the full message object.
    pub fn dispatch(&mut self, msg_type: &str, payload: &Value) -> DispatchResult {
        let resolved = self
            .aliases
            .get(msg_type)
            .cloned()
            .unwrap_or_else(|| msg_type.to_owned());

        match self.handlers.get_mut(&resolved) {
            Some(handler) => {
                if let Err(e) = handler.handle(payload) {
                    warn!(msg_type = %resolved, error = %e, "handler rejected message");
                }
                DispatchResult::Handled
            }
            None => {
                debug!(msg_type = %resolved, "dispatch miss: no handler registered");
                DispatchResult::NoHandler
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
