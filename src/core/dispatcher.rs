// src/core/dispatcher.rs

//! Command Dispatcher: a name-indexed handler registry with ordered
//! middleware, closed over the set of commands this kernel actually serves.
//! `remote.*` names are part of the closed enumeration so a caller can see
//! the full command surface, but they are never registered here — the
//! remote-access manager collaborator owns their implementation, and
//! dispatching one returns `NotFound` the same way an unrecognized name
//! would.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, info_span, Instrument};

use crate::core::errors::PiccoloError;

/// The closed set of command names this dispatcher's surface is defined
/// over, spanning both locally-registered handlers and the collaborator-only
/// `remote.*` names documented for completeness.
pub const KNOWN_COMMANDS: &[&str] = &[
    "persistence.ensure_volume",
    "persistence.attach_volume",
    "persistence.record_lock_state",
    "persistence.run_control_export",
    "persistence.run_full_export",
    "remote.configure_tunnel",
    "remote.renew_certificate",
];

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> Result<Value, PiccoloError>;
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn before(&self, command_name: &str, payload: &Value) -> Result<(), PiccoloError>;
}

pub struct Dispatcher {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            middleware: Vec::new(),
        }
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Registers `handler` under `name`. `name` must be one of
    /// `KNOWN_COMMANDS`, since the dispatcher's surface is closed.
    pub fn register(&mut self, name: &'static str, handler: Arc<dyn CommandHandler>) {
        assert!(
            KNOWN_COMMANDS.contains(&name),
            "attempted to register unknown command '{name}'"
        );
        self.handlers.insert(name, handler);
    }

    pub async fn dispatch(&self, name: &str, payload: Value) -> Result<Value, PiccoloError> {
        let span = info_span!("dispatch", command = name);
        async {
            let handler = self
                .handlers
                .get(name)
                .ok_or_else(|| PiccoloError::NotFound(format!("command '{name}'")))?;

            for mw in &self.middleware {
                mw.before(name, &payload).await?;
            }

            info!("dispatching command");
            handler.handle(payload).await
        }
        .instrument(span)
        .await
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(&self, payload: Value) -> Result<Value, PiccoloError> {
            Ok(payload)
        }
    }

    struct RejectAllMiddleware;

    #[async_trait]
    impl Middleware for RejectAllMiddleware {
        async fn before(&self, _name: &str, _payload: &Value) -> Result<(), PiccoloError> {
            Err(PiccoloError::Locked)
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("persistence.ensure_volume", Arc::new(EchoHandler));
        let result = dispatcher
            .dispatch("persistence.ensure_volume", serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"a": 1}));
    }

    #[tokio::test]
    async fn unregistered_remote_command_is_not_found() {
        let dispatcher = Dispatcher::new();
        assert!(matches!(
            dispatcher.dispatch("remote.configure_tunnel", Value::Null).await,
            Err(PiccoloError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn middleware_runs_before_handler() {
        let mut dispatcher = Dispatcher::new().with_middleware(Arc::new(RejectAllMiddleware));
        dispatcher.register("persistence.ensure_volume", Arc::new(EchoHandler));
        assert!(matches!(
            dispatcher.dispatch("persistence.ensure_volume", Value::Null).await,
            Err(PiccoloError::Locked)
        ));
    }

    #[test]
    #[should_panic(expected = "unknown command")]
    fn registering_unknown_command_panics() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("bogus.command", Arc::new(EchoHandler));
    }
}
