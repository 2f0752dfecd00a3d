use std::{collections::HashMap, sync::Arc};

use ahash::{HashMap as AHashMap, HashMapExt};
use async_trait::async_trait;
use parking_lot::Mutex;
use proto::proto::{Command, CommandResponse, CommandType};

use crate::idempotency::IdempotencyCache;

/// A handler is a pure function of (command) -> response; handlers that need
/// to touch the data-plane adapter do so internally but MUST return promptly
/// — `DISCONNECT` in particular schedules any teardown after building its
/// response rather than blocking on it.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command) -> CommandResponse;
}

fn unhandled(command: &Command) -> CommandResponse {
    CommandResponse {
        command_id: command.command_id.clone(),
        success: false,
        message: format!("no handler registered for command type {}", command.r#type),
        result: HashMap::new(),
    }
}

/// Dispatch table consulted on every inbound `Command`. Wraps dispatch with
/// the bounded idempotency cache so a replayed `command_id` never re-runs
/// the handler.
pub struct HandlerRegistry {
    handlers: Mutex<AHashMap<i32, Arc<dyn CommandHandler>>>,
    cache: IdempotencyCache,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: Mutex::new(AHashMap::new()), cache: IdempotencyCache::default() }
    }

    pub fn register(&self, kind: CommandType, handler: Arc<dyn CommandHandler>) {
        self.handlers.lock().insert(kind as i32, handler);
    }

    pub async fn dispatch(&self, command: Command) -> CommandResponse {
        if let Some(cached) = self.cache.get(&command.command_id) {
            log::debug!("command_id={} replayed, returning cached response", command.command_id);
            return cached;
        }

        let handler = self.handlers.lock().get(&command.r#type).cloned();
        let response = match handler {
            Some(h) => h.handle(&command).await,
            None => unhandled(&command),
        };

        self.cache.record(command.command_id.clone(), response.clone());
        response
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
