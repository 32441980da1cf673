//! Outbox handler trait and registry
//!
//! Each outbox kind has exactly one handler. The executor looks the handler up
//! by the row's kind after the row has been claimed.

use async_trait::async_trait;
use fileflow_core::models::{OutboxKind, OutboxMessage};
use fileflow_core::AppResult;
use std::collections::HashMap;
use std::sync::Arc;

/// Performs the downstream action an outbox row stands for.
///
/// Delivery is at-least-once: a handler may see the same row again after a
/// crash between its side effect and the PROCESSED write.
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    fn kind(&self) -> OutboxKind;

    async fn handle(&self, message: &OutboxMessage) -> AppResult<()>;
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OutboxKind, Arc<dyn OutboxHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under its kind, replacing any earlier one.
    pub fn register(mut self, handler: Arc<dyn OutboxHandler>) -> Self {
        self.handlers.insert(handler.kind(), handler);
        self
    }

    pub fn get(&self, kind: OutboxKind) -> Option<Arc<dyn OutboxHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<OutboxKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|k| k.to_string());
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(OutboxKind);

    #[async_trait]
    impl OutboxHandler for Named {
        fn kind(&self) -> OutboxKind {
            self.0
        }

        async fn handle(&self, _message: &OutboxMessage) -> AppResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_looks_up_by_kind() {
        let registry = HandlerRegistry::new()
            .register(Arc::new(Named(OutboxKind::Pipeline)))
            .register(Arc::new(Named(OutboxKind::Webhook)));

        assert!(registry.get(OutboxKind::Pipeline).is_some());
        assert!(registry.get(OutboxKind::Webhook).is_some());
        assert!(registry.get(OutboxKind::Download).is_none());
        assert_eq!(
            registry.kinds(),
            vec![OutboxKind::Pipeline, OutboxKind::Webhook]
        );
    }
}
