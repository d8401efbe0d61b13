//! TypedRegistry - Handler の登録と管理
//!
//! Built once at startup, then shared read-only (`Arc<TypedRegistry>`) by
//! every worker.

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::Task;
use crate::domain::TaskKind;
use crate::ports::KindFilter;

#[derive(Default)]
pub struct TypedRegistry {
    handlers: HashMap<TaskKind, Arc<dyn DynHandler>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for kind '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("invalid kind '{0}'")]
    InvalidKind(String),
}

impl TypedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_dyn(Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    /// Register an already type-erased handler under its own `kind()`.
    pub fn register_dyn(&mut self, handler: Arc<dyn DynHandler>) -> Result<(), RegistryError> {
        let kind = TaskKind::new(handler.kind());
        if !kind.is_valid() {
            return Err(RegistryError::InvalidKind(kind.to_string()));
        }
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::AlreadyRegistered(kind.to_string()));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: &TaskKind) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &TaskKind) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Workers only lease what they can handle.
    pub fn kind_filter(&self) -> KindFilter {
        KindFilter::only(self.kinds())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandlerError, Outcome};
    use crate::typed::TaskContext;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Task for Ping {
        const KIND: &'static str = "test.ping";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Pong {
        n: u32,
    }

    impl Task for Pong {
        const KIND: &'static str = "test.pong";
    }

    struct Noop;

    #[async_trait]
    impl Handler<Ping> for Noop {
        async fn handle(&self, _ctx: TaskContext, _task: Ping) -> Result<Outcome, HandlerError> {
            Ok(Outcome::success())
        }
    }

    #[async_trait]
    impl Handler<Pong> for Noop {
        async fn handle(&self, _ctx: TaskContext, _task: Pong) -> Result<Outcome, HandlerError> {
            Ok(Outcome::success())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct BadKind;

    impl Task for BadKind {
        const KIND: &'static str = "has space";
    }

    #[async_trait]
    impl Handler<BadKind> for Noop {
        async fn handle(&self, _ctx: TaskContext, _task: BadKind) -> Result<Outcome, HandlerError> {
            Ok(Outcome::success())
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = TypedRegistry::new();
        registry.register::<Ping, _>(Noop).unwrap();

        assert!(registry.get(&Ping::kind()).is_some());
        assert!(registry.get(&Pong::kind()).is_none());
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = TypedRegistry::new();
        registry.register::<Ping, _>(Noop).unwrap();
        let result = registry.register::<Ping, _>(Noop);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(k)) if k == "test.ping"));
    }

    #[test]
    fn invalid_kind_is_rejected() {
        let mut registry = TypedRegistry::new();
        assert!(matches!(
            registry.register::<BadKind, _>(Noop),
            Err(RegistryError::InvalidKind(_))
        ));
    }

    #[test]
    fn kinds_are_sorted_and_filterable() {
        let mut registry = TypedRegistry::new();
        registry.register::<Pong, _>(Noop).unwrap();
        registry.register::<Ping, _>(Noop).unwrap();

        assert_eq!(registry.kinds(), vec![Ping::kind(), Pong::kind()]);
        let filter = registry.kind_filter();
        assert!(filter.matches(&Ping::kind()));
        assert!(!filter.matches(&TaskKind::new("other")));
    }
}
