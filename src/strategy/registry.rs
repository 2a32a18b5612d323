//! Strategy Registry
//!
//! Maps handler names to strategy factories. Every `acquire` builds a fresh
//! instance; keeping an instance alive across cycles is the host's business.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};

use super::{ExecutionStrategy, LiteralStrategy, ProgramRegistry, ScriptStrategy};

// ─────────────────────────────────────────────────────────────────
// Strategy Kind
// ─────────────────────────────────────────────────────────────────

/// Built-in strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// Publishes constant values
    Literal,
    /// Runs a compiled-in program under the cooperative runtime
    Script,
}

impl StrategyKind {
    pub fn all() -> &'static [StrategyKind] {
        &[StrategyKind::Literal, StrategyKind::Script]
    }

    /// Handler name
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Literal => "literal",
            StrategyKind::Script => "script",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ─────────────────────────────────────────────────────────────────
// Strategy Factory
// ─────────────────────────────────────────────────────────────────

/// Builds strategy instances for one handler
pub type StrategyFactory = Arc<dyn Fn() -> Arc<dyn ExecutionStrategy> + Send + Sync>;

/// Factories for the built-in strategies
pub struct BuiltinFactory;

impl BuiltinFactory {
    pub fn create(kind: StrategyKind, programs: Arc<ProgramRegistry>) -> StrategyFactory {
        match kind {
            StrategyKind::Literal => Arc::new(|| Arc::new(LiteralStrategy::new())),
            StrategyKind::Script => {
                Arc::new(move || Arc::new(ScriptStrategy::new(programs.clone())))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Strategy Registry
// ─────────────────────────────────────────────────────────────────

pub struct StrategyRegistry {
    factories: RwLock<HashMap<String, StrategyFactory>>,
}

impl StrategyRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry with every built-in strategy
    pub fn with_builtins(programs: Arc<ProgramRegistry>) -> Self {
        let registry = Self::new();
        for kind in StrategyKind::all() {
            registry.register(kind.name(), BuiltinFactory::create(*kind, programs.clone()));
        }
        registry
    }

    /// Register (or replace) the factory for `handler`
    pub fn register(&self, handler: impl Into<String>, factory: StrategyFactory) {
        let handler = handler.into();
        tracing::info!(handler = %handler, "Strategy registered");
        self.factories.write().insert(handler, factory);
    }

    /// Build a fresh strategy for `handler`
    pub fn acquire(&self, handler: &str) -> Result<Arc<dyn ExecutionStrategy>> {
        let factory = self
            .factories
            .read()
            .get(handler)
            .cloned()
            .ok_or_else(|| Error::UnknownHandler {
                handler: handler.to_string(),
            })?;
        Ok(factory())
    }

    /// Registered handler names, sorted
    pub fn registered_handlers(&self) -> Vec<String> {
        let mut handlers: Vec<String> = self.factories.read().keys().cloned().collect();
        handlers.sort();
        handlers
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
