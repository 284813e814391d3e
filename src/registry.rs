//! Executor registry.
//!
//! A [`NodeRegistry`] holds the executable half of a workflow: named lambda
//! executors referenced by `NodeConfig::Lambda`, plus the optional language
//! services question nodes use to interpret free-form answers. Schemas stay
//! declarative and serializable; the registry is what makes them runnable.
//!
//! # Examples
//!
//! ```rust
//! use graphloom::nodes::Lambda;
//! use graphloom::registry::NodeRegistry;
//! use serde_json::json;
//!
//! let registry = NodeRegistry::new().with_executor(
//!     "double",
//!     Lambda::new(|_, mut input| {
//!         let n = input.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
//!         input.insert("n".into(), json!(n * 2));
//!         Ok(input)
//!     }),
//! );
//! assert!(registry.executor("double").is_some());
//! ```

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::nodes::{AnswerExtractor, IntentDetector, NodeExecutor};

/// Named executors and answer-interpretation services for one workflow app.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    executors: FxHashMap<String, Arc<dyn NodeExecutor>>,
    answer_extractor: Option<Arc<dyn AnswerExtractor>>,
    intent_detector: Option<Arc<dyn IntentDetector>>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lambda executor under the given name.
    #[must_use]
    pub fn with_executor<E>(mut self, name: impl Into<String>, executor: E) -> Self
    where
        E: NodeExecutor + 'static,
    {
        self.executors.insert(name.into(), Arc::new(executor));
        self
    }

    /// Register an already-shared executor under the given name.
    #[must_use]
    pub fn with_executor_arc(
        mut self,
        name: impl Into<String>,
        executor: Arc<dyn NodeExecutor>,
    ) -> Self {
        self.executors.insert(name.into(), executor);
        self
    }

    /// Service that extracts structured fields from free-form answers.
    #[must_use]
    pub fn with_answer_extractor(mut self, extractor: Arc<dyn AnswerExtractor>) -> Self {
        self.answer_extractor = Some(extractor);
        self
    }

    /// Service that matches free-form answers against offered choices.
    #[must_use]
    pub fn with_intent_detector(mut self, detector: Arc<dyn IntentDetector>) -> Self {
        self.intent_detector = Some(detector);
        self
    }

    #[must_use]
    pub fn executor(&self, name: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(name).cloned()
    }

    #[must_use]
    pub fn answer_extractor(&self) -> Option<Arc<dyn AnswerExtractor>> {
        self.answer_extractor.clone()
    }

    #[must_use]
    pub fn intent_detector(&self) -> Option<Arc<dyn IntentDetector>> {
        self.intent_detector.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::Lambda;

    #[test]
    fn lookup_by_name() {
        let registry =
            NodeRegistry::new().with_executor("noop", Lambda::new(|_, input| Ok(input)));
        assert!(registry.executor("noop").is_some());
        assert!(registry.executor("missing").is_none());
        assert!(registry.answer_extractor().is_none());
    }
}
