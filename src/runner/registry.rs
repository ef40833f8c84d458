//! Step registry.
//!
//! Maps stable string keys to step implementations. Registration happens
//! at startup and validates names immediately; resolving an unknown name
//! at run time is a fatal configuration error, never a retryable one.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::ConfigError;
use crate::runner::step::{Step, StepRef};

/// Registry of available steps.
pub struct StepRegistry {
    steps: RwLock<HashMap<String, Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            steps: RwLock::new(HashMap::new()),
        }
    }

    /// Register a step under `name`. Rejects empty and duplicate names.
    pub async fn register(&self, name: &str, step: Step) -> Result<(), ConfigError> {
        if name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "step name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        let mut steps = self.steps.write().await;
        if steps.contains_key(name) {
            return Err(ConfigError::DuplicateStep {
                name: name.to_string(),
            });
        }
        steps.insert(name.to_string(), step);
        tracing::debug!("Registered step: {}", name);
        Ok(())
    }

    /// Get a step by name.
    pub async fn get(&self, name: &str) -> Option<Step> {
        self.steps.read().await.get(name).cloned()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.steps.read().await.contains_key(name)
    }

    /// List all registered step names.
    pub async fn list(&self) -> Vec<String> {
        self.steps.read().await.keys().cloned().collect()
    }

    /// Resolve an ordered list of step references into `(name, step)`
    /// pairs. The first unresolvable name aborts the whole resolution.
    pub async fn resolve(&self, refs: &[StepRef]) -> Result<Vec<(String, Step)>, ConfigError> {
        let steps = self.steps.read().await;
        let mut resolved = Vec::with_capacity(refs.len());
        for step_ref in refs {
            match step_ref {
                StepRef::Named(name) => {
                    let step = steps.get(name).cloned().ok_or_else(|| {
                        ConfigError::UnknownStep { name: name.clone() }
                    })?;
                    resolved.push((name.clone(), step));
                }
                StepRef::Inline { name, step } => {
                    resolved.push((name.clone(), step.clone()));
                }
            }
        }
        Ok(resolved)
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::context::ExecutionContext;
    use crate::runner::step::{from_fn, Params, StepResult};
    use futures::future::BoxFuture;
    use serde_json::Value;

    fn noop_step<'a>(
        _ctx: &'a ExecutionContext,
        _step_id: u32,
        _params: &'a mut Params,
    ) -> BoxFuture<'a, StepResult> {
        Box::pin(async { Ok(Value::Null) })
    }

    fn noop() -> Step {
        from_fn(noop_step)
    }

    #[tokio::test]
    async fn register_and_get() {
        let registry = StepRegistry::new();
        registry.register("mul", noop()).await.unwrap();
        assert!(registry.has("mul").await);
        assert!(registry.get("mul").await.is_some());
        assert!(registry.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn rejects_duplicate_names() {
        let registry = StepRegistry::new();
        registry.register("mul", noop()).await.unwrap();
        let err = registry.register("mul", noop()).await.unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStep { name } if name == "mul"));
    }

    #[tokio::test]
    async fn rejects_empty_name() {
        let registry = StepRegistry::new();
        assert!(registry.register("  ", noop()).await.is_err());
    }

    #[tokio::test]
    async fn resolve_mixes_named_and_inline() {
        let registry = StepRegistry::new();
        registry.register("mul", noop()).await.unwrap();

        let refs = vec![
            StepRef::Named("mul".to_string()),
            StepRef::Inline {
                name: "local".to_string(),
                step: noop(),
            },
        ];
        let resolved = registry.resolve(&refs).await.unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].0, "mul");
        assert_eq!(resolved[1].0, "local");
    }

    #[tokio::test]
    async fn resolve_unknown_name_is_config_error() {
        let registry = StepRegistry::new();
        let refs = vec![StepRef::Named("no_such_step".to_string())];
        let err = match registry.resolve(&refs).await {
            Ok(_) => panic!("expected resolve to fail for unknown step"),
            Err(e) => e,
        };
        assert!(matches!(err, ConfigError::UnknownStep { name } if name == "no_such_step"));
    }
}
