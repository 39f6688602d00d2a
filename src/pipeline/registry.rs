//! Reconstruct operators from their serialized form.

use crate::error::{PipelineError, Result};
use crate::pipeline::chain::Pipeline;
use crate::pipeline::operator::{Operator, OperatorConfig};
use crate::pipeline::operators;
use std::collections::HashMap;

/// Builds an operator from its configuration. The registry is passed along
/// so operators wrapping sub-pipelines can build those too.
pub type OperatorFactory = fn(&OperatorConfig, &OperatorRegistry) -> Result<Box<dyn Operator>>;

#[derive(Clone, Default)]
pub struct OperatorRegistry {
    factories: HashMap<String, OperatorFactory>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every serializable built-in operator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("pipeline", |config, registry| {
            let configs: Vec<OperatorConfig> = config.args()?;
            Ok(Box::new(registry.build_pipeline(&configs)?))
        });
        registry.register("generate", |c, _| Ok(Box::new(c.args::<operators::Generate>()?)));
        registry.register("where", |c, _| Ok(Box::new(c.args::<operators::Where>()?)));
        registry.register("head", |c, _| Ok(Box::new(c.args::<operators::Head>()?)));
        registry.register("discard", |_, _| Ok(Box::new(operators::Discard)));
        registry.register("read_lines", |_, _| Ok(Box::new(operators::ReadLines)));
        registry.register("cache", |c, _| Ok(Box::new(c.args::<operators::Cache>()?)));
        registry.register("parallel", operators::Parallel::from_config);
        registry.register("tcp_listen", operators::TcpListen::from_config);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: OperatorFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn build(&self, config: &OperatorConfig) -> Result<Box<dyn Operator>> {
        let factory = self.factories.get(&config.name).ok_or_else(|| {
            PipelineError::Serialization(format!("unknown operator `{}`", config.name))
        })?;
        factory(config, self)
    }

    pub fn build_pipeline(&self, configs: &[OperatorConfig]) -> Result<Pipeline> {
        let operators = configs
            .iter()
            .map(|config| self.build(config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Pipeline::new(operators))
    }
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("OperatorRegistry").field("operators", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_operator() {
        let registry = OperatorRegistry::with_builtins();
        let err = registry
            .build(&OperatorConfig::new("nope", json!({})))
            .unwrap_err();
        assert_eq!(err.to_string(), "Serialization error: unknown operator `nope`");
    }

    #[test]
    fn test_builtin_round_trip() {
        let registry = OperatorRegistry::with_builtins();
        let configs = vec![
            OperatorConfig::new("generate", json!({"rows": 10, "batch_size": 5})),
            OperatorConfig::new(
                "where",
                json!({"expression": {"compare": {"field": "x", "op": "gt", "value": 3}}}),
            ),
            OperatorConfig::new("head", json!({"limit": 2})),
            OperatorConfig::new("discard", json!({})),
        ];
        let pipeline = registry.build_pipeline(&configs).unwrap();
        assert!(pipeline.is_closed());
        for (op, config) in pipeline.operators().iter().zip(&configs) {
            assert_eq!(op.to_config().unwrap().name, config.name);
        }
    }

    #[test]
    fn test_invalid_arguments() {
        let registry = OperatorRegistry::with_builtins();
        let err = registry
            .build(&OperatorConfig::new("head", json!({"limit": "many"})))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Serialization(_)));
    }
}
