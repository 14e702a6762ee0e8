// SPDX-License-Identifier: MIT OR Apache-2.0
//! The target registry: what this agent binary can run.
//!
//! Targets are registered programmatically at binary build time; the same
//! registry instance serves the manager (declaration, lookup) and the
//! worker child (execution), since workers are re-execs of the same binary.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value as Json};
use weft_core::{Data, Parameter, Target, TargetError, TargetType};

/// User code behind one target.
pub trait TargetHandler: Send + Sync {
    /// Run the target with materialised arguments.
    fn run(&self, arguments: Vec<Data>) -> Result<Data, TargetError>;
}

impl<F> TargetHandler for F
where
    F: Fn(Vec<Data>) -> Result<Data, TargetError> + Send + Sync,
{
    fn run(&self, arguments: Vec<Data>) -> Result<Data, TargetError> {
        self(arguments)
    }
}

/// A declared target together with its handler.
#[derive(Clone)]
pub struct RegisteredTarget {
    /// Declared metadata.
    pub definition: Target,
    /// The user function.
    pub handler: Arc<dyn TargetHandler>,
}

/// Targets grouped by repository and name.
#[derive(Clone, Default)]
pub struct Registry {
    repositories: BTreeMap<String, BTreeMap<String, RegisteredTarget>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target under `repository`/`name`. Replaces any previous
    /// registration with the same name.
    pub fn register(
        mut self,
        repository: impl Into<String>,
        name: impl Into<String>,
        definition: Target,
        handler: impl TargetHandler + 'static,
    ) -> Self {
        self.repositories
            .entry(repository.into())
            .or_default()
            .insert(
                name.into(),
                RegisteredTarget {
                    definition,
                    handler: Arc::new(handler),
                },
            );
        self
    }

    /// Shorthand for registering a workflow with required parameters.
    pub fn workflow(
        self,
        repository: impl Into<String>,
        name: impl Into<String>,
        parameters: &[&str],
        handler: impl TargetHandler + 'static,
    ) -> Self {
        let definition = Target::new(
            TargetType::Workflow,
            parameters.iter().map(|p| Parameter::required(*p)).collect(),
        );
        self.register(repository, name, definition, handler)
    }

    /// Shorthand for registering a task with required parameters.
    pub fn task(
        self,
        repository: impl Into<String>,
        name: impl Into<String>,
        parameters: &[&str],
        handler: impl TargetHandler + 'static,
    ) -> Self {
        let definition = Target::new(
            TargetType::Task,
            parameters.iter().map(|p| Parameter::required(*p)).collect(),
        );
        self.register(repository, name, definition, handler)
    }

    /// Shorthand for registering a sensor with required parameters.
    pub fn sensor(
        self,
        repository: impl Into<String>,
        name: impl Into<String>,
        parameters: &[&str],
        handler: impl TargetHandler + 'static,
    ) -> Self {
        let definition = Target::new(
            TargetType::Sensor,
            parameters.iter().map(|p| Parameter::required(*p)).collect(),
        );
        self.register(repository, name, definition, handler)
    }

    /// Look up a target.
    pub fn get(&self, repository: &str, name: &str) -> Option<&RegisteredTarget> {
        self.repositories.get(repository)?.get(name)
    }

    /// Returns `true` when the target exists.
    pub fn contains(&self, repository: &str, name: &str) -> bool {
        self.get(repository, name).is_some()
    }

    /// The declaration payload for `declare_targets`: full definitions per
    /// repository and name.
    pub fn manifest(&self) -> Json {
        let mut repositories = serde_json::Map::new();
        for (repository, targets) in &self.repositories {
            let mut declared = serde_json::Map::new();
            for (name, target) in targets {
                declared.insert(name.clone(), json!(target.definition));
            }
            repositories.insert(repository.clone(), Json::Object(declared));
        }
        Json::Object(repositories)
    }

    /// Validate call arity against a target's declared parameters.
    ///
    /// Surplus arguments are rejected; missing ones are only allowed when
    /// the parameter declares a default.
    pub fn check_arguments(definition: &Target, supplied: usize) -> Result<(), TargetError> {
        let declared = definition.parameters.len();
        if supplied > declared {
            return Err(TargetError::failure(
                "invalid_arguments",
                format!("expected at most {declared} arguments, got {supplied}"),
            ));
        }
        if let Some(missing) = definition.parameters.get(supplied..) {
            for parameter in missing {
                if parameter.default.is_none() {
                    return Err(TargetError::failure(
                        "invalid_arguments",
                        format!("missing required argument '{}'", parameter.name),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new().workflow("repo", "add", &["a", "b"], |arguments: Vec<Data>| {
            let (Data::Int(a), Data::Int(b)) = (&arguments[0], &arguments[1]) else {
                return Err(TargetError::message("expected two integers"));
            };
            Ok(Data::Int(a + b))
        })
    }

    #[test]
    fn lookup_and_run() {
        let registry = registry();
        let target = registry.get("repo", "add").unwrap();
        assert_eq!(target.definition.target_type, TargetType::Workflow);
        let result = target.handler.run(vec![Data::Int(1), Data::Int(2)]).unwrap();
        assert_eq!(result, Data::Int(3));
        assert!(!registry.contains("repo", "subtract"));
    }

    #[test]
    fn manifest_declares_definitions() {
        let manifest = registry().manifest();
        assert_eq!(manifest["repo"]["add"]["type"], "workflow");
        assert_eq!(
            manifest["repo"]["add"]["parameters"][0]["name"],
            json!("a")
        );
    }

    #[test]
    fn arity_checks() {
        let mut definition = Target::new(
            TargetType::Task,
            vec![
                Parameter::required("a"),
                Parameter::optional("b", "None"),
            ],
        );
        assert!(Registry::check_arguments(&definition, 1).is_ok());
        assert!(Registry::check_arguments(&definition, 2).is_ok());
        assert!(Registry::check_arguments(&definition, 3).is_err());
        assert!(Registry::check_arguments(&definition, 0).is_err());

        definition.parameters[0].default = Some("0".into());
        assert!(Registry::check_arguments(&definition, 0).is_ok());
    }
}
