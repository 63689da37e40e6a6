//! Workflow definition validation.
//!
//! Three levels build on each other:
//! - `SchemaOnly`: structural shape (names, targets, counts).
//! - `Basic`: adds circular-dependency detection.
//! - `Full`: adds undefined-reference checks (unless validating a partial
//!   definition) and any registered custom validators.
//!
//! Cycle detection is a depth-first traversal that reports the ordered
//! path including the repeated node, so `A -> B -> C -> A` comes back as a
//! four-element path. Diamond dependencies are not flagged.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::domain::{StepDefinition, WorkflowDefinition};
use crate::error::{EngineError, ValidationFailure};

/// How deep validation goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLevel {
    SchemaOnly,
    Basic,
    Full,
}

/// Outcome of validating a definition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    fn finish(mut self) -> Self {
        self.is_valid = self.issues.is_empty();
        self
    }

    /// Record an issue against the whole definition.
    pub fn push(&mut self, code: &str, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            code: code.to_string(),
            step: None,
            message: message.into(),
        });
    }

    /// Record an issue against a named step.
    pub fn push_step(&mut self, code: &str, step: &str, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            code: code.to_string(),
            step: Some(step.to_string()),
            message: message.into(),
        });
    }
}

/// One problem found during validation.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    /// Machine-readable issue code, e.g. `circular_dependency`.
    pub code: String,

    /// Offending step, when the issue is step-scoped.
    pub step: Option<String>,

    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step {
            Some(step) => write!(f, "[{}] step '{}': {}", self.code, step, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// A caller-supplied semantic check, run in registration order at `Full`.
///
/// An `Err` is caught and reported as a `validator_error` issue instead of
/// propagating.
pub trait CustomValidator: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, definition: &WorkflowDefinition, result: &mut ValidationResult)
        -> anyhow::Result<()>;
}

/// Validates workflow definitions before the engine will run them.
#[derive(Default)]
pub struct WorkflowValidator {
    custom: Vec<Arc<dyn CustomValidator>>,
}

impl WorkflowValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom validator; validators run in registration order.
    pub fn register(&mut self, validator: Arc<dyn CustomValidator>) {
        self.custom.push(validator);
    }

    /// Validate a definition at the given level.
    ///
    /// `partial` skips the undefined-reference check at `Full`, for
    /// definitions still under construction.
    pub fn validate(
        &self,
        definition: &WorkflowDefinition,
        level: ValidationLevel,
        partial: bool,
    ) -> ValidationResult {
        let mut result = ValidationResult::default();

        self.check_schema(definition, &mut result);

        if level == ValidationLevel::SchemaOnly {
            return result.finish();
        }

        self.check_cycles(definition, &mut result);

        if level == ValidationLevel::Basic {
            return result.finish();
        }

        if !partial {
            self.check_references(definition, &mut result);
        }

        for validator in &self.custom {
            if let Err(err) = validator.validate(definition, &mut result) {
                result.push(
                    "validator_error",
                    format!("custom validator '{}' failed: {}", validator.name(), err),
                );
            }
        }

        result.finish()
    }

    /// Validate and raise an aggregated error listing all issues when invalid.
    pub fn validate_strict(
        &self,
        definition: &WorkflowDefinition,
        level: ValidationLevel,
        partial: bool,
    ) -> Result<(), EngineError> {
        let result = self.validate(definition, level, partial);
        if result.is_valid {
            Ok(())
        } else {
            Err(EngineError::Validation(ValidationFailure { result }))
        }
    }

    /// Same check as [`validate`], run off the caller's task.
    pub async fn validate_async(
        self: Arc<Self>,
        definition: WorkflowDefinition,
        level: ValidationLevel,
        partial: bool,
    ) -> ValidationResult {
        tokio::task::spawn_blocking(move || self.validate(&definition, level, partial))
            .await
            .unwrap_or_else(|join_err| {
                let mut result = ValidationResult::default();
                result.push(
                    "validator_error",
                    format!("validation task failed: {}", join_err),
                );
                result.finish()
            })
    }

    // -- level: schema ------------------------------------------------------

    fn check_schema(&self, definition: &WorkflowDefinition, result: &mut ValidationResult) {
        if definition.name.is_empty() {
            result.push("empty_name", "workflow name cannot be empty");
        }

        if definition.steps.is_empty() {
            result.push("no_steps", "workflow must define at least one task");
        }

        if definition.iterations == 0 {
            result.push("invalid_iterations", "iterations must be at least 1");
        }

        if definition.checkpoint_interval == 0 {
            result.push(
                "invalid_checkpoint_interval",
                "checkpoint_interval must be at least 1",
            );
        }

        let mut seen = HashSet::new();
        for step in &definition.steps {
            if step.name.is_empty() {
                result.push("empty_step_name", "step has an empty name");
                continue;
            }
            if !seen.insert(step.name.as_str()) {
                result.push_step("duplicate_step", &step.name, "step name is not unique");
            }
            if step.component.is_empty() {
                result.push_step("empty_component", &step.name, "step names no component");
            }
            if step.operation.is_empty() {
                result.push_step("empty_operation", &step.name, "step names no operation");
            }
            if step.dependencies.iter().any(|d| d == &step.name) {
                result.push_step("self_dependency", &step.name, "step depends on itself");
            }
        }
    }

    // -- level: basic -------------------------------------------------------

    fn check_cycles(&self, definition: &WorkflowDefinition, result: &mut ValidationResult) {
        let steps: HashMap<&str, &StepDefinition> = definition
            .steps
            .iter()
            .map(|s| (s.name.as_str(), s))
            .collect();

        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: HashMap<&str, Color> =
            steps.keys().map(|&name| (name, Color::White)).collect();
        let mut path: Vec<&str> = Vec::new();

        // One cycle report per offending back-edge; DFS in declaration order
        // keeps the reported path deterministic.
        fn visit<'a>(
            name: &'a str,
            steps: &HashMap<&'a str, &'a StepDefinition>,
            colors: &mut HashMap<&'a str, Color>,
            path: &mut Vec<&'a str>,
            result: &mut ValidationResult,
        ) {
            colors.insert(name, Color::Gray);
            path.push(name);

            if let Some(step) = steps.get(name) {
                for dep in &step.dependencies {
                    match colors.get(dep.as_str()) {
                        Some(Color::Gray) => {
                            // Back-edge: report the ordered path including
                            // the repeated node.
                            let start = path.iter().position(|&n| n == dep.as_str()).unwrap_or(0);
                            let mut cycle: Vec<&str> = path[start..].to_vec();
                            cycle.push(dep.as_str());
                            result.push_step(
                                "circular_dependency",
                                name,
                                format!("dependency cycle: {}", cycle.join(" -> ")),
                            );
                        }
                        Some(Color::White) => {
                            visit(dep.as_str(), steps, colors, path, result);
                        }
                        // Black nodes are finished subtrees (diamonds), and
                        // unknown names are the reference check's concern.
                        _ => {}
                    }
                }
            }

            path.pop();
            colors.insert(name, Color::Black);
        }

        for step in &definition.steps {
            if colors[step.name.as_str()] == Color::White {
                visit(step.name.as_str(), &steps, &mut colors, &mut path, result);
            }
        }
    }

    // -- level: full --------------------------------------------------------

    fn check_references(&self, definition: &WorkflowDefinition, result: &mut ValidationResult) {
        let names: HashSet<&str> = definition.steps.iter().map(|s| s.name.as_str()).collect();

        for step in &definition.steps {
            for dep in &step.dependencies {
                if !names.contains(dep.as_str()) {
                    result.push_step(
                        "undefined_reference",
                        &step.name,
                        format!("depends on undefined step '{}'", dep),
                    );
                }
            }
            for target in step.on_success.iter().chain(step.on_failure.iter()) {
                if !names.contains(target.as_str()) {
                    result.push_step(
                        "undefined_reference",
                        &step.name,
                        format!("routes to undefined step '{}'", target),
                    );
                }
            }
        }
    }
}
