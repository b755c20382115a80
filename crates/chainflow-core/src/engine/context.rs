//! Execution context with step output tracking and size limits.
//!
//! `ExecutionContext` is the mutable state that flows through a chain
//! execution. It stores step outputs keyed by alias, the trigger payload,
//! and the entities created so far, with size limits to prevent unbounded
//! growth of the persisted context blob.

use std::collections::HashMap;

use chainflow_types::chain::{ChainEntityMapping, ChainExecution};
use serde_json::{Value, json};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum size of a single step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Maximum total size of all context data (10 MB).
pub const MAX_CONTEXT_SIZE: usize = 10_485_760;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from context mutation.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("total context size ({actual} bytes) exceeds maximum ({max} bytes)")]
    TooLarge { actual: usize, max: usize },

    #[error("failed to serialize step output: {0}")]
    Serialize(String),
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable state that accumulates across a chain execution.
///
/// Step outputs are keyed by step alias. The context round-trips through the
/// execution's persisted JSON blob so a resumed execution sees everything its
/// earlier steps produced.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Step outputs keyed by step alias.
    pub step_outputs: HashMap<String, Value>,
    /// Payload of the triggering domain event.
    pub trigger_payload: Option<Value>,
    /// Entities created by completed steps, in creation order.
    pub entities: Vec<ChainEntityMapping>,
    /// Chain name (for expression context and logging).
    pub chain_name: String,
    /// Owning execution id.
    pub execution_id: Uuid,
    /// Owning family (tenant) id.
    pub family_id: Uuid,
}

impl ExecutionContext {
    /// Create an empty context for a fresh execution.
    pub fn new(
        chain_name: impl Into<String>,
        execution_id: Uuid,
        family_id: Uuid,
        trigger_payload: Option<Value>,
    ) -> Self {
        Self {
            step_outputs: HashMap::new(),
            trigger_payload,
            entities: Vec::new(),
            chain_name: chain_name.into(),
            execution_id,
            family_id,
        }
    }

    /// Rebuild the context from a persisted execution and its entity
    /// mappings. The execution's context blob is the `{ alias: output }`
    /// object written by [`to_context_value`].
    ///
    /// [`to_context_value`]: ExecutionContext::to_context_value
    pub fn from_execution(
        execution: &ChainExecution,
        chain_name: &str,
        entities: Vec<ChainEntityMapping>,
    ) -> Self {
        let step_outputs = execution
            .context
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(alias, output)| (alias.clone(), output.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            step_outputs,
            trigger_payload: execution.trigger_payload.clone(),
            entities,
            chain_name: chain_name.to_string(),
            execution_id: execution.id,
            family_id: execution.family_id,
        }
    }

    /// Store the output of a completed step.
    ///
    /// Enforces `MAX_STEP_OUTPUT_SIZE` (1 MB) per output. An oversized
    /// output is replaced with a truncation marker rather than failing the
    /// step. Also enforces `MAX_CONTEXT_SIZE` (10 MB) total, which is a
    /// hard error.
    pub fn set_step_output(&mut self, alias: &str, output: Value) -> Result<(), ContextError> {
        let serialized =
            serde_json::to_string(&output).map_err(|e| ContextError::Serialize(e.to_string()))?;

        if serialized.len() > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                alias,
                size = serialized.len(),
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            let truncated = json!({
                "_truncated": true,
                "_original_size": serialized.len(),
                "_message": format!(
                    "output exceeded {} byte limit and was truncated",
                    MAX_STEP_OUTPUT_SIZE
                )
            });
            self.step_outputs.insert(alias.to_string(), truncated);
        } else {
            self.step_outputs.insert(alias.to_string(), output);
        }

        let total = self.total_size();
        if total > MAX_CONTEXT_SIZE {
            return Err(ContextError::TooLarge {
                actual: total,
                max: MAX_CONTEXT_SIZE,
            });
        }

        Ok(())
    }

    /// Get the output of a completed step.
    pub fn get_step_output(&self, alias: &str) -> Option<&Value> {
        self.step_outputs.get(alias)
    }

    /// Record entities created by a completed step.
    pub fn record_entities(&mut self, mappings: impl IntoIterator<Item = ChainEntityMapping>) {
        self.entities.extend(mappings);
    }

    /// Compute the total serialized size of all context data in bytes.
    pub fn total_size(&self) -> usize {
        let outputs_size: usize = self
            .step_outputs
            .values()
            .map(|v| serde_json::to_string(v).map(|s| s.len()).unwrap_or(0))
            .sum();
        let trigger_size = self
            .trigger_payload
            .as_ref()
            .and_then(|v| serde_json::to_string(v).ok())
            .map(|s| s.len())
            .unwrap_or(0);
        outputs_size + trigger_size
    }

    /// Serialize the step outputs to the `{ alias: output }` JSON object
    /// persisted on the execution row.
    pub fn to_context_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (alias, output) in &self.step_outputs {
            map.insert(alias.clone(), output.clone());
        }
        Value::Object(map)
    }

    /// Build the JSON object that JEXL expressions evaluate against.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "steps": { "<alias>": { "output": <value> }, ... },
    ///   "trigger": <trigger_payload or {}>,
    ///   "entities": { "<alias>": [ { "entity_type": .., "entity_id": .., "module": .. } ] },
    ///   "chain": { "name": "...", "execution_id": "...", "family_id": "..." }
    /// }
    /// ```
    pub fn to_expression_context(&self) -> Value {
        let mut steps = serde_json::Map::new();
        for (alias, output) in &self.step_outputs {
            steps.insert(alias.clone(), json!({ "output": output }));
        }

        let mut entities: serde_json::Map<String, Value> = serde_json::Map::new();
        for mapping in &self.entities {
            let entry = entities
                .entry(mapping.step_alias.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(list) = entry {
                list.push(json!({
                    "entity_type": mapping.entity_type,
                    "entity_id": mapping.entity_id.to_string(),
                    "module": mapping.module,
                }));
            }
        }

        json!({
            "steps": steps,
            "trigger": self.trigger_payload.clone().unwrap_or(json!({})),
            "entities": entities,
            "chain": {
                "name": self.chain_name,
                "execution_id": self.execution_id.to_string(),
                "family_id": self.family_id.to_string(),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chainflow_types::chain::ChainDefinition;
    use serde_json::json;

    fn test_context() -> ExecutionContext {
        ExecutionContext::new(
            "member-onboarding",
            Uuid::now_v7(),
            Uuid::now_v7(),
            Some(json!({ "member_id": "m-1", "name": "Alice" })),
        )
    }

    #[test]
    fn test_set_and_get_step_output() {
        let mut ctx = test_context();
        ctx.set_step_output("create-calendar", json!({ "calendar_id": "c-1" }))
            .unwrap();

        assert_eq!(
            ctx.get_step_output("create-calendar"),
            Some(&json!({ "calendar_id": "c-1" }))
        );
        assert_eq!(ctx.get_step_output("missing"), None);
    }

    #[test]
    fn test_oversized_output_truncates() {
        let mut ctx = test_context();
        let large = "x".repeat(MAX_STEP_OUTPUT_SIZE + 100);
        ctx.set_step_output("big", json!(large)).unwrap();

        let output = ctx.get_step_output("big").unwrap();
        assert_eq!(output["_truncated"], json!(true));
    }

    #[test]
    fn test_expression_context_shape() {
        let mut ctx = test_context();
        ctx.set_step_output("create-calendar", json!({ "calendar_id": "c-1" }))
            .unwrap();
        let entity_id = Uuid::now_v7();
        ctx.record_entities([ChainEntityMapping::new(
            ctx.execution_id,
            "create-calendar",
            "calendar_entry",
            entity_id,
            "calendar",
        )]);

        let expr_ctx = ctx.to_expression_context();
        assert_eq!(
            expr_ctx["steps"]["create-calendar"]["output"]["calendar_id"],
            json!("c-1")
        );
        assert_eq!(expr_ctx["trigger"]["member_id"], json!("m-1"));
        assert_eq!(
            expr_ctx["entities"]["create-calendar"][0]["entity_type"],
            json!("calendar_entry")
        );
        assert_eq!(expr_ctx["chain"]["name"], json!("member-onboarding"));
    }

    #[test]
    fn test_round_trip_through_execution_blob() {
        let def = ChainDefinition::new("wf", Uuid::now_v7(), "member_joined", "profiles");
        let mut execution =
            ChainExecution::new(&def, Uuid::now_v7(), Some(json!({ "member_id": "m-1" })));

        let mut ctx = ExecutionContext::from_execution(&execution, &def.name, Vec::new());
        ctx.set_step_output("step-a", json!(42)).unwrap();
        execution.context = ctx.to_context_value();

        let restored = ExecutionContext::from_execution(&execution, &def.name, Vec::new());
        assert_eq!(restored.get_step_output("step-a"), Some(&json!(42)));
        assert_eq!(
            restored.trigger_payload,
            Some(json!({ "member_id": "m-1" }))
        );
    }

    #[test]
    fn test_total_size_small_for_empty() {
        let ctx = test_context();
        assert!(ctx.total_size() < 1000);
    }
}
