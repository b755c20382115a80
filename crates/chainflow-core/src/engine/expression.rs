//! JEXL expression evaluator for step conditions and input mappings.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms.
//! Conditions evaluate to bool with JavaScript-like truthiness. Input
//! mappings are JSON object templates whose string leaves of the form
//! `{= expr }` are replaced by the evaluation of `expr`; all other values
//! pass through verbatim.
//!
//! **Security note:** Payloads are always passed as context objects, NEVER
//! interpolated into expression strings.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),

    #[error("input mapping is not valid JSON: {0}")]
    InvalidMapping(String),
}

// ---------------------------------------------------------------------------
// ChainEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
///
/// Used for:
/// - Step `condition` guards (e.g. `trigger.role == 'parent'`)
/// - Input mapping templates (e.g. `{"member_id": "{= trigger.member_id }"}`)
pub struct ChainEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ChainEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                Ok(json!(s.split(delimiter).collect::<Vec<_>>()))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("match", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let pattern = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                // Substring match, not regex
                Ok(json!(subject.contains(pattern)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean result.
    ///
    /// The `context` must be a JSON object. Results are coerced to boolean
    /// using JavaScript-like truthiness rules.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        Ok(value_to_bool(&self.evaluate_value(expression, context)?))
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Resolve an input-mapping template against an expression context.
    ///
    /// The mapping string is parsed as JSON. String values consisting
    /// entirely of `{= expr }` are replaced by the raw evaluation of `expr`;
    /// objects and arrays are resolved recursively; everything else passes
    /// through verbatim. A mapping that is a bare `"{= expr }"` string
    /// yields the raw evaluated value, whatever its type.
    pub fn resolve_input_mapping(
        &self,
        mapping: &str,
        context: &Value,
    ) -> Result<Value, ExpressionError> {
        let template: Value = serde_json::from_str(mapping)
            .map_err(|e| ExpressionError::InvalidMapping(e.to_string()))?;
        self.resolve_template(template, context)
    }

    fn resolve_template(&self, template: Value, context: &Value) -> Result<Value, ExpressionError> {
        match template {
            Value::String(s) => match expression_leaf(&s) {
                Some(expr) => self.evaluate_value(expr, context),
                None => Ok(Value::String(s)),
            },
            Value::Object(map) => {
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    resolved.insert(key, self.resolve_template(value, context)?);
                }
                Ok(Value::Object(resolved))
            }
            Value::Array(items) => items
                .into_iter()
                .map(|item| self.resolve_template(item, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other),
        }
    }
}

impl Default for ChainEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// If `s` is entirely an `{= expr }` marker, return the inner expression.
fn expression_leaf(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("{=")?.strip_suffix('}')?;
    Some(inner.trim())
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
