//! `add`: sum two numbers.

use async_trait::async_trait;
use agentchain_core::error::ToolError;
use agentchain_core::tool::Tool;
use serde_json::Value;

use crate::number_value;

pub struct AddTool;

#[async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "Add two numbers"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "x": { "type": "number" },
                "y": { "type": "number" }
            },
            "required": ["x", "y"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let x = operand(&arguments, "x")?;
        let y = operand(&arguments, "y")?;

        // Integer inputs keep an integer result unless the sum overflows.
        if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
            if let Some(sum) = a.checked_add(b) {
                return Ok(Value::from(sum));
            }
        }

        let (a, b) = (as_f64(x)?, as_f64(y)?);
        number_value(self.name(), a + b)
    }
}

fn operand<'a>(arguments: &'a Value, key: &str) -> Result<&'a Value, ToolError> {
    match arguments.get(key) {
        Some(v) if v.is_number() => Ok(v),
        Some(other) => Err(ToolError::InvalidArguments(format!(
            "'{key}' must be a number, got {other}"
        ))),
        None => Err(ToolError::InvalidArguments(format!("Missing '{key}' argument"))),
    }
}

fn as_f64(v: &Value) -> Result<f64, ToolError> {
    v.as_f64()
        .ok_or_else(|| ToolError::InvalidArguments(format!("{v} is not representable as f64")))
}
