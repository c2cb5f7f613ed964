//! Calculator tool: evaluates arithmetic expressions.
//!
//! Supports `+`, `-`, `*`, `/`, parentheses, unary minus and decimal
//! literals. Evaluation is a precedence-climbing parser that walks the
//! input once; there is no separate token buffer.

use async_trait::async_trait;
use agentchain_core::error::ToolError;
use agentchain_core::tool::Tool;
use std::iter::Peekable;
use std::str::CharIndices;

use crate::number_value;

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression. Supports +, -, *, /, parentheses, and decimal numbers."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "The expression to evaluate, e.g. '(2 + 3) * 4'"
                }
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let expr = arguments["expression"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'expression' argument".into()))?;

        let value = evaluate(expr).map_err(|e| ToolError::ExecutionFailed {
            tool_name: self.name().into(),
            reason: e.to_string(),
        })?;
        number_value(self.name(), value)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("unexpected character '{ch}' at offset {at}")]
    UnexpectedChar { ch: char, at: usize },

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("expected ')' at offset {0}")]
    UnclosedParen(usize),

    #[error("division by zero")]
    DivisionByZero,
}

/// Evaluate an arithmetic expression.
pub fn evaluate(expr: &str) -> Result<f64, EvalError> {
    let mut cursor = Cursor {
        src: expr,
        chars: expr.char_indices().peekable(),
    };
    let value = cursor.expression(0)?;
    cursor.skip_whitespace();
    match cursor.chars.next() {
        None => Ok(value),
        Some((at, ch)) => Err(EvalError::UnexpectedChar { ch, at }),
    }
}

struct Cursor<'a> {
    src: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

/// Binding power of a binary operator.
fn precedence(op: char) -> Option<u8> {
    match op {
        '+' | '-' => Some(1),
        '*' | '/' => Some(2),
        _ => None,
    }
}

impl Cursor<'_> {
    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
    }

    fn peek(&mut self) -> Option<(usize, char)> {
        self.skip_whitespace();
        self.chars.peek().copied()
    }

    /// Parse operators binding tighter than `min`, left-associatively.
    fn expression(&mut self, min: u8) -> Result<f64, EvalError> {
        let mut lhs = self.operand()?;
        while let Some((_, op)) = self.peek() {
            let Some(prec) = precedence(op).filter(|p| *p > min) else {
                break;
            };
            self.chars.next();
            let rhs = self.expression(prec)?;
            lhs = match op {
                '+' => lhs + rhs,
                '-' => lhs - rhs,
                '*' => lhs * rhs,
                _ if rhs == 0.0 => return Err(EvalError::DivisionByZero),
                _ => lhs / rhs,
            };
        }
        Ok(lhs)
    }

    fn operand(&mut self) -> Result<f64, EvalError> {
        match self.peek() {
            None => Err(EvalError::UnexpectedEnd),
            Some((_, '-')) => {
                self.chars.next();
                Ok(-self.operand()?)
            }
            Some((open, '(')) => {
                self.chars.next();
                let value = self.expression(0)?;
                match self.peek() {
                    Some((_, ')')) => {
                        self.chars.next();
                        Ok(value)
                    }
                    Some((at, _)) => Err(EvalError::UnclosedParen(at)),
                    None => Err(EvalError::UnclosedParen(open)),
                }
            }
            Some((start, c)) if c.is_ascii_digit() || c == '.' => {
                let mut end = start;
                while let Some((i, c)) = self.chars.next_if(|(_, c)| c.is_ascii_digit() || *c == '.') {
                    end = i + c.len_utf8();
                }
                let literal = &self.src[start..end];
                literal
                    .parse()
                    .map_err(|_| EvalError::InvalidNumber(literal.to_string()))
            }
            Some((at, ch)) => Err(EvalError::UnexpectedChar { ch, at }),
        }
    }
}
