// Condition Evaluator
// Pure evaluation of expression trees over an immutable status snapshot

use crate::condition::functions::BuiltinFunctions;
use crate::condition::parser::{BinaryOp, Expr};
use crate::definition::Value;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for EvalError {}

/// Outcome of an earlier step, as seen by later predicates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepView {
    /// `success`, `failure`, `skipped` or `cancelled`
    pub outcome: String,
    pub outputs: HashMap<String, String>,
}

/// Aggregate result of an upstream job (all instances of one template)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NeedView {
    /// `success`, `failure`, `skipped` or `cancelled`
    pub result: String,
    pub outputs: HashMap<String, String>,
}

/// Everything a predicate may observe.
///
/// `failed` is the aggregate status the status functions read: for a step,
/// whether an earlier required step in the same job failed; for a job,
/// whether any upstream instance ended Failed or Cancelled.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub failed: bool,
    pub cancelled: bool,
    pub matrix: HashMap<String, Value>,
    pub variables: HashMap<String, Value>,
    pub env: HashMap<String, String>,
    pub steps: HashMap<String, StepView>,
    pub needs: HashMap<String, NeedView>,
}

impl StatusSnapshot {
    /// Snapshot used for plan-time gates: variables only
    pub fn for_variables(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            ..Self::default()
        }
    }

    fn named_value(&self, name: &str) -> Option<Value> {
        let value = match name {
            "matrix" => Value::Object(self.matrix.clone()),
            "variables" | "vars" => Value::Object(self.variables.clone()),
            "env" => Value::from(self.env.clone()),
            "steps" => Value::Object(
                self.steps
                    .iter()
                    .map(|(id, view)| {
                        let mut obj = HashMap::new();
                        obj.insert("outcome".to_string(), Value::from(view.outcome.as_str()));
                        obj.insert("conclusion".to_string(), Value::from(view.outcome.as_str()));
                        obj.insert("outputs".to_string(), Value::from(view.outputs.clone()));
                        (id.clone(), Value::Object(obj))
                    })
                    .collect(),
            ),
            "needs" => Value::Object(
                self.needs
                    .iter()
                    .map(|(job, view)| {
                        let mut obj = HashMap::new();
                        obj.insert("result".to_string(), Value::from(view.result.as_str()));
                        obj.insert("outputs".to_string(), Value::from(view.outputs.clone()));
                        (job.clone(), Value::Object(obj))
                    })
                    .collect(),
            ),
            _ => return None,
        };
        Some(value)
    }
}

pub struct Evaluator<'a> {
    snapshot: &'a StatusSnapshot,
}

impl<'a> Evaluator<'a> {
    pub fn new(snapshot: &'a StatusSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn snapshot(&self) -> &StatusSnapshot {
        self.snapshot
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => self
                .snapshot
                .named_value(name)
                .ok_or_else(|| EvalError::new(format!("unrecognized named value '{}'", name))),
            Expr::Member { object, property } => {
                let object = self.eval(object)?;
                Ok(member(&object, property))
            }
            Expr::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                Ok(match (&object, &index) {
                    (Value::Array(items), _) => index
                        .as_number()
                        .filter(|n| *n >= 0.0 && n.fract() == 0.0)
                        .and_then(|n| items.get(n as usize).cloned())
                        .unwrap_or(Value::Null),
                    _ => member(&object, &index.as_string()),
                })
            }
            Expr::Call { name, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                BuiltinFunctions::call(name, &args, self.snapshot)
            }
            Expr::Not(inner) => Ok(Value::Bool(!self.eval(inner)?.is_truthy())),
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let left = self.eval(left)?;
                    if !left.is_truthy() {
                        return Ok(left);
                    }
                    self.eval(right)
                }
                BinaryOp::Or => {
                    let left = self.eval(left)?;
                    if left.is_truthy() {
                        return Ok(left);
                    }
                    self.eval(right)
                }
                BinaryOp::Eq => Ok(Value::Bool(loose_eq(&self.eval(left)?, &self.eval(right)?))),
                BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&self.eval(left)?, &self.eval(right)?))),
                BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                    let ordering = compare(&self.eval(left)?, &self.eval(right)?);
                    let result = match (op, ordering) {
                        (_, None) => false,
                        (BinaryOp::Lt, Some(o)) => o == Ordering::Less,
                        (BinaryOp::Le, Some(o)) => o != Ordering::Greater,
                        (BinaryOp::Gt, Some(o)) => o == Ordering::Greater,
                        (_, Some(o)) => o != Ordering::Less,
                    };
                    Ok(Value::Bool(result))
                }
            },
        }
    }
}

fn member(object: &Value, property: &str) -> Value {
    match object {
        Value::Object(map) => map
            .get(property)
            .or_else(|| {
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(property))
                    .map(|(_, v)| v)
            })
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Equality with string case folding and number coercion
pub(crate) fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Array(_), _) | (_, Value::Array(_)) | (Value::Object(_), _) | (_, Value::Object(_)) => {
            left == right
        }
        _ => match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Some(a.to_lowercase().cmp(&b.to_lowercase()));
    }
    let (a, b) = (left.as_number()?, right.as_number()?);
    a.partial_cmp(&b)
}
