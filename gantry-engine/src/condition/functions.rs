// Built-in Functions
// Status and string functions available to predicates

use crate::condition::evaluator::{loose_eq, EvalError, StatusSnapshot};
use crate::definition::Value;

pub struct BuiltinFunctions;

impl BuiltinFunctions {
    /// Names of functions that make a predicate run after a failure or abort
    pub const STATUS_OVERRIDES: &'static [&'static str] =
        &["always", "failure", "failed", "cancelled", "canceled"];

    pub fn call(name: &str, args: &[Value], snapshot: &StatusSnapshot) -> Result<Value, EvalError> {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "success" | "succeeded" => {
                arity(name, args, 0, 0)?;
                Ok(Value::Bool(!snapshot.failed && !snapshot.cancelled))
            }
            "failure" | "failed" => {
                arity(name, args, 0, 0)?;
                Ok(Value::Bool(snapshot.failed))
            }
            "cancelled" | "canceled" => {
                arity(name, args, 0, 0)?;
                Ok(Value::Bool(snapshot.cancelled))
            }
            "always" => {
                arity(name, args, 0, 0)?;
                Ok(Value::Bool(true))
            }
            "eq" => {
                arity(name, args, 2, 2)?;
                Ok(Value::Bool(loose_eq(&args[0], &args[1])))
            }
            "ne" => {
                arity(name, args, 2, 2)?;
                Ok(Value::Bool(!loose_eq(&args[0], &args[1])))
            }
            "and" => {
                arity(name, args, 2, usize::MAX)?;
                Ok(Value::Bool(args.iter().all(Value::is_truthy)))
            }
            "or" => {
                arity(name, args, 2, usize::MAX)?;
                Ok(Value::Bool(args.iter().any(Value::is_truthy)))
            }
            "not" => {
                arity(name, args, 1, 1)?;
                Ok(Value::Bool(!args[0].is_truthy()))
            }
            "contains" => {
                arity(name, args, 2, 2)?;
                let found = match &args[0] {
                    Value::Array(items) => items.iter().any(|item| loose_eq(item, &args[1])),
                    haystack => haystack
                        .as_string()
                        .to_lowercase()
                        .contains(&args[1].as_string().to_lowercase()),
                };
                Ok(Value::Bool(found))
            }
            "startswith" => {
                arity(name, args, 2, 2)?;
                let (text, prefix) = folded(&args[0], &args[1]);
                Ok(Value::Bool(text.starts_with(&prefix)))
            }
            "endswith" => {
                arity(name, args, 2, 2)?;
                let (text, suffix) = folded(&args[0], &args[1]);
                Ok(Value::Bool(text.ends_with(&suffix)))
            }
            "in" => {
                arity(name, args, 2, usize::MAX)?;
                Ok(Value::Bool(args[1..].iter().any(|c| loose_eq(&args[0], c))))
            }
            "format" => {
                arity(name, args, 1, usize::MAX)?;
                format(&args[0].as_string(), &args[1..]).map(Value::String)
            }
            _ => Err(EvalError::new(format!("unknown function '{}'", name))),
        }
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), EvalError> {
    if args.len() < min || args.len() > max {
        let expected = match (min, max) {
            (a, b) if a == b => format!("{}", a),
            (a, usize::MAX) => format!("at least {}", a),
            (a, b) => format!("{} to {}", a, b),
        };
        return Err(EvalError::new(format!(
            "{}() expects {} argument(s), got {}",
            name,
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn folded(a: &Value, b: &Value) -> (String, String) {
    (a.as_string().to_lowercase(), b.as_string().to_lowercase())
}

/// `format('{0}-{1}', a, b)`; `{{` and `}}` escape braces
fn format(template: &str, args: &[Value]) -> Result<String, EvalError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut digits = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    digits.push(c);
                }
                let index: usize = digits
                    .trim()
                    .parse()
                    .map_err(|_| EvalError::new(format!("invalid format placeholder '{{{}}}'", digits)))?;
                let arg = args.get(index).ok_or_else(|| {
                    EvalError::new(format!("format placeholder {{{}}} has no argument", index))
                })?;
                out.push_str(&arg.as_string());
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
