//! Predicate language for `when`, job `if` and step `if`.
//!
//! Predicates are parsed once at plan time into a [`Condition`] and evaluated
//! against a [`StatusSnapshot`] without side effects.

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;

pub use evaluator::{EvalError, Evaluator, NeedView, StatusSnapshot, StepView};
pub use functions::BuiltinFunctions;
pub use parser::{BinaryOp, Expr, ExprParser, ParseExprError};

/// A parsed predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse a predicate; a surrounding `${{ }}` is optional
    pub fn parse(source: &str) -> Result<Self, ParseExprError> {
        let trimmed = source.trim();
        let inner = trimmed
            .strip_prefix("${{")
            .and_then(|rest| rest.strip_suffix("}}"))
            .unwrap_or(trimmed);
        Ok(Self {
            source: trimmed.to_string(),
            expr: ExprParser::parse_str(inner)?,
        })
    }

    /// Parse an optional predicate, defaulting to `success()`
    pub fn parse_or_default(source: Option<&str>) -> Result<Self, ParseExprError> {
        match source {
            Some(src) => Self::parse(src),
            None => Ok(Self::success()),
        }
    }

    /// The default predicate: run only if nothing before it failed
    pub fn success() -> Self {
        Self {
            source: "success()".to_string(),
            expr: Expr::Call {
                name: "success".to_string(),
                args: Vec::new(),
            },
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn evaluate(&self, snapshot: &StatusSnapshot) -> Result<bool, EvalError> {
        Ok(Evaluator::new(snapshot).eval(&self.expr)?.is_truthy())
    }

    /// Evaluate under the implicit `success()` gate: once something failed or
    /// the run was aborted, only predicates calling a status override run
    pub fn should_run(&self, snapshot: &StatusSnapshot) -> Result<bool, EvalError> {
        if (snapshot.failed || snapshot.cancelled) && !self.runs_on_failure() {
            return Ok(false);
        }
        self.evaluate(snapshot)
    }

    /// Whether the predicate mentions a status function that overrides the
    /// implicit `success()` gate (`always()`, `failure()`, `cancelled()`)
    pub fn runs_on_failure(&self) -> bool {
        let mut found = false;
        self.expr.walk(&mut |node| {
            if let Expr::Call { name, .. } = node {
                let lower = name.to_ascii_lowercase();
                if BuiltinFunctions::STATUS_OVERRIDES.contains(&lower.as_str()) {
                    found = true;
                }
            }
        });
        found
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::success()
    }
}
