// Condition Parser
// Recursive-descent parser producing an expression tree

use crate::condition::lexer::{LexError, Lexer, Spanned, Token};
use crate::definition::Value;

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Root named value such as `matrix`, `steps` or `needs`
    Ident(String),
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Expr {
    /// Visit this node and every descendant
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::Literal(_) | Expr::Ident(_) => {}
            Expr::Member { object, .. } => object.walk(visit),
            Expr::Index { object, index } => {
                object.walk(visit);
                index.walk(visit);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.walk(visit)),
            Expr::Not(inner) => inner.walk(visit),
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseExprError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.position)
    }
}

impl std::error::Error for ParseExprError {}

impl From<LexError> for ParseExprError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            position: err.position,
        }
    }
}

pub struct ExprParser {
    tokens: Vec<Spanned>,
    cursor: usize,
}

impl ExprParser {
    pub fn parse_str(src: &str) -> Result<Expr, ParseExprError> {
        let tokens = Lexer::new(src).tokenize()?;
        let mut parser = ExprParser { tokens, cursor: 0 };
        if parser.peek() == &Token::Eof {
            return Err(parser.error("empty expression"));
        }
        let expr = parser.or()?;
        if parser.peek() != &Token::Eof {
            return Err(parser.error(format!("unexpected '{}'", parser.peek())));
        }
        Ok(expr)
    }

    fn or(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.equality()?;
        while self.eat(&Token::And) {
            let right = self.equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.comparison()?;
        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                _ => return Ok(left),
            };
            self.cursor += 1;
            let right = self.comparison()?;
            left = binary(op, left, right);
        }
    }

    fn comparison(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => return Ok(left),
            };
            self.cursor += 1;
            let right = self.unary()?;
            left = binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseExprError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseExprError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let property = match self.advance() {
                    Token::Ident(name) => name,
                    Token::Null => "null".to_string(),
                    Token::True => "true".to_string(),
                    Token::False => "false".to_string(),
                    other => {
                        self.cursor -= 1;
                        return Err(self.error(format!(
                            "expected property name after '.', found '{}'",
                            other
                        )));
                    }
                };
                expr = Expr::Member {
                    object: Box::new(expr),
                    property,
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.or()?;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseExprError> {
        match self.advance() {
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if !self.eat(&Token::LParen) {
                    return Ok(Expr::Ident(name));
                }
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.or()?);
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        self.expect(&Token::Comma)?;
                    }
                }
                Ok(Expr::Call { name, args })
            }
            other => {
                self.cursor -= 1;
                Err(self.error(format!("unexpected '{}'", other)))
            }
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.cursor.min(self.tokens.len() - 1)].token
    }

    /// Consume the current token; callers step back with `cursor -= 1` on error
    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        self.cursor += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), ParseExprError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}', found '{}'", token, self.peek())))
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseExprError {
        let index = self.cursor.min(self.tokens.len() - 1);
        ParseExprError {
            message: message.into(),
            position: self.tokens[index].offset,
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_without_args() {
        assert_eq!(
            ExprParser::parse_str("always()").unwrap(),
            Expr::Call {
                name: "always".into(),
                args: vec![]
            }
        );
    }

    #[test]
    fn test_member_chain() {
        let expr = ExprParser::parse_str("steps.compile.outputs['digest']").unwrap();
        match expr {
            Expr::Index { object, index } => {
                assert_eq!(*index, Expr::Literal(Value::from("digest")));
                assert!(matches!(*object, Expr::Member { ref property, .. } if property == "outputs"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_precedence_and_binds_tighter_than_or() {
        let expr = ExprParser::parse_str("a || b && c").unwrap();
        match expr {
            Expr::Binary { op, right, .. } => {
                assert_eq!(op, BinaryOp::Or);
                assert!(matches!(*right, Expr::Binary { op: BinaryOp::And, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_comparison_binds_tighter_than_equality() {
        let expr = ExprParser::parse_str("a < b == true").unwrap();
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::Eq, .. }));
    }

    #[test]
    fn test_function_args() {
        let expr = ExprParser::parse_str("eq(matrix.os, 'linux')").unwrap();
        match expr {
            Expr::Call { name, args } => {
                assert_eq!(name, "eq");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(ExprParser::parse_str("").is_err());
        assert!(ExprParser::parse_str("success(").is_err());
        assert!(ExprParser::parse_str("a b").is_err());
        assert!(ExprParser::parse_str("a.").is_err());
        assert!(ExprParser::parse_str("(a").is_err());
        let err = ExprParser::parse_str("a ==").unwrap_err();
        assert_eq!(err.position, 4);
    }

    #[test]
    fn test_walk_visits_nested_calls() {
        let expr = ExprParser::parse_str("!(failure() && eq(1, 1))").unwrap();
        let mut names = Vec::new();
        expr.walk(&mut |node| {
            if let Expr::Call { name, .. } = node {
                names.push(name.clone());
            }
        });
        assert_eq!(names, vec!["failure", "eq"]);
    }
}
