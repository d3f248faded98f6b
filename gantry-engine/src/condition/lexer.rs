// Condition Lexer
// Splits predicate source into tokens with their byte offsets

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Null,
    True,
    False,
    Number(f64),
    Str(String),
    /// Names may contain '-' so job and step ids like `build-linux` read naturally
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Token::Null => "null",
            Token::True => "true",
            Token::False => "false",
            Token::Number(n) => return write!(f, "{}", n),
            Token::Str(s) => return write!(f, "'{}'", s),
            Token::Ident(name) => return f.write_str(name),
            Token::Dot => ".",
            Token::Comma => ",",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Not => "!",
            Token::And => "&&",
            Token::Or => "||",
            Token::Eq => "==",
            Token::Ne => "!=",
            Token::Lt => "<",
            Token::Le => "<=",
            Token::Gt => ">",
            Token::Ge => ">=",
            Token::Eof => "end of input",
        };
        f.write_str(text)
    }
}

/// A token and the byte offset where it starts
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.position)
    }
}

impl std::error::Error for LexError {}

pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    /// Tokenize the whole input; the result always ends with `Eof`
    pub fn tokenize(mut self) -> Result<Vec<Spanned>, LexError> {
        let mut out = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            out.push(spanned);
            if done {
                return Ok(out);
            }
        }
    }

    fn next_token(&mut self) -> Result<Spanned, LexError> {
        self.skip_whitespace();
        let offset = self.pos;
        let Some(ch) = self.peek() else {
            return Ok(Spanned {
                token: Token::Eof,
                offset,
            });
        };

        let token = match ch {
            '.' => self.single(Token::Dot),
            ',' => self.single(Token::Comma),
            '(' => self.single(Token::LParen),
            ')' => self.single(Token::RParen),
            '[' => self.single(Token::LBracket),
            ']' => self.single(Token::RBracket),
            '!' => self.pair('=', Token::Ne, Some(Token::Not))?,
            '<' => self.pair('=', Token::Le, Some(Token::Lt))?,
            '>' => self.pair('=', Token::Ge, Some(Token::Gt))?,
            '=' => self.pair('=', Token::Eq, None)?,
            '&' => self.pair('&', Token::And, None)?,
            '|' => self.pair('|', Token::Or, None)?,
            '\'' => self.string()?,
            c if c.is_ascii_digit() => self.number()?,
            c if c.is_alphabetic() || c == '_' => self.ident(),
            other => {
                return Err(LexError {
                    message: format!("unexpected character '{}'", other),
                    position: offset,
                })
            }
        };

        Ok(Spanned { token, offset })
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn single(&mut self, token: Token) -> Token {
        self.bump();
        token
    }

    /// One- or two-character operator; `alone` is None when the first char
    /// is only valid as part of the pair
    fn pair(&mut self, second: char, both: Token, alone: Option<Token>) -> Result<Token, LexError> {
        let start = self.pos;
        let first = self.bump();
        if self.peek() == Some(second) {
            self.bump();
            return Ok(both);
        }
        alone.ok_or_else(|| LexError {
            message: format!(
                "expected '{}{}'",
                first.unwrap_or_default(),
                second
            ),
            position: start,
        })
    }

    fn string(&mut self) -> Result<Token, LexError> {
        let start = self.pos;
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('\'') if self.peek() == Some('\'') => {
                    self.bump();
                    value.push('\'');
                }
                Some('\'') => return Ok(Token::Str(value)),
                Some(c) => value.push(c),
                None => {
                    return Err(LexError {
                        message: "unterminated string literal".to_string(),
                        position: start,
                    })
                }
            }
        }
    }

    fn number(&mut self) -> Result<Token, LexError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        // A '.' only continues the number when a digit follows it
        let rest = &self.src[self.pos..];
        if rest.starts_with('.') && rest[1..].starts_with(|c: char| c.is_ascii_digit()) {
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        let text = &self.src[start..self.pos];
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| LexError {
                message: format!("invalid number '{}'", text),
                position: start,
            })
    }

    fn ident(&mut self) -> Token {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            self.bump();
        }
        match &self.src[start..self.pos] {
            "null" => Token::Null,
            "true" => Token::True,
            "false" => Token::False,
            name => Token::Ident(name.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_status_call() {
        assert_eq!(
            tokens("success()"),
            vec![
                Token::Ident("success".into()),
                Token::LParen,
                Token::RParen,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_hyphenated_reference() {
        assert_eq!(
            tokens("needs.build-linux.result"),
            vec![
                Token::Ident("needs".into()),
                Token::Dot,
                Token::Ident("build-linux".into()),
                Token::Dot,
                Token::Ident("result".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_operators_and_literals() {
        assert_eq!(
            tokens("!a && b.c != 'it''s' || 1.5 >= 2"),
            vec![
                Token::Not,
                Token::Ident("a".into()),
                Token::And,
                Token::Ident("b".into()),
                Token::Dot,
                Token::Ident("c".into()),
                Token::Ne,
                Token::Str("it's".into()),
                Token::Or,
                Token::Number(1.5),
                Token::Ge,
                Token::Number(2.0),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_offsets() {
        let spanned = Lexer::new("a  == b").tokenize().unwrap();
        assert_eq!(spanned[1].offset, 3);
        assert_eq!(spanned[2].offset, 6);
    }

    #[test]
    fn test_errors() {
        assert!(Lexer::new("'open").tokenize().is_err());
        assert!(Lexer::new("a = b").tokenize().is_err());
        assert!(Lexer::new("a & b").tokenize().is_err());
        assert!(Lexer::new("a + b").tokenize().is_err());
    }
}
