//! Boolean predicates over token claims.
//!
//! ```text
//! Equals(`grp`, `admin`) && !Prefix(user.email, "ext-") || OneOf(scope, read, write)
//! ```
//!
//! Supported functions: `Equals(claim, value)`, `Prefix(claim, prefix)`,
//! `Contains(claim, value)`, `SplitContains(claim, separator, value)` and
//! `OneOf(claim, value, ...)`. Claims are dotted paths into the claim set. Arguments are bare
//! words or strings quoted with `"`, `'` or `` ` ``.

use serde_json::Value;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected {found:?} at offset {offset}")]
    Unexpected { found: String, offset: usize },
    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
    #[error("{name} expects {expected} arguments, got {got}")]
    Arity {
        name: &'static str,
        expected: &'static str,
        got: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Function {
    Equals,
    Prefix,
    Contains,
    SplitContains,
    OneOf,
}

impl Function {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "Equals" => Self::Equals,
            "Prefix" => Self::Prefix,
            "Contains" => Self::Contains,
            "SplitContains" => Self::SplitContains,
            "OneOf" => Self::OneOf,
            _ => return None,
        })
    }

    fn check_arity(self, got: usize) -> Result<(), Error> {
        let (name, expected, ok) = match self {
            Self::Equals => ("Equals", "2", got == 2),
            Self::Prefix => ("Prefix", "2", got == 2),
            Self::Contains => ("Contains", "2", got == 2),
            Self::SplitContains => ("SplitContains", "3", got == 3),
            Self::OneOf => ("OneOf", "at least 2", got >= 2),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Arity {
                name,
                expected,
                got,
            })
        }
    }
}

/// A parsed claims predicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Call {
        function: Function,
        claim: String,
        args: Vec<String>,
    },
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, Error> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        match parser.tokens.get(parser.pos) {
            None => Ok(expr),
            Some((token, offset)) => Err(Error::Unexpected {
                found: token.to_string(),
                offset: *offset,
            }),
        }
    }

    /// Evaluates the predicate. A missing claim never matches.
    pub fn eval(&self, claims: &Value) -> bool {
        match self {
            Self::Not(expr) => !expr.eval(claims),
            Self::And(lhs, rhs) => lhs.eval(claims) && rhs.eval(claims),
            Self::Or(lhs, rhs) => lhs.eval(claims) || rhs.eval(claims),
            Self::Call {
                function,
                claim,
                args,
            } => match lookup(claims, claim) {
                Some(value) => call(*function, value, args),
                None => false,
            },
        }
    }
}

fn call(function: Function, value: &Value, args: &[String]) -> bool {
    match function {
        Function::Equals => any_scalar(value, |s| s == args[0]),
        Function::Prefix => any_scalar(value, |s| s.starts_with(args[0].as_str())),
        Function::Contains => match value {
            Value::Array(items) => items
                .iter()
                .filter_map(scalar_to_string)
                .any(|s| s == args[0]),
            _ => scalar_to_string(value)
                .map(|s| s.contains(args[0].as_str()))
                .unwrap_or(false),
        },
        Function::SplitContains => any_scalar(value, |s| {
            s.split(args[0].as_str()).any(|part| part == args[1])
        }),
        Function::OneOf => any_scalar(value, |s| args.iter().any(|arg| *arg == s)),
    }
}

/// Applies `f` to a scalar claim, or to each scalar of an array claim.
fn any_scalar(value: &Value, f: impl Fn(String) -> bool) -> bool {
    match value {
        Value::Array(items) => items.iter().filter_map(scalar_to_string).any(f),
        _ => scalar_to_string(value).map(f).unwrap_or(false),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Resolves a dotted claim path, e.g. `user.groups`.
pub fn lookup<'a>(claims: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(value) = claims.get(path) {
        return Some(value);
    }
    path.split('.')
        .try_fold(claims, |value, segment| value.get(segment))
}

/// Renders a claim as a header value: strings as-is, anything else as JSON.
pub fn to_header_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    LParen,
    RParen,
    Comma,
    Not,
    And,
    Or,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Word(w) | Self::Quoted(w) => write!(f, "{}", w),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::Comma => write!(f, ","),
            Self::Not => write!(f, "!"),
            Self::And => write!(f, "&&"),
            Self::Or => write!(f, "||"),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, Error> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some((offset, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '!' => Token::Not,
            '&' | '|' => {
                match chars.next() {
                    Some((_, next)) if next == c => {}
                    Some((at, next)) => {
                        return Err(Error::Unexpected {
                            found: next.to_string(),
                            offset: at,
                        })
                    }
                    None => return Err(Error::UnexpectedEnd),
                }
                if c == '&' {
                    Token::And
                } else {
                    Token::Or
                }
            }
            '"' | '\'' | '`' => {
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, q)) if q == c => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => return Err(Error::UnterminatedString(offset)),
                        },
                        Some((_, other)) => value.push(other),
                        None => return Err(Error::UnterminatedString(offset)),
                    }
                }
                Token::Quoted(value)
            }
            _ => {
                let mut word = c.to_string();
                while let Some((_, next)) = chars.peek() {
                    if next.is_whitespace() || "(),!&|\"'`".contains(*next) {
                        break;
                    }
                    word.push(*next);
                    chars.next();
                }
                Token::Word(word)
            }
        };
        tokens.push((token, offset));
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn next(&mut self) -> Result<(Token, usize), Error> {
        let token = self.tokens.get(self.pos).cloned().ok_or(Error::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), Error> {
        let (token, offset) = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(Error::Unexpected {
                found: token.to_string(),
                offset,
            })
        }
    }

    fn or(&mut self) -> Result<Expr, Error> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, Error> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, Error> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let expr = self.or()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            _ => self.call(),
        }
    }

    fn call(&mut self) -> Result<Expr, Error> {
        let (token, offset) = self.next()?;
        let name = match token {
            Token::Word(name) => name,
            other => {
                return Err(Error::Unexpected {
                    found: other.to_string(),
                    offset,
                })
            }
        };
        let function = Function::parse(&name).ok_or(Error::UnknownFunction(name))?;

        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        loop {
            let (token, offset) = self.next()?;
            match token {
                Token::Word(arg) | Token::Quoted(arg) => args.push(arg),
                other => {
                    return Err(Error::Unexpected {
                        found: other.to_string(),
                        offset,
                    })
                }
            }
            let (token, offset) = self.next()?;
            match token {
                Token::Comma => continue,
                Token::RParen => break,
                other => {
                    return Err(Error::Unexpected {
                        found: other.to_string(),
                        offset,
                    })
                }
            }
        }

        function.check_arity(args.len())?;
        let claim = args.remove(0);
        Ok(Expr::Call {
            function,
            claim,
            args,
        })
    }
}
