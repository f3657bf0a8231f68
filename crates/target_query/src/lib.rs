//! Typed target-predicate language for selecting agents.
//!
//! Actions carry a target expression such as
//! `status == "online" AND tag["operator"] == "IT"`. The expression is
//! parsed into a small AST, then either compiled to a parameterized SQL
//! fragment for the store or evaluated directly against an agent row.
//! Raw query fragments never reach the store.

use core_models::Agent;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal at offset {0}")]
    UnterminatedString(usize),
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
}

pub type Result<T> = std::result::Result<T, TargetError>;

/// Agent attributes addressable from a target expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Status,
    Name,
    Os,
    Arch,
    Version,
    QueueLoc,
    Tag(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Cmp { field: Field, op: CmpOp, value: String },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Eq,
    Ne,
    And,
    Or,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(TargetError::UnexpectedChar('=', i));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(TargetError::UnexpectedChar('!', i));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut lit = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(TargetError::UnterminatedString(start)),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            lit.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(lit));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.get(i) {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        i += 1;
                    } else {
                        break;
                    }
                }
                match ident.to_ascii_uppercase().as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    _ => tokens.push(Token::Ident(ident)),
                }
            }
            other => return Err(TargetError::UnexpectedChar(other, i)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token> {
        let t = self.tokens.get(self.pos).cloned().ok_or(TargetError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(t)
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        let got = self.next()?;
        if got == want {
            Ok(())
        } else {
            Err(TargetError::UnexpectedToken(format!("{got:?}")))
        }
    }

    // or := and ( "OR" and )*
    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // and := cmp ( "AND" cmp )*
    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_cmp()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            self.expect(Token::RParen)?;
            return Ok(inner);
        }
        let field = match self.next()? {
            Token::Ident(name) => self.parse_field(&name)?,
            other => return Err(TargetError::UnexpectedToken(format!("{other:?}"))),
        };
        let op = match self.next()? {
            Token::Eq => CmpOp::Eq,
            Token::Ne => CmpOp::Ne,
            other => return Err(TargetError::UnexpectedToken(format!("{other:?}"))),
        };
        let value = match self.next()? {
            Token::Str(s) => s,
            other => return Err(TargetError::UnexpectedToken(format!("{other:?}"))),
        };
        Ok(Expr::Cmp { field, op, value })
    }

    fn parse_field(&mut self, name: &str) -> Result<Field> {
        match name {
            "status" => Ok(Field::Status),
            "name" => Ok(Field::Name),
            "os" => Ok(Field::Os),
            "arch" => Ok(Field::Arch),
            "version" => Ok(Field::Version),
            "queueloc" => Ok(Field::QueueLoc),
            "tag" => {
                self.expect(Token::LBracket)?;
                let key = match self.next()? {
                    Token::Str(s) => s,
                    other => return Err(TargetError::UnexpectedToken(format!("{other:?}"))),
                };
                self.expect(Token::RBracket)?;
                Ok(Field::Tag(key))
            }
            other => Err(TargetError::UnknownField(other.to_string())),
        }
    }
}

/// Parse a target expression into its AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(TargetError::UnexpectedToken(format!(
            "{:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

/// A compiled predicate: a SQL fragment over the agents table plus its
/// bound parameters, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlPredicate {
    pub where_clause: String,
    pub params: Vec<String>,
}

/// Compile a target expression to its store form.
pub fn compile(input: &str) -> Result<SqlPredicate> {
    let expr = parse(input)?;
    let mut params = Vec::new();
    let clause = compile_expr(&expr, &mut params);
    Ok(SqlPredicate { where_clause: clause, params })
}

fn compile_expr(expr: &Expr, params: &mut Vec<String>) -> String {
    match expr {
        Expr::And(l, r) => format!(
            "({} AND {})",
            compile_expr(l, params),
            compile_expr(r, params)
        ),
        Expr::Or(l, r) => format!(
            "({} OR {})",
            compile_expr(l, params),
            compile_expr(r, params)
        ),
        Expr::Cmp { field, op, value } => {
            let column = match field {
                Field::Status => "status".to_string(),
                Field::Name => "name".to_string(),
                Field::Version => "version".to_string(),
                Field::QueueLoc => "queue_location".to_string(),
                Field::Os => "json_extract(environment, '$.os')".to_string(),
                Field::Arch => "json_extract(environment, '$.arch')".to_string(),
                Field::Tag(key) => {
                    params.push(format!("$.{key}"));
                    "json_extract(tags, ?)".to_string()
                }
            };
            params.push(value.clone());
            let op_sql = match op {
                CmpOp::Eq => "=",
                // IS NOT so that rows with an absent tag satisfy !=
                CmpOp::Ne => "IS NOT",
            };
            format!("{column} {op_sql} ?")
        }
    }
}

/// Evaluate a parsed expression directly against an agent row.
pub fn matches(expr: &Expr, agent: &Agent) -> bool {
    match expr {
        Expr::And(l, r) => matches(l, agent) && matches(r, agent),
        Expr::Or(l, r) => matches(l, agent) || matches(r, agent),
        Expr::Cmp { field, op, value } => {
            let actual: Option<String> = match field {
                Field::Status => Some(agent.status.as_str().to_string()),
                Field::Name => Some(agent.name.clone()),
                Field::Os => Some(agent.environment.os.clone()),
                Field::Arch => Some(agent.environment.arch.clone()),
                Field::Version => Some(agent.version.clone()),
                Field::QueueLoc => Some(agent.queue_location.clone()),
                Field::Tag(key) => agent.tags.get(key).cloned(),
            };
            match op {
                CmpOp::Eq => actual.as_deref() == Some(value.as_str()),
                CmpOp::Ne => actual.as_deref() != Some(value.as_str()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use core_models::{AgentEnvironment, AgentStatus};

    fn agent(status: AgentStatus, os: &str, tag: Option<(&str, &str)>) -> Agent {
        let mut tags = std::collections::BTreeMap::new();
        if let Some((k, v)) = tag {
            tags.insert(k.to_string(), v.to_string());
        }
        Agent {
            id: 1,
            name: "host1".into(),
            queue_location: format!("{os}.host1.abc"),
            version: "0.3.0".into(),
            pid: 42,
            start_time: Utc::now(),
            heartbeat_time: Utc::now(),
            destruction_time: None,
            environment: AgentEnvironment { os: os.into(), ..Default::default() },
            tags,
            status,
        }
    }

    #[test]
    fn parses_simple_equality() {
        let expr = parse(r#"status == "online""#).unwrap();
        assert_eq!(
            expr,
            Expr::Cmp { field: Field::Status, op: CmpOp::Eq, value: "online".into() }
        );
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse(r#"os == "linux" OR os == "darwin" AND status == "online""#).unwrap();
        match expr {
            Expr::Or(_, right) => assert!(matches!(*right, Expr::And(_, _))),
            other => panic!("expected OR at the top, got {other:?}"),
        }
    }

    #[test]
    fn compiles_to_parameterized_sql() {
        let p = compile(r#"status == "online" AND tag["operator"] == "IT""#).unwrap();
        assert_eq!(
            p.where_clause,
            "(status = ? AND json_extract(tags, ?) = ?)"
        );
        assert_eq!(p.params, vec!["online", "$.operator", "IT"]);
    }

    #[test]
    fn value_is_never_spliced_into_sql() {
        let p = compile(r#"name == "x'; DROP TABLE agents; --""#).unwrap();
        assert!(!p.where_clause.contains("DROP"));
        assert_eq!(p.params, vec!["x'; DROP TABLE agents; --"]);
    }

    #[test]
    fn evaluates_against_agents() {
        let expr = parse(r#"status == "online" AND tag["operator"] == "IT""#).unwrap();
        assert!(matches(&expr, &agent(AgentStatus::Online, "linux", Some(("operator", "IT")))));
        assert!(!matches(&expr, &agent(AgentStatus::Online, "linux", None)));
        assert!(!matches(&expr, &agent(AgentStatus::Idle, "linux", Some(("operator", "IT")))));
    }

    #[test]
    fn parenthesized_groups() {
        let expr =
            parse(r#"(os == "linux" OR os == "darwin") AND status == "online""#).unwrap();
        assert!(matches(&expr, &agent(AgentStatus::Online, "darwin", None)));
        assert!(!matches(&expr, &agent(AgentStatus::Offline, "darwin", None)));
    }

    #[test]
    fn rejects_unknown_fields_and_raw_sql() {
        assert!(matches!(parse("hostname == \"x\""), Err(TargetError::UnknownField(_))));
        assert!(parse("status = 'online'").is_err());
        assert!(parse("1=1; DROP TABLE agents").is_err());
    }

    #[test]
    fn rejects_trailing_tokens() {
        assert!(parse(r#"status == "online" status"#).is_err());
    }
}
