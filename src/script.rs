//! Embedded decision/report procedure language.
//!
//! Configuration files carry the per-mutation decision procedure and the
//! final report procedure as small statement sequences. This module parses
//! them once at load time and evaluates them against a [`ScriptEnv`], which
//! supplies the context primitives (`result`, `tag`, `rng` for decision
//! procedures; `tags`, `print` for report procedures).
//!
//! The load-bearing rule: `result("test")` with no cached result stops the
//! whole evaluation at that point. The stop is an ordinary value
//! ([`Outcome::Pending`]), not a fault, and it is how decision procedures
//! express dependency chains without explicit control flow.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Script errors: parse failures and fatal evaluation faults.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Malformed statement or expression.
    #[error("line {line}: {message}")]
    Parse {
        /// Configuration file line number.
        line: usize,
        /// Human-readable explanation.
        message: String,
    },
    /// Variable read before assignment.
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
    /// Operator applied to incompatible values.
    #[error("type error: {0}")]
    Type(String),
    /// `rng(n)` with a non-positive bound.
    #[error("rng bound must be a positive integer")]
    RngBound,
    /// Primitive not provided by the evaluation context.
    #[error("`{0}` is not available in this context")]
    Unsupported(&'static str),
    /// Cached result token outside the test's declared expect set.
    #[error("test `{test}` has cached result `{result}` outside its expect set")]
    ResultOutsideExpect {
        /// Test identity.
        test: String,
        /// Offending token.
        result: String,
    },
    /// Tag name outside the configured allow-list.
    #[error("tag `{0}` is not in the configured tag list")]
    TagNotAllowed(String),
    /// Test name with no configuration section.
    #[error("unknown test `{0}` in decision procedure")]
    UnknownTest(String),
    /// Failure inside an environment primitive (e.g. a store access).
    #[error("{0}")]
    Env(Box<dyn std::error::Error + Send + Sync>),
}

/// Context primitives supplied to a running procedure.
///
/// Each method defaults to [`ScriptError::Unsupported`] so an environment
/// only implements what its context allows.
pub trait ScriptEnv {
    /// Cached result token for a test identity, or `None` when the result
    /// does not exist yet (which stops the evaluation).
    fn fetch_result(&mut self, _test: &str) -> Result<Option<String>, ScriptError> {
        Err(ScriptError::Unsupported("result"))
    }

    /// Record a tag for the mutation under evaluation.
    fn add_tag(&mut self, _tag: &str) -> Result<(), ScriptError> {
        Err(ScriptError::Unsupported("tag"))
    }

    /// Next deterministic random value in `[0, n)`.
    fn draw(&mut self, _n: u32) -> Result<u32, ScriptError> {
        Err(ScriptError::Unsupported("rng"))
    }

    /// Count of tagged mutations (`None`), of mutations carrying a tag, or
    /// of mutations not carrying it (`!` prefix).
    fn tag_count(&mut self, _tag: Option<&str>) -> Result<i64, ScriptError> {
        Err(ScriptError::Unsupported("tags"))
    }

    /// Emit one line of report output.
    fn print_line(&mut self, _line: &str) -> Result<(), ScriptError> {
        Err(ScriptError::Unsupported("print"))
    }
}

/// Result of running a whole procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every statement ran.
    Completed,
    /// Evaluation stopped at `result(test)` with no cached result.
    Pending(String),
}

/// Runtime value.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Int(i64),
    Str(String),
    Var(String),
    Call { name: String, args: Vec<Expr> },
    Not(Box<Expr>),
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    Assign { name: String, expr: Expr },
    Tag(Expr),
    Print(Vec<Expr>),
    If { cond: Expr, body: Box<Stmt> },
}

/// A parsed procedure body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    stmts: Vec<Stmt>,
}

impl Program {
    /// True when the body has no statements.
    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    Assign,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    LParen,
    RParen,
    Colon,
    Comma,
    Plus,
    Minus,
}

fn lex(line: usize, text: &str) -> Result<Vec<Token>, ScriptError> {
    let err = |message: String| ScriptError::Parse { line, message };
    let bytes: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            ' ' | '\t' => i += 1,
            '#' => break,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    tokens.push(Token::Assign);
                    i += 1;
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(err("expected `&&`".to_string()));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(err("expected `||`".to_string()));
                }
            }
            '"' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                        None => return Err(err("unterminated string literal".to_string())),
                    }
                }
                tokens.push(Token::Str(value));
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let digits: String = bytes[start..i].iter().collect();
                let value = digits
                    .parse::<i64>()
                    .map_err(|_| err(format!("integer literal `{digits}` out of range")))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(bytes[start..i].iter().collect()));
            }
            other => return Err(err(format!("unexpected character `{other}`"))),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    line: usize,
}

impl Parser {
    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token, what: &str) -> Result<(), ScriptError> {
        match self.next() {
            Some(token) if token == *expected => Ok(()),
            _ => Err(self.error(format!("expected {what}"))),
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ScriptError> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => match name.as_str() {
                "if" => {
                    self.next();
                    let cond = self.parse_expr()?;
                    self.eat(&Token::Colon, "`:` after if condition")?;
                    let body = self.parse_stmt()?;
                    Ok(Stmt::If {
                        cond,
                        body: Box::new(body),
                    })
                }
                "tag" => {
                    self.next();
                    self.eat(&Token::LParen, "`(` after tag")?;
                    let arg = self.parse_expr()?;
                    self.eat(&Token::RParen, "`)` after tag argument")?;
                    Ok(Stmt::Tag(arg))
                }
                "print" => {
                    self.next();
                    self.eat(&Token::LParen, "`(` after print")?;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        args.push(self.parse_expr()?);
                        while self.peek() == Some(&Token::Comma) {
                            self.next();
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.eat(&Token::RParen, "`)` after print arguments")?;
                    Ok(Stmt::Print(args))
                }
                _ => {
                    self.next();
                    self.eat(&Token::Assign, "`=` in assignment")?;
                    let expr = self.parse_expr()?;
                    Ok(Stmt::Assign { name, expr })
                }
            },
            _ => Err(self.error("expected a statement")),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ScriptError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_cmp()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ScriptError> {
        let lhs = self.parse_sum()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.next();
        let rhs = self.parse_sum()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_sum(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ScriptError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let expr = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(expr)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ScriptError> {
        match self.next() {
            Some(Token::Int(value)) => Ok(Expr::Int(value)),
            Some(Token::Str(value)) => Ok(Expr::Str(value)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.eat(&Token::RParen, "closing `)`")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.next();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        args.push(self.parse_expr()?);
                        while self.peek() == Some(&Token::Comma) {
                            self.next();
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.eat(&Token::RParen, "closing `)` in call")?;
                    self.check_call(&name, args.len())?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Var(name))
                }
            }
            _ => Err(self.error("expected an expression")),
        }
    }

    fn check_call(&self, name: &str, arity: usize) -> Result<(), ScriptError> {
        let ok = match name {
            "result" | "rng" => arity == 1,
            "tags" => arity <= 1,
            _ => return Err(self.error(format!("unknown function `{name}`"))),
        };
        if ok {
            Ok(())
        } else {
            Err(self.error(format!("wrong number of arguments for `{name}`")))
        }
    }
}

/// Parse a procedure body from `(line number, text)` pairs.
///
/// Blank lines and `#` comments are skipped. Line numbers refer to the
/// enclosing configuration file and show up in parse diagnostics.
pub fn parse_program(lines: &[(usize, String)]) -> Result<Program, ScriptError> {
    let mut stmts = Vec::new();
    for (line, text) in lines {
        let tokens = lex(*line, text)?;
        if tokens.is_empty() {
            continue;
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            line: *line,
        };
        let stmt = parser.parse_stmt()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("trailing tokens after statement"));
        }
        stmts.push(stmt);
    }
    Ok(Program { stmts })
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Internal short-circuit signal: a pending fetch stops the run, anything
/// else is fatal. Modeled as a value so `?` can carry it out of the
/// expression walk.
enum EvalStop {
    Pending(String),
    Fatal(ScriptError),
}

impl From<ScriptError> for EvalStop {
    fn from(err: ScriptError) -> Self {
        EvalStop::Fatal(err)
    }
}

struct Evaluator<'a> {
    env: &'a mut dyn ScriptEnv,
    vars: BTreeMap<String, Value>,
}

impl Evaluator<'_> {
    fn run(&mut self, program: &Program) -> Result<(), EvalStop> {
        for stmt in &program.stmts {
            self.exec(stmt)?;
        }
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<(), EvalStop> {
        match stmt {
            Stmt::Assign { name, expr } => {
                let value = self.eval(expr)?;
                self.vars.insert(name.clone(), value);
            }
            Stmt::Tag(arg) => {
                let name = self.eval_str(arg)?;
                self.env.add_tag(&name)?;
            }
            Stmt::Print(args) => {
                let mut parts = Vec::with_capacity(args.len());
                for arg in args {
                    parts.push(self.eval(arg)?.to_string());
                }
                self.env.print_line(&parts.join(" "))?;
            }
            Stmt::If { cond, body } => {
                if self.eval_bool(cond)? {
                    self.exec(body)?;
                }
            }
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, EvalStop> {
        match expr {
            Expr::Int(value) => Ok(Value::Int(*value)),
            Expr::Str(value) => Ok(Value::Str(value.clone())),
            Expr::Var(name) => match self.vars.get(name) {
                Some(value) => Ok(value.clone()),
                None => Err(ScriptError::UnknownVariable(name.clone()).into()),
            },
            Expr::Call { name, args } => self.eval_call(name, args),
            Expr::Not(inner) => {
                let value = self.eval_bool(inner)?;
                Ok(Value::Bool(!value))
            }
            Expr::Binary { op, lhs, rhs } => self.eval_binary(op, lhs, rhs),
        }
    }

    fn eval_call(&mut self, name: &str, args: &[Expr]) -> Result<Value, EvalStop> {
        match name {
            "result" => {
                let test = self.eval_str(&args[0])?;
                match self.env.fetch_result(&test)? {
                    Some(token) => Ok(Value::Str(token)),
                    None => Err(EvalStop::Pending(test)),
                }
            }
            "rng" => {
                let bound = self.eval_int(&args[0])?;
                if bound <= 0 || bound > i64::from(u32::MAX) {
                    return Err(ScriptError::RngBound.into());
                }
                let value = self.env.draw(bound as u32)?;
                Ok(Value::Int(i64::from(value)))
            }
            "tags" => {
                let tag = match args.first() {
                    Some(arg) => Some(self.eval_str(arg)?),
                    None => None,
                };
                let count = self.env.tag_count(tag.as_deref())?;
                Ok(Value::Int(count))
            }
            // Unknown names are rejected at parse time.
            _ => Err(ScriptError::Unsupported("call").into()),
        }
    }

    fn eval_binary(&mut self, op: &BinOp, lhs: &Expr, rhs: &Expr) -> Result<Value, EvalStop> {
        match op {
            BinOp::And => {
                let left = self.eval_bool(lhs)?;
                if !left {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval_bool(rhs)?))
            }
            BinOp::Or => {
                let left = self.eval_bool(lhs)?;
                if left {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval_bool(rhs)?))
            }
            BinOp::Eq | BinOp::Ne => {
                let left = self.eval(lhs)?;
                let right = self.eval(rhs)?;
                let equal = match (&left, &right) {
                    (Value::Int(a), Value::Int(b)) => a == b,
                    (Value::Str(a), Value::Str(b)) => a == b,
                    (Value::Bool(a), Value::Bool(b)) => a == b,
                    _ => {
                        return Err(ScriptError::Type(format!(
                            "cannot compare {} with {}",
                            left.type_name(),
                            right.type_name()
                        ))
                        .into());
                    }
                };
                Ok(Value::Bool(if *op == BinOp::Eq { equal } else { !equal }))
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let left = self.eval_int(lhs)?;
                let right = self.eval_int(rhs)?;
                let value = match op {
                    BinOp::Lt => left < right,
                    BinOp::Le => left <= right,
                    BinOp::Gt => left > right,
                    _ => left >= right,
                };
                Ok(Value::Bool(value))
            }
            BinOp::Add | BinOp::Sub => {
                let left = self.eval_int(lhs)?;
                let right = self.eval_int(rhs)?;
                let value = if *op == BinOp::Add {
                    left.wrapping_add(right)
                } else {
                    left.wrapping_sub(right)
                };
                Ok(Value::Int(value))
            }
        }
    }

    fn eval_str(&mut self, expr: &Expr) -> Result<String, EvalStop> {
        match self.eval(expr)? {
            Value::Str(value) => Ok(value),
            other => {
                Err(ScriptError::Type(format!("expected string, got {}", other.type_name())).into())
            }
        }
    }

    fn eval_int(&mut self, expr: &Expr) -> Result<i64, EvalStop> {
        match self.eval(expr)? {
            Value::Int(value) => Ok(value),
            other => {
                Err(ScriptError::Type(format!("expected int, got {}", other.type_name())).into())
            }
        }
    }

    fn eval_bool(&mut self, expr: &Expr) -> Result<bool, EvalStop> {
        match self.eval(expr)? {
            Value::Bool(value) => Ok(value),
            other => {
                Err(ScriptError::Type(format!("expected bool, got {}", other.type_name())).into())
            }
        }
    }
}

/// Run a parsed procedure against an environment.
///
/// A missing `result(...)` fetch yields [`Outcome::Pending`]; every other
/// failure is fatal.
pub fn run_program(program: &Program, env: &mut dyn ScriptEnv) -> Result<Outcome, ScriptError> {
    let mut evaluator = Evaluator {
        env,
        vars: BTreeMap::new(),
    };
    match evaluator.run(program) {
        Ok(()) => Ok(Outcome::Completed),
        Err(EvalStop::Pending(test)) => Ok(Outcome::Pending(test)),
        Err(EvalStop::Fatal(err)) => Err(err),
    }
}
