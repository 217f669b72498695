//! Guard and action expressions.
//!
//! Guards are boolean expressions over context variables. Actions are
//! newline (or `;`) separated statements. Both are tokenized and parsed once,
//! when the model is built; evaluation lives in [`crate::context`].
//!
//! The expression language supports:
//!
//! - literals: `1`, `0.5`, `"text"`, `'text'`, `true`, `false`
//! - variables: `elapsed_time`
//! - trigger access: `event.name`, `event.amount`
//! - arithmetic: `+ - * / %`, unary `-`
//! - comparison: `== != < <= > >=`
//! - logic: `&&` / `and`, `||` / `or`, `!` / `not`
//! - predicates: `after(seconds)`, `idle(seconds)`, `active("state")`
//! - grouping: `(expr)`
//!
//! Statements:
//!
//! - `x = expr`, `x += expr`, `x -= expr`, `x *= expr`, `x /= expr`
//! - `send("name", key=expr, ...)`
//!
//! Examples:
//! - `after(1)` - one second spent in the source state
//! - `count > 3 and not active("paused")`
//! - `elapsed_time += 1`
//! - `send("refresh", time=elapsed_time)`

use crate::error::ModelError;
use crate::value::Value;
use std::fmt;

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// Built-in predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// `after(d)`: time spent in the source state is at least `d`.
    After,
    /// `idle(d)`: time since the last consumed event is at least `d`.
    Idle,
    /// `active(name)`: the named state is in the configuration.
    Active,
}

impl Builtin {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "after" => Some(Builtin::After),
            "idle" => Some(Builtin::Idle),
            "active" => Some(Builtin::Active),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::After => "after",
            Builtin::Idle => "idle",
            Builtin::Active => "active",
        }
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    /// `event.name` or a payload field of the trigger.
    EventField(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Builtin, Box<Expr>),
}

impl Expr {
    /// Whether the expression calls `after` or `idle`.
    pub fn depends_on_time(&self) -> bool {
        match self {
            Expr::Call(Builtin::After | Builtin::Idle, _) => true,
            Expr::Call(_, arg) | Expr::Unary(_, arg) => arg.depends_on_time(),
            Expr::Binary(_, lhs, rhs) => lhs.depends_on_time() || rhs.depends_on_time(),
            Expr::Literal(_) | Expr::Var(_) | Expr::EventField(_) => false,
        }
    }
}

/// A single action statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `target = value`, or `target op= value` when `op` is set.
    Assign {
        target: String,
        op: Option<BinaryOp>,
        value: Expr,
    },
    /// `send(event, key=value, ...)`.
    Send {
        event: Expr,
        args: Vec<(String, Expr)>,
    },
}

/// A guard: source text plus its parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    source: String,
    expr: Expr,
}

impl Guard {
    /// Parses a guard expression.
    pub fn parse(source: &str) -> Result<Self, ModelError> {
        let expr = parse_with(source, |p| {
            let expr = p.parse_expr()?;
            p.skip_separators();
            p.expect_end()?;
            Ok(expr)
        })?;
        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Whether the guard reads the clock through `after` or `idle`.
    pub fn is_timed(&self) -> bool {
        self.expr.depends_on_time()
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// An action: source text plus its parsed statements.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    source: String,
    statements: Vec<Statement>,
}

impl Action {
    /// Parses a sequence of statements.
    pub fn parse(source: &str) -> Result<Self, ModelError> {
        let statements = parse_with(source, |p| {
            let mut statements = Vec::new();
            p.skip_separators();
            while !p.at_end() {
                statements.push(p.parse_statement()?);
                if !p.at_end() && !p.at_separator() {
                    return Err(format!(
                        "expected end of statement, found {}",
                        p.describe_current()
                    ));
                }
                p.skip_separators();
            }
            Ok(statements)
        })?;
        Ok(Self {
            source: source.trim().to_string(),
            statements,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_with<T>(
    source: &str,
    f: impl FnOnce(&mut Parser) -> Result<T, String>,
) -> Result<T, ModelError> {
    let invalid = |reason: String| ModelError::InvalidExpression {
        source_text: source.trim().to_string(),
        reason,
    };

    if source.trim().is_empty() {
        return Err(invalid("empty expression".to_string()));
    }

    let tokens = tokenize(source).map_err(invalid)?;
    let mut parser = Parser { tokens, pos: 0 };
    f(&mut parser).map_err(invalid)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Bool(bool),
    Ident(String),
    LParen,
    RParen,
    Comma,
    Dot,
    Assign,
    CompoundAssign(BinaryOp),
    Op(BinaryOp),
    Not,
    Separator,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("number {}", n),
            Token::Str(s) => format!("string {:?}", s),
            Token::Bool(b) => format!("'{}'", b),
            Token::Ident(s) => format!("'{}'", s),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Dot => "'.'".to_string(),
            Token::Assign => "'='".to_string(),
            Token::CompoundAssign(op) => format!("'{}='", op.symbol()),
            Token::Op(op) => format!("'{}'", op.symbol()),
            Token::Not => "'!'".to_string(),
            Token::Separator => "end of line".to_string(),
        }
    }
}

/// Splits source text into tokens. Newlines inside parentheses are whitespace.
fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match c {
            '\n' | ';' => {
                if depth == 0 {
                    tokens.push(Token::Separator);
                } else if c == ';' {
                    return Err("unexpected ';' inside parentheses".to_string());
                }
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '(' => {
                depth += 1;
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                if depth == 0 {
                    return Err("unbalanced ')'".to_string());
                }
                depth -= 1;
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '"' | '\'' => {
                let (s, len) = lex_string(&chars[i..])?;
                tokens.push(Token::Str(s));
                i += len;
            }
            c if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i < chars.len() && chars[i] == '.' {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number: '{}'", text))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" | "True" => Token::Bool(true),
                    "false" | "False" => Token::Bool(false),
                    "and" => Token::Op(BinaryOp::And),
                    "or" => Token::Op(BinaryOp::Or),
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            _ => {
                let (token, len) = match (c, next) {
                    ('=', Some('=')) => (Token::Op(BinaryOp::Eq), 2),
                    ('!', Some('=')) => (Token::Op(BinaryOp::Ne), 2),
                    ('<', Some('=')) => (Token::Op(BinaryOp::Le), 2),
                    ('>', Some('=')) => (Token::Op(BinaryOp::Ge), 2),
                    ('&', Some('&')) => (Token::Op(BinaryOp::And), 2),
                    ('|', Some('|')) => (Token::Op(BinaryOp::Or), 2),
                    ('+', Some('=')) => (Token::CompoundAssign(BinaryOp::Add), 2),
                    ('-', Some('=')) => (Token::CompoundAssign(BinaryOp::Sub), 2),
                    ('*', Some('=')) => (Token::CompoundAssign(BinaryOp::Mul), 2),
                    ('/', Some('=')) => (Token::CompoundAssign(BinaryOp::Div), 2),
                    ('=', _) => (Token::Assign, 1),
                    ('!', _) => (Token::Not, 1),
                    ('<', _) => (Token::Op(BinaryOp::Lt), 1),
                    ('>', _) => (Token::Op(BinaryOp::Gt), 1),
                    ('+', _) => (Token::Op(BinaryOp::Add), 1),
                    ('-', _) => (Token::Op(BinaryOp::Sub), 1),
                    ('*', _) => (Token::Op(BinaryOp::Mul), 1),
                    ('/', _) => (Token::Op(BinaryOp::Div), 1),
                    ('%', _) => (Token::Op(BinaryOp::Rem), 1),
                    _ => return Err(format!("unexpected character '{}'", c)),
                };
                tokens.push(token);
                i += len;
            }
        }
    }

    if depth != 0 {
        return Err("expected ')'".to_string());
    }

    Ok(tokens)
}

/// Lexes a quoted string starting at `chars[0]`; returns the value and consumed length.
fn lex_string(chars: &[char]) -> Result<(String, usize), String> {
    let quote = chars[0];
    let mut out = String::new();
    let mut i = 1;

    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((out, i + 1)),
            '\\' => {
                let escaped = chars.get(i + 1).ok_or("unterminated string")?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }

    Err("unterminated string".to_string())
}

/// Recursive descent parser over tokens.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn parse_statement(&mut self) -> Result<Statement, String> {
        let name = match self.peek() {
            Some(Token::Ident(name)) => name.clone(),
            _ => {
                return Err(format!(
                    "expected a statement, found {}",
                    self.describe_current()
                ))
            }
        };
        self.pos += 1;

        match self.peek() {
            Some(Token::LParen) if name == "send" => {
                self.pos += 1;
                self.parse_send()
            }
            Some(Token::Assign) => {
                self.pos += 1;
                let value = self.parse_expr()?;
                Ok(Statement::Assign {
                    target: name,
                    op: None,
                    value,
                })
            }
            Some(Token::CompoundAssign(op)) => {
                let op = *op;
                self.pos += 1;
                let value = self.parse_expr()?;
                Ok(Statement::Assign {
                    target: name,
                    op: Some(op),
                    value,
                })
            }
            _ => Err(format!(
                "expected '=' or a compound assignment after '{}', found {}",
                name,
                self.describe_current()
            )),
        }
    }

    fn parse_send(&mut self) -> Result<Statement, String> {
        if self.peek() == Some(&Token::RParen) {
            return Err("send() requires an event name".to_string());
        }
        let event = self.parse_expr()?;
        let mut args = Vec::new();

        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
            let key = match self.peek() {
                Some(Token::Ident(key)) => key.clone(),
                _ => {
                    return Err(format!(
                        "expected a parameter name, found {}",
                        self.describe_current()
                    ))
                }
            };
            self.pos += 1;
            if self.peek() != Some(&Token::Assign) {
                return Err(format!("expected '=' after parameter '{}'", key));
            }
            self.pos += 1;
            args.push((key, self.parse_expr()?));
        }

        self.expect(&Token::RParen)?;
        Ok(Statement::Send { event, args })
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Op(BinaryOp::Or)) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::Op(BinaryOp::And)) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_not()?; // allows `!!x`
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::Op(
                op @ (BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge),
            )) => *op,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_term()?;
        while let Some(Token::Op(op @ (BinaryOp::Add | BinaryOp::Sub))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while let Some(Token::Op(op @ (BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem))) =
            self.peek()
        {
            let op = *op;
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Op(BinaryOp::Sub)) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| "unexpected end of expression".to_string())?;
        self.pos += 1;

        match token {
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::Bool(b) => Ok(Expr::Literal(Value::Bool(b))),
            Token::LParen => {
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(expr)
            }
            Token::Ident(name) if name == "event" && self.peek() == Some(&Token::Dot) => {
                self.pos += 1;
                match self.peek().cloned() {
                    Some(Token::Ident(field)) => {
                        self.pos += 1;
                        Ok(Expr::EventField(field))
                    }
                    _ => Err("expected a field name after 'event.'".to_string()),
                }
            }
            Token::Ident(name) if self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                let builtin =
                    Builtin::lookup(&name).ok_or_else(|| format!("unknown function '{}'", name))?;
                if self.peek() == Some(&Token::RParen) {
                    return Err(format!("{}() expects 1 argument, got 0", name));
                }
                let arg = self.parse_expr()?;
                if self.peek() == Some(&Token::Comma) {
                    return Err(format!("{}() expects 1 argument", name));
                }
                self.expect(&Token::RParen)?;
                Ok(Expr::Call(builtin, Box::new(arg)))
            }
            Token::Ident(name) => Ok(Expr::Var(name)),
            other => Err(format!("unexpected {}", other.describe())),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expect(&mut self, token: &Token) -> Result<(), String> {
        if self.peek() == Some(token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!(
                "expected {}, found {}",
                token.describe(),
                self.describe_current()
            ))
        }
    }

    fn expect_end(&self) -> Result<(), String> {
        if self.at_end() {
            Ok(())
        } else {
            Err(format!("unexpected {}", self.describe_current()))
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn at_separator(&self) -> bool {
        self.peek() == Some(&Token::Separator)
    }

    fn skip_separators(&mut self) {
        while self.at_separator() {
            self.pos += 1;
        }
    }

    fn describe_current(&self) -> String {
        self.peek()
            .map(Token::describe)
            .unwrap_or_else(|| "end of input".to_string())
    }
}
