//! Compile-once expressions over request data.
//!
//! Two forms are supported:
//! - templates (`/v2/orders/$(param.id)?src=$(query.src)`) rendered for URL
//!   rewrites;
//! - conditions (`header.x-canary == "1" && attr.client_real_ip ^= "10."`)
//!   evaluated by routing rules.
//!
//! Variables: `origin.path`, `origin.query`, `origin.method`, `origin.host`,
//! `query.<name>`, `header.<name>`, `cookie.<name>`, `param.<name>`,
//! `attr.<name>`.

use regex::Regex;
use std::borrow::Cow;
use std::collections::HashMap;
use thiserror::Error;

use crate::context::DispatchRequest;

/// Expression compilation or evaluation failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("invalid expression '{expr}': {reason}")]
    Parse { expr: String, reason: String },
    #[error("value of '{0}' is not valid UTF-8")]
    InvalidValue(String),
}

fn parse_error(expr: &str, reason: impl Into<String>) -> ExprError {
    ExprError::Parse {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

/// Borrowed view of everything an expression can read
#[derive(Debug, Clone, Copy)]
pub struct ExprContext<'a> {
    pub request: &'a DispatchRequest,
    pub params: &'a [(String, String)],
    pub attrs: &'a HashMap<String, String>,
}

impl<'a> ExprContext<'a> {
    pub fn param(&self, name: &str) -> Option<&'a str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn attr(&self, name: &str) -> Option<&'a str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// A value an expression can read from the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variable {
    OriginPath,
    OriginQuery,
    OriginMethod,
    OriginHost,
    Query(String),
    Header(String),
    Cookie(String),
    Param(String),
    Attr(String),
}

impl Variable {
    fn parse(source: &str, expr: &str) -> Result<Self, ExprError> {
        let source = source.trim();
        let variable = match source {
            "origin.path" => Variable::OriginPath,
            "origin.query" => Variable::OriginQuery,
            "origin.method" => Variable::OriginMethod,
            "origin.host" => Variable::OriginHost,
            _ => {
                let (scope, name) = source
                    .split_once('.')
                    .filter(|(_, name)| !name.is_empty())
                    .ok_or_else(|| parse_error(expr, format!("unknown variable '{}'", source)))?;
                let name = name.to_string();
                match scope {
                    "query" => Variable::Query(name),
                    "header" => Variable::Header(name.to_ascii_lowercase()),
                    "cookie" => Variable::Cookie(name),
                    "param" => Variable::Param(name),
                    "attr" => Variable::Attr(name),
                    _ => {
                        return Err(parse_error(
                            expr,
                            format!("unknown variable scope '{}'", scope),
                        ))
                    }
                }
            }
        };
        Ok(variable)
    }

    /// Resolve the variable; `Ok(None)` when the request does not carry it
    pub fn resolve<'a>(&self, ctx: &ExprContext<'a>) -> Result<Option<Cow<'a, str>>, ExprError> {
        let request = ctx.request;
        let value = match self {
            Variable::OriginPath => Some(Cow::Borrowed(request.path())),
            Variable::OriginQuery => request.query().map(Cow::Borrowed),
            Variable::OriginMethod => Some(Cow::Borrowed(request.method())),
            Variable::OriginHost => request.host().map(Cow::Borrowed),
            Variable::Query(name) => request.query_param(name),
            Variable::Header(name) => match request.header.headers.get(name.as_str()) {
                Some(value) => Some(Cow::Borrowed(
                    value
                        .to_str()
                        .map_err(|_| ExprError::InvalidValue(format!("header.{}", name)))?,
                )),
                None => None,
            },
            Variable::Cookie(name) => request.cookie(name).map(Cow::Borrowed),
            Variable::Param(name) => ctx.param(name).map(Cow::Borrowed),
            Variable::Attr(name) => ctx.attr(name).map(Cow::Borrowed),
        };
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Text(String),
    Var(Variable),
}

/// Compiled rewrite template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    parts: Vec<Part>,
}

impl Template {
    /// Compile a template made of text and `$(variable)` references
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let mut parts = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("$(") {
            if start > 0 {
                parts.push(Part::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find(')')
                .ok_or_else(|| parse_error(source, "unclosed '$('"))?;
            parts.push(Part::Var(Variable::parse(&after[..end], source)?));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Text(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            parts,
        })
    }

    /// Render against a request; unavailable variables render empty
    pub fn render(&self, ctx: &ExprContext<'_>) -> String {
        let mut out = String::with_capacity(self.source.len());
        for part in &self.parts {
            match part {
                Part::Text(text) => out.push_str(text),
                Part::Var(variable) => {
                    if let Ok(Some(value)) = variable.resolve(ctx) {
                        out.push_str(&value);
                    }
                }
            }
        }
        out
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Prefix,
    Regex,
}

impl Op {
    const ALL: [(&'static str, Op); 4] = [
        ("==", Op::Eq),
        ("!=", Op::Ne),
        ("^=", Op::Prefix),
        ("~=", Op::Regex),
    ];
}

#[derive(Debug, Clone)]
struct Clause {
    variable: Variable,
    op: Op,
    literal: String,
    regex: Option<Regex>,
}

impl Clause {
    fn parse(clause: &str, expr: &str) -> Result<Self, ExprError> {
        let (index, token, op) = Op::ALL
            .iter()
            .filter_map(|(token, op)| clause.find(token).map(|i| (i, *token, *op)))
            .min_by_key(|(i, _, _)| *i)
            .ok_or_else(|| parse_error(expr, format!("no operator in '{}'", clause.trim())))?;

        let variable = Variable::parse(&clause[..index], expr)?;
        let literal = unquote(clause[index + token.len()..].trim())
            .ok_or_else(|| parse_error(expr, "right-hand side must be a quoted string"))?;

        let regex = match op {
            Op::Regex => Some(
                Regex::new(&literal).map_err(|e| parse_error(expr, e.to_string()))?,
            ),
            _ => None,
        };

        Ok(Self {
            variable,
            op,
            literal,
            regex,
        })
    }

    fn eval(&self, ctx: &ExprContext<'_>) -> Result<bool, ExprError> {
        let value = self.variable.resolve(ctx)?;
        let matched = match (self.op, value) {
            (Op::Ne, None) => true,
            (_, None) => false,
            (Op::Eq, Some(value)) => value == self.literal.as_str(),
            (Op::Ne, Some(value)) => value != self.literal.as_str(),
            (Op::Prefix, Some(value)) => value.starts_with(self.literal.as_str()),
            (Op::Regex, Some(value)) => self
                .regex
                .as_ref()
                .is_some_and(|regex| regex.is_match(&value)),
        };
        Ok(matched)
    }
}

/// Split on `&&` outside quoted literals
fn split_clauses(source: &str) -> Vec<&str> {
    let mut clauses = Vec::new();
    let mut quote = None;
    let mut start = 0;
    let mut chars = source.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(open), _) if c == open => quote = None,
            (None, '&') if matches!(chars.peek(), Some((_, '&'))) => {
                clauses.push(&source[start..i]);
                chars.next();
                start = i + 2;
            }
            _ => {}
        }
    }
    clauses.push(&source[start..]);
    clauses
}

fn unquote(literal: &str) -> Option<String> {
    let inner = literal
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| literal.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))?;
    Some(inner.to_string())
}

/// Compiled boolean condition: clauses joined by `&&`
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    clauses: Vec<Clause>,
}

impl Condition {
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let clauses = split_clauses(source)
            .into_iter()
            .map(|clause| Clause::parse(clause, source))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source: source.to_string(),
            clauses,
        })
    }

    /// All clauses must hold; evaluation stops at the first false clause
    pub fn eval(&self, ctx: &ExprContext<'_>) -> Result<bool, ExprError> {
        for clause in &self.clauses {
            if !clause.eval(ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}
