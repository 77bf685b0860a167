// Weft - Peer-to-peer resource sharing fabric: CPU, memory and storage pooling over a minimal length-framed protocol
// Copyright (C) 2026  weft contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Task execution without arbitrary code: programs are written in a small
//! expression language, parsed up front and evaluated over [`Value`]s.
//!
//! A program is a sequence of lines, each either a function definition
//!
//! ```text
//! def main(n): return n * n
//! ```
//!
//! or a constant binding `name = expr`. Expressions cover arithmetic,
//! comparison, boolean logic, `x if cond else y`, list literals, indexing
//! and calls to builtins or other defined functions. Evaluation carries a
//! step budget and a recursion cap, and polls the task's cancel flag at
//! step-count boundaries so cancellation interrupts in-flight work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while};
use nom::character::complete::{alpha1, alphanumeric1, char, digit1, space0};
use nom::combinator::{all_consuming, map, map_res, opt, recognize, verify};
use nom::multi::{many0, separated_list0};
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;
use serde::Serialize;

use crate::error::{WeftError, WeftResult};
use crate::proto::TaskSpec;
use crate::value::Value;

const STEP_BUDGET: u64 = 5_000_000;
const MAX_CALL_DEPTH: usize = 64;
const CANCEL_POLL_MASK: u64 = 0x3ff;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Cooperative cancellation token shared between the scheduler wrapper and
/// the evaluator.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns true only for the first caller to set the flag.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Seam between schedulers and whatever evaluates tasks.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &TaskSpec, cancel: &CancelFlag) -> WeftResult<Value>;
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Var(String),
    ListLit(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    /// Short-circuit `and` / `or`, evaluating to an operand python-style.
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// `then if cond else otherwise`
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
struct FunctionDef {
    params: Vec<String>,
    body: Expr,
}

#[derive(Debug, Clone)]
enum Item {
    Function(FunctionDef),
    Binding(Expr),
}

/// A parsed program: named functions and constant bindings.
#[derive(Debug, Clone)]
pub struct Program {
    items: HashMap<String, Item>,
}

const KEYWORDS: &[&str] = &[
    "def", "return", "if", "else", "and", "or", "not", "true", "false", "True", "False",
    "None", "null",
];

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    verify(identifier, move |s: &str| s == word)
}

/// An identifier that is not a reserved word.
fn name(input: &str) -> IResult<&str, String> {
    map(
        verify(identifier, |s: &str| !KEYWORDS.contains(&s)),
        String::from,
    )(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    map_res(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        |text: &str| -> Result<Expr, std::num::ParseFloatError> {
            if text.contains('.') {
                Ok(Expr::Literal(Value::Float(text.parse::<f64>()?)))
            } else {
                match text.parse::<i64>() {
                    Ok(n) => Ok(Expr::Literal(Value::Int(n))),
                    Err(_) => Ok(Expr::Literal(Value::Float(text.parse::<f64>()?))),
                }
            }
        },
    )(input)
}

fn string_literal(input: &str) -> IResult<&str, Expr> {
    map(
        alt((
            delimited(char('"'), take_while(|c| c != '"'), char('"')),
            delimited(char('\''), take_while(|c| c != '\''), char('\'')),
        )),
        |s: &str| Expr::Literal(Value::Str(s.to_string())),
    )(input)
}

fn literal_word(input: &str) -> IResult<&str, Expr> {
    alt((
        map(alt((keyword("true"), keyword("True"))), |_| {
            Expr::Literal(Value::Bool(true))
        }),
        map(alt((keyword("false"), keyword("False"))), |_| {
            Expr::Literal(Value::Bool(false))
        }),
        map(alt((keyword("None"), keyword("null"))), |_| {
            Expr::Literal(Value::Null)
        }),
    ))(input)
}

fn list_literal(input: &str) -> IResult<&str, Expr> {
    map(
        delimited(
            pair(char('['), space0),
            separated_list0(delimited(space0, char(','), space0), expr),
            pair(space0, char(']')),
        ),
        Expr::ListLit,
    )(input)
}

fn call_or_var(input: &str) -> IResult<&str, Expr> {
    let (input, ident) = name(input)?;
    let (input, args) = opt(delimited(
        pair(char('('), space0),
        separated_list0(delimited(space0, char(','), space0), expr),
        pair(space0, char(')')),
    ))(input)?;

    Ok((
        input,
        match args {
            Some(args) => Expr::Call(ident, args),
            None => Expr::Var(ident),
        },
    ))
}

fn primary(input: &str) -> IResult<&str, Expr> {
    preceded(
        space0,
        alt((
            number,
            string_literal,
            literal_word,
            list_literal,
            delimited(pair(char('('), space0), expr, pair(space0, char(')'))),
            call_or_var,
        )),
    )(input)
}

fn postfix(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut base) = primary(input)?;

    loop {
        let attempt: IResult<&str, Expr> = preceded(
            space0,
            delimited(pair(char('['), space0), expr, pair(space0, char(']'))),
        )(input);

        match attempt {
            Ok((rest, index)) => {
                base = Expr::Index(Box::new(base), Box::new(index));
                input = rest;
            }
            Err(_) => break,
        }
    }

    Ok((input, base))
}

fn unary(input: &str) -> IResult<&str, Expr> {
    let (input, _) = space0(input)?;
    alt((
        map(preceded(pair(char('-'), space0), unary), |e| {
            Expr::Unary(UnaryOp::Neg, Box::new(e))
        }),
        map(preceded(keyword("not"), unary), |e| {
            Expr::Unary(UnaryOp::Not, Box::new(e))
        }),
        postfix,
    ))(input)
}

fn term(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut lhs) = unary(input)?;

    loop {
        let attempt: IResult<&str, (char, Expr)> = tuple((
            preceded(space0, alt((char('*'), char('/'), char('%')))),
            unary,
        ))(input);

        match attempt {
            Ok((rest, (op, rhs))) => {
                let op = match op {
                    '*' => BinOp::Mul,
                    '/' => BinOp::Div,
                    _ => BinOp::Mod,
                };
                lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
                input = rest;
            }
            Err(_) => break,
        }
    }

    Ok((input, lhs))
}

fn additive(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut lhs) = term(input)?;

    loop {
        let attempt: IResult<&str, (char, Expr)> =
            tuple((preceded(space0, alt((char('+'), char('-')))), term))(input);

        match attempt {
            Ok((rest, (op, rhs))) => {
                let op = if op == '+' { BinOp::Add } else { BinOp::Sub };
                lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
                input = rest;
            }
            Err(_) => break,
        }
    }

    Ok((input, lhs))
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, lhs) = additive(input)?;

    let attempt: IResult<&str, (&str, Expr)> = tuple((
        preceded(
            space0,
            alt((
                tag("=="),
                tag("!="),
                tag("<="),
                tag(">="),
                tag("<"),
                tag(">"),
            )),
        ),
        additive,
    ))(input);

    match attempt {
        Ok((rest, (op, rhs))) => {
            let op = match op {
                "==" => BinOp::Eq,
                "!=" => BinOp::Ne,
                "<=" => BinOp::Le,
                ">=" => BinOp::Ge,
                "<" => BinOp::Lt,
                _ => BinOp::Gt,
            };
            Ok((rest, Expr::Binary(op, Box::new(lhs), Box::new(rhs))))
        }
        Err(_) => Ok((input, lhs)),
    }
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut lhs) = comparison(input)?;

    loop {
        let attempt: IResult<&str, Expr> =
            preceded(preceded(space0, keyword("and")), comparison)(input);
        match attempt {
            Ok((rest, rhs)) => {
                lhs = Expr::And(Box::new(lhs), Box::new(rhs));
                input = rest;
            }
            Err(_) => break,
        }
    }

    Ok((input, lhs))
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut lhs) = and_expr(input)?;

    loop {
        let attempt: IResult<&str, Expr> =
            preceded(preceded(space0, keyword("or")), and_expr)(input);
        match attempt {
            Ok((rest, rhs)) => {
                lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
                input = rest;
            }
            Err(_) => break,
        }
    }

    Ok((input, lhs))
}

fn expr(input: &str) -> IResult<&str, Expr> {
    let (input, then) = or_expr(input)?;

    let attempt: IResult<&str, (Expr, Expr)> = tuple((
        preceded(preceded(space0, keyword("if")), or_expr),
        preceded(preceded(space0, keyword("else")), expr),
    ))(input);

    match attempt {
        Ok((rest, (cond, otherwise))) => Ok((
            rest,
            Expr::Cond(Box::new(then), Box::new(cond), Box::new(otherwise)),
        )),
        Err(_) => Ok((input, then)),
    }
}

fn def_line(input: &str) -> IResult<&str, (String, FunctionDef)> {
    let (input, _) = keyword("def")(input)?;
    let (input, _) = space0(input)?;
    let (input, fn_name) = name(input)?;
    let (input, params) = delimited(
        pair(char('('), space0),
        separated_list0(delimited(space0, char(','), space0), name),
        pair(space0, char(')')),
    )(input)?;
    let (input, _) = preceded(space0, char(':'))(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = opt(pair(keyword("return"), space0))(input)?;
    let (input, body) = expr(input)?;

    Ok((input, (fn_name, FunctionDef { params, body })))
}

fn binding_line(input: &str) -> IResult<&str, (String, Expr)> {
    let (input, ident) = preceded(space0, name)(input)?;
    let (input, _) = preceded(space0, char('='))(input)?;
    // A lone '=' only; '==' belongs to expressions.
    let (input, _) = nom::combinator::not(char('='))(input)?;
    let (input, value) = expr(input)?;
    Ok((input, (ident, value)))
}

impl Program {
    pub fn parse(source: &str) -> WeftResult<Self> {
        let mut items = HashMap::new();

        for (line_no, raw) in source.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with("def ") || line == "def" {
                let (fn_name, def) = all_consuming(def_line)(line)
                    .map(|(_, d)| d)
                    .map_err(|_| {
                        WeftError::Execution(format!(
                            "syntax error in definition at line {}",
                            line_no + 1
                        ))
                    })?;
                items.insert(fn_name, Item::Function(def));
            } else {
                let (ident, value) = all_consuming(binding_line)(line)
                    .map(|(_, b)| b)
                    .map_err(|_| {
                        WeftError::Execution(format!("syntax error at line {}", line_no + 1))
                    })?;
                items.insert(ident, Item::Binding(value));
            }
        }

        if items.is_empty() {
            return Err(WeftError::Execution("no program code provided".to_string()));
        }

        Ok(Self { items })
    }

    /// Look up `function` and apply it to `args`.
    pub fn call(
        &self,
        function: &str,
        args: &[Value],
        cancel: Option<&CancelFlag>,
    ) -> WeftResult<Value> {
        let def = match self.items.get(function) {
            Some(Item::Function(def)) => def,
            Some(Item::Binding(_)) => {
                return Err(WeftError::NotCallable(function.to_string()))
            }
            None => return Err(WeftError::FunctionNotFound(function.to_string())),
        };

        if args.len() != def.params.len() {
            return Err(WeftError::Execution(format!(
                "{}() takes {} arguments, got {}",
                function,
                def.params.len(),
                args.len()
            )));
        }

        let mut evaluator = Evaluator {
            program: self,
            cancel,
            steps: 0,
        };

        let mut scope = HashMap::new();
        for (param, arg) in def.params.iter().zip(args) {
            scope.insert(param.clone(), arg.clone());
        }

        evaluator.eval(&def.body, &scope, 0)
    }
}

struct Evaluator<'a> {
    program: &'a Program,
    cancel: Option<&'a CancelFlag>,
    steps: u64,
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(n) => *n != 0,
        Value::Float(f) => *f != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::Bytes(b) => !b.is_empty(),
        Value::List(items) => !items.is_empty(),
        Value::Map(entries) => !entries.is_empty(),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_float(), b.as_float()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

impl<'a> Evaluator<'a> {
    fn tick(&mut self) -> WeftResult<()> {
        self.steps += 1;
        if self.steps > STEP_BUDGET {
            return Err(WeftError::Execution("step budget exhausted".to_string()));
        }
        if self.steps & CANCEL_POLL_MASK == 0 {
            if let Some(flag) = self.cancel {
                if flag.is_cancelled() {
                    return Err(WeftError::Cancelled);
                }
            }
        }
        Ok(())
    }

    fn eval(
        &mut self,
        expr: &Expr,
        scope: &HashMap<String, Value>,
        depth: usize,
    ) -> WeftResult<Value> {
        self.tick()?;

        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(ident) => self.lookup(ident, scope, depth),
            Expr::ListLit(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, scope, depth)?);
                }
                Ok(Value::List(out))
            }
            Expr::Unary(op, operand) => {
                let v = self.eval(operand, scope, depth)?;
                match op {
                    UnaryOp::Neg => match v {
                        Value::Int(n) => Ok(Value::Int(-n)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(WeftError::Execution(format!(
                            "cannot negate {}",
                            other
                        ))),
                    },
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let a = self.eval(lhs, scope, depth)?;
                let b = self.eval(rhs, scope, depth)?;
                self.binary(*op, a, b)
            }
            Expr::Index(base, index) => {
                let base = self.eval(base, scope, depth)?;
                let index = self.eval(index, scope, depth)?;
                self.index(base, index)
            }
            Expr::And(lhs, rhs) => {
                let a = self.eval(lhs, scope, depth)?;
                if truthy(&a) {
                    self.eval(rhs, scope, depth)
                } else {
                    Ok(a)
                }
            }
            Expr::Or(lhs, rhs) => {
                let a = self.eval(lhs, scope, depth)?;
                if truthy(&a) {
                    Ok(a)
                } else {
                    self.eval(rhs, scope, depth)
                }
            }
            Expr::Cond(then, cond, otherwise) => {
                let cond = self.eval(cond, scope, depth)?;
                if truthy(&cond) {
                    self.eval(then, scope, depth)
                } else {
                    self.eval(otherwise, scope, depth)
                }
            }
            Expr::Call(ident, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, scope, depth)?);
                }
                self.call(ident, values, depth)
            }
        }
    }

    fn lookup(
        &mut self,
        ident: &str,
        scope: &HashMap<String, Value>,
        depth: usize,
    ) -> WeftResult<Value> {
        if let Some(v) = scope.get(ident) {
            return Ok(v.clone());
        }
        match self.program.items.get(ident) {
            Some(Item::Binding(expr)) => {
                let expr = expr.clone();
                self.eval(&expr, &HashMap::new(), depth)
            }
            Some(Item::Function(_)) => Err(WeftError::Execution(format!(
                "function '{}' used as a value",
                ident
            ))),
            None => Err(WeftError::Execution(format!(
                "undefined name '{}'",
                ident
            ))),
        }
    }

    fn binary(&self, op: BinOp, a: Value, b: Value) -> WeftResult<Value> {
        use BinOp::*;

        match op {
            Eq => return Ok(Value::Bool(loose_eq(&a, &b))),
            Ne => return Ok(Value::Bool(!loose_eq(&a, &b))),
            _ => {}
        }

        // String and list concatenation.
        if op == Add {
            if let (Value::Str(x), Value::Str(y)) = (&a, &b) {
                return Ok(Value::Str(format!("{}{}", x, y)));
            }
            if let (Value::List(x), Value::List(y)) = (&a, &b) {
                let mut out = x.clone();
                out.extend(y.clone());
                return Ok(Value::List(out));
            }
        }

        if let (Value::Str(x), Value::Str(y)) = (&a, &b) {
            let verdict = match op {
                Lt => x < y,
                Le => x <= y,
                Gt => x > y,
                Ge => x >= y,
                _ => {
                    return Err(WeftError::Execution(
                        "unsupported string operation".to_string(),
                    ))
                }
            };
            return Ok(Value::Bool(verdict));
        }

        let (x, y) = match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                return Err(WeftError::Execution(format!(
                    "operands are not numbers: {} and {}",
                    a, b
                )))
            }
        };

        let both_int = matches!((&a, &b), (Value::Int(_), Value::Int(_)));

        let result = match op {
            Add => x + y,
            Sub => x - y,
            Mul => x * y,
            Div => {
                if y == 0.0 {
                    return Err(WeftError::Execution("division by zero".to_string()));
                }
                return Ok(Value::Float(x / y));
            }
            Mod => {
                if y == 0.0 {
                    return Err(WeftError::Execution("modulo by zero".to_string()));
                }
                x.rem_euclid(y)
            }
            Lt => return Ok(Value::Bool(x < y)),
            Le => return Ok(Value::Bool(x <= y)),
            Gt => return Ok(Value::Bool(x > y)),
            Ge => return Ok(Value::Bool(x >= y)),
            Eq | Ne => unreachable!(),
        };

        if both_int {
            Ok(Value::Int(result as i64))
        } else {
            Ok(Value::Float(result))
        }
    }

    fn index(&self, base: Value, index: Value) -> WeftResult<Value> {
        match (&base, &index) {
            (Value::List(items), Value::Int(i)) => {
                let len = items.len() as i64;
                let idx = if *i < 0 { i + len } else { *i };
                if idx < 0 || idx >= len {
                    return Err(WeftError::Execution(format!(
                        "list index {} out of range",
                        i
                    )));
                }
                Ok(items[idx as usize].clone())
            }
            (Value::Str(s), Value::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len() as i64;
                let idx = if *i < 0 { i + len } else { *i };
                if idx < 0 || idx >= len {
                    return Err(WeftError::Execution(format!(
                        "string index {} out of range",
                        i
                    )));
                }
                Ok(Value::Str(chars[idx as usize].to_string()))
            }
            (Value::Map(entries), Value::Str(key)) => entries
                .get(key)
                .cloned()
                .ok_or_else(|| WeftError::Execution(format!("key '{}' not found", key))),
            _ => Err(WeftError::Execution(format!(
                "cannot index {} with {}",
                base, index
            ))),
        }
    }

    fn call(&mut self, ident: &str, args: Vec<Value>, depth: usize) -> WeftResult<Value> {
        if let Some(result) = self.builtin(ident, &args)? {
            return Ok(result);
        }

        let def = match self.program.items.get(ident) {
            Some(Item::Function(def)) => def.clone(),
            Some(Item::Binding(_)) => return Err(WeftError::NotCallable(ident.to_string())),
            None => return Err(WeftError::FunctionNotFound(ident.to_string())),
        };

        if depth >= MAX_CALL_DEPTH {
            return Err(WeftError::Execution(
                "recursion depth exceeded".to_string(),
            ));
        }

        if args.len() != def.params.len() {
            return Err(WeftError::Execution(format!(
                "{}() takes {} arguments, got {}",
                ident,
                def.params.len(),
                args.len()
            )));
        }

        let mut scope = HashMap::new();
        for (param, arg) in def.params.iter().zip(args) {
            scope.insert(param.clone(), arg);
        }

        self.eval(&def.body, &scope, depth + 1)
    }

    fn builtin(&self, ident: &str, args: &[Value]) -> WeftResult<Option<Value>> {
        let numbers = |args: &[Value]| -> WeftResult<Vec<f64>> {
            // A single list argument spreads, python-style min([1,2]).
            let items: Vec<Value> = match args {
                [Value::List(items)] => items.clone(),
                other => other.to_vec(),
            };
            items
                .iter()
                .map(|v| {
                    v.as_float().ok_or_else(|| {
                        WeftError::Execution(format!("expected a number, got {}", v))
                    })
                })
                .collect()
        };

        let result = match ident {
            "len" => match args {
                [Value::Str(s)] => Value::Int(s.chars().count() as i64),
                [Value::List(items)] => Value::Int(items.len() as i64),
                [Value::Map(entries)] => Value::Int(entries.len() as i64),
                [Value::Bytes(b)] => Value::Int(b.len() as i64),
                _ => {
                    return Err(WeftError::Execution(
                        "len() takes one sized argument".to_string(),
                    ))
                }
            },
            "abs" => match args {
                [Value::Int(n)] => Value::Int(n.abs()),
                [Value::Float(f)] => Value::Float(f.abs()),
                _ => {
                    return Err(WeftError::Execution(
                        "abs() takes one numeric argument".to_string(),
                    ))
                }
            },
            "min" => {
                let ns = numbers(args)?;
                match ns.iter().cloned().fold(None::<f64>, |acc, n| {
                    Some(acc.map_or(n, |a| a.min(n)))
                }) {
                    Some(m) => float_or_int(m, args),
                    None => {
                        return Err(WeftError::Execution(
                            "min() of empty sequence".to_string(),
                        ))
                    }
                }
            }
            "max" => {
                let ns = numbers(args)?;
                match ns.iter().cloned().fold(None::<f64>, |acc, n| {
                    Some(acc.map_or(n, |a| a.max(n)))
                }) {
                    Some(m) => float_or_int(m, args),
                    None => {
                        return Err(WeftError::Execution(
                            "max() of empty sequence".to_string(),
                        ))
                    }
                }
            }
            "sum" => {
                let ns = numbers(args)?;
                float_or_int(ns.iter().sum(), args)
            }
            "str" => match args {
                [v] => Value::Str(match v {
                    Value::Str(s) => s.clone(),
                    other => other.canonical(),
                }),
                _ => {
                    return Err(WeftError::Execution(
                        "str() takes one argument".to_string(),
                    ))
                }
            },
            "int" => match args {
                [Value::Int(n)] => Value::Int(*n),
                [Value::Float(f)] => Value::Int(*f as i64),
                [Value::Str(s)] => Value::Int(s.trim().parse::<i64>().map_err(|_| {
                    WeftError::Execution(format!("cannot convert '{}' to int", s))
                })?),
                [Value::Bool(b)] => Value::Int(*b as i64),
                _ => {
                    return Err(WeftError::Execution(
                        "int() takes one argument".to_string(),
                    ))
                }
            },
            "float" => match args {
                [v] => match v.as_float() {
                    Some(f) => Value::Float(f),
                    None => match v {
                        Value::Str(s) => Value::Float(s.trim().parse::<f64>().map_err(
                            |_| {
                                WeftError::Execution(format!(
                                    "cannot convert '{}' to float",
                                    s
                                ))
                            },
                        )?),
                        _ => {
                            return Err(WeftError::Execution(
                                "float() takes a number or string".to_string(),
                            ))
                        }
                    },
                },
                _ => {
                    return Err(WeftError::Execution(
                        "float() takes one argument".to_string(),
                    ))
                }
            },
            _ => return Ok(None),
        };

        Ok(Some(result))
    }
}

/// Integer-looking results from all-integer inputs stay integers.
fn float_or_int(n: f64, args: &[Value]) -> Value {
    let all_int = match args {
        [Value::List(items)] => items.iter().all(|v| matches!(v, Value::Int(_))),
        other => other.iter().all(|v| matches!(v, Value::Int(_))),
    };
    if all_int && n.fract() == 0.0 {
        Value::Int(n as i64)
    } else {
        Value::Float(n)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub execution_count: u64,
}

/// Parses and evaluates task programs, honoring `max_retries` with a fixed
/// backoff between attempts. Cancellation aborts immediately instead of
/// retrying.
pub struct Executor {
    execution_count: AtomicU64,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            execution_count: AtomicU64::new(0),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn execute(&self, task: &TaskSpec, cancel: &CancelFlag) -> WeftResult<Value> {
        if task.program.trim().is_empty() {
            return Err(WeftError::Execution("no program code provided".to_string()));
        }

        self.execution_count.fetch_add(1, Ordering::Relaxed);
        let program = Program::parse(&task.program)?;

        let mut attempt = 0u32;
        loop {
            match program.call(&task.function, &task.args, Some(cancel)) {
                Ok(result) => return Ok(result),
                Err(WeftError::Cancelled) => return Err(WeftError::Cancelled),
                Err(e) => {
                    if attempt >= task.max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    warn!(
                        "Task failed, retrying ({}/{}) (task = {}): {}",
                        attempt, task.max_retries, task.task_id, e
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            execution_count: self.execution_count.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl TaskRunner for Executor {
    async fn run(&self, task: &TaskSpec, cancel: &CancelFlag) -> WeftResult<Value> {
        self.execute(task, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(program: &str, function: &str, args: Vec<Value>) -> WeftResult<Value> {
        Program::parse(program)?.call(function, &args, None)
    }

    #[test]
    fn square_of_seven() {
        let result = run("def main(n): return n*n", "main", vec![Value::Int(7)]).unwrap();
        assert_eq!(result, Value::Int(49));
    }

    #[test]
    fn precedence_and_parens() {
        let result = run("def f(): return 2 + 3 * 4", "f", vec![]).unwrap();
        assert_eq!(result, Value::Int(14));

        let result = run("def f(): return (2 + 3) * 4", "f", vec![]).unwrap();
        assert_eq!(result, Value::Int(20));
    }

    #[test]
    fn division_widens_to_float() {
        let result = run("def f(): return 7 / 2", "f", vec![]).unwrap();
        assert_eq!(result, Value::Float(3.5));
    }

    #[test]
    fn conditional_expression() {
        let program = "def sign(n): return 1 if n > 0 else (0 - 1 if n < 0 else 0)";
        assert_eq!(run(program, "sign", vec![Value::Int(5)]).unwrap(), Value::Int(1));
        assert_eq!(
            run(program, "sign", vec![Value::Int(-5)]).unwrap(),
            Value::Int(-1)
        );
        assert_eq!(run(program, "sign", vec![Value::Int(0)]).unwrap(), Value::Int(0));
    }

    #[test]
    fn recursion_with_helper() {
        let program = "def fac(n): return 1 if n <= 1 else n * fac(n - 1)";
        assert_eq!(
            run(program, "fac", vec![Value::Int(10)]).unwrap(),
            Value::Int(3628800)
        );
    }

    #[test]
    fn functions_call_each_other_and_bindings() {
        let program = "scale = 10\ndef double(n): return n * 2\ndef main(n): return double(n) + scale";
        assert_eq!(
            run(program, "main", vec![Value::Int(4)]).unwrap(),
            Value::Int(18)
        );
    }

    #[test]
    fn boolean_operators_short_circuit() {
        let program = "def safe_inv(x): return x != 0 and 1 / x";
        assert_eq!(
            run(program, "safe_inv", vec![Value::Int(0)]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            run(program, "safe_inv", vec![Value::Int(4)]).unwrap(),
            Value::Float(0.25)
        );
    }

    #[test]
    fn builtins_over_lists() {
        let program = "def f(xs): return sum(xs) + len(xs) + max(xs) - min(xs)";
        let xs = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(run(program, "f", vec![xs]).unwrap(), Value::Int(11));
    }

    #[test]
    fn string_concat_and_index() {
        let program = "def f(s): return s + '!' if len(s) > 0 else ''";
        assert_eq!(
            run(program, "f", vec![Value::Str("hi".to_string())]).unwrap(),
            Value::Str("hi!".to_string())
        );

        let program = "def f(xs): return xs[0] + xs[-1]";
        let xs = Value::List(vec![Value::Int(5), Value::Int(6), Value::Int(7)]);
        assert_eq!(run(program, "f", vec![xs]).unwrap(), Value::Int(12));
    }

    #[test]
    fn missing_function_is_not_found() {
        match run("def main(): return 1", "other", vec![]) {
            Err(WeftError::FunctionNotFound(name)) => assert_eq!(name, "other"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn binding_is_not_callable() {
        match run("answer = 42", "answer", vec![]) {
            Err(WeftError::NotCallable(name)) => assert_eq!(name, "answer"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn runaway_recursion_is_bounded() {
        let result = run("def loop(n): return loop(n + 1)", "loop", vec![Value::Int(0)]);
        match result {
            Err(WeftError::Execution(msg)) => assert!(msg.contains("recursion")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn cancellation_interrupts_evaluation() {
        // Deep-but-bounded recursion; the pre-set flag stops it at a poll.
        let program = Program::parse("def spin(n): return 0 if n <= 0 else spin(n - 1) + spin(n - 1)").unwrap();
        let flag = CancelFlag::new();
        flag.cancel();

        match program.call("spin", &[Value::Int(30)], Some(&flag)) {
            Err(WeftError::Cancelled) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn division_by_zero_is_execution_error() {
        match run("def f(): return 1 / 0", "f", vec![]) {
            Err(WeftError::Execution(msg)) => assert!(msg.contains("zero")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn syntax_error_reports_line() {
        match Program::parse("def broken(: return 1") {
            Err(WeftError::Execution(msg)) => assert!(msg.contains("line 1")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn executor_retries_transient_failures_then_surfaces() {
        // Always-failing program: retries are attempted, then the error
        // surfaces unchanged.
        let executor = Executor::new();
        let task = TaskSpec {
            task_id: "T1".to_string(),
            program: "def f(): return 1 / 0".to_string(),
            function: "f".to_string(),
            args: vec![],
            confidential: false,
            priority: 0,
            max_retries: 1,
            timeout: None,
            estimated_burst: None,
            source_peer: None,
        };

        let flag = CancelFlag::new();
        let start = std::time::Instant::now();
        let result = executor.execute(&task, &flag).await;

        assert!(matches!(result, Err(WeftError::Execution(_))));
        // One retry means one backoff sleep.
        assert!(start.elapsed() >= Duration::from_millis(450));
    }
}
