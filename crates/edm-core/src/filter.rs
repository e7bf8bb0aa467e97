//! # Filter Expressions
//!
//! The predicate language used after `|` in a path subscript:
//!
//! ```text
//! len(rveStates)<2
//! all([rs.sigmaHom["value"]>80 for rs in rveStates])
//! name.endswith("0")
//! eps_axial["value"] < 800 and not meta["tags"]
//! ```
//!
//! Expressions are parsed once into a syntax tree and interpreted against
//! an [`AttributeSource`], the evaluator's view of one candidate object.
//! Only attribute access, indexing, arithmetic, comparisons, boolean logic,
//! comprehensions and a fixed set of pure functions are available.

#![allow(clippy::float_arithmetic)]

use crate::EdmError;
use crate::primitives::MAX_FILTER_DEPTH;
use nom::{
    IResult,
    branch::alt,
    bytes::complete::{escaped_transform, is_not, tag, take_while, take_while1},
    character::complete::{char as pchar, digit1, multispace0, one_of, satisfy},
    combinator::{all_consuming, map, map_res, not, opt, recognize, value, verify},
    error::ErrorKind,
    multi::many0,
    sequence::{delimited, pair, preceded, terminated, tuple},
};
use serde_json::{Map, Value};
use std::fmt;
use std::rc::Rc;

// =============================================================================
// VALUES
// =============================================================================

/// The evaluator's view of one object.
///
/// `get` returns the value of an attribute; link attributes return bound
/// sources (or lists of them) for the linked objects.
pub trait AttributeSource<'a> {
    fn get(&self, name: &str) -> Result<Datum<'a>, EdmError>;

    /// Identity of the underlying object, when it has one.
    fn id(&self) -> Option<&str> {
        None
    }
}

impl<'a> AttributeSource<'a> for Map<String, Value> {
    fn get(&self, name: &str) -> Result<Datum<'a>, EdmError> {
        Map::get(self, name)
            .map(Datum::from_json)
            .ok_or_else(|| EdmError::Resolution(format!("name \"{}\" is not defined", name)))
    }
}

/// A runtime value of the filter language.
#[derive(Clone)]
pub enum Datum<'a> {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Datum<'a>>),
    Dict(Map<String, Value>),
    Object(Rc<dyn AttributeSource<'a> + 'a>),
}

impl<'a> Datum<'a> {
    /// Convert a JSON value.
    #[must_use]
    pub fn from_json(v: &Value) -> Self {
        match v {
            Value::Null => Datum::None,
            Value::Bool(b) => Datum::Bool(*b),
            Value::Number(n) => n
                .as_i64()
                .map(Datum::Int)
                .unwrap_or_else(|| Datum::Float(n.as_f64().unwrap_or(f64::NAN))),
            Value::String(s) => Datum::Str(s.clone()),
            Value::Array(items) => Datum::List(items.iter().map(Datum::from_json).collect()),
            Value::Object(m) => Datum::Dict(m.clone()),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Datum::None => "None",
            Datum::Bool(_) => "bool",
            Datum::Int(_) => "int",
            Datum::Float(_) => "float",
            Datum::Str(_) => "str",
            Datum::List(_) => "list",
            Datum::Dict(_) => "dict",
            Datum::Object(_) => "object",
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Datum::None => false,
            Datum::Bool(b) => *b,
            Datum::Int(i) => *i != 0,
            Datum::Float(f) => *f != 0.0,
            Datum::Str(s) => !s.is_empty(),
            Datum::List(l) => !l.is_empty(),
            Datum::Dict(d) => !d.is_empty(),
            Datum::Object(_) => true,
        }
    }

    fn as_number(&self) -> Option<Num> {
        match self {
            Datum::Bool(b) => Some(Num::Int(i64::from(*b))),
            Datum::Int(i) => Some(Num::Int(*i)),
            Datum::Float(f) => Some(Num::Float(*f)),
            _ => None,
        }
    }
}

impl fmt::Debug for Datum<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::None => f.write_str("None"),
            Datum::Bool(b) => write!(f, "{}", b),
            Datum::Int(i) => write!(f, "{}", i),
            Datum::Float(x) => write!(f, "{}", x),
            Datum::Str(s) => write!(f, "{:?}", s),
            Datum::List(l) => f.debug_list().entries(l).finish(),
            Datum::Dict(d) => write!(f, "{}", Value::Object(d.clone())),
            Datum::Object(o) => write!(f, "<object {}>", o.id().unwrap_or("?")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn to_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

// =============================================================================
// SYNTAX TREE
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Literal),
    List(Vec<Expr>),
    Name(String),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Arith(Box<Expr>, Vec<(BinOp, Expr)>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare(Box<Expr>, Vec<(CmpOp, Expr)>),
    Comprehension {
        element: Box<Expr>,
        var: String,
        iter: Box<Expr>,
        cond: Option<Box<Expr>>,
    },
}

// =============================================================================
// FILTER
// =============================================================================

/// A compiled filter expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    text: String,
    expr: Expr,
}

impl Filter {
    /// Parse a filter expression.
    pub fn parse(text: &str) -> Result<Self, EdmError> {
        let (_, expr) = all_consuming(ws(|i| or_expr(i, 0)))(text)
            .map_err(|_| EdmError::Parse(format!("invalid filter expression \"{}\"", text)))?;
        Ok(Self {
            text: text.to_string(),
            expr,
        })
    }

    /// The source text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Evaluate against a candidate object.
    ///
    /// The result must be a bool or an int; anything else, and any
    /// evaluation failure, is a resolution error.
    pub fn matches<'a>(&self, source: Rc<dyn AttributeSource<'a> + 'a>) -> Result<bool, EdmError> {
        let mut eval = Evaluator {
            source,
            scopes: Vec::new(),
        };
        let result = eval.eval(&self.expr).map_err(|e| match e {
            EdmError::Storage(_) => e,
            other => EdmError::Resolution(format!("filter \"{}\": {}", self.text, other)),
        })?;
        match result {
            Datum::Bool(b) => Ok(b),
            Datum::Int(i) => Ok(i != 0),
            other => Err(EdmError::Resolution(format!(
                "filter \"{}\" returned {} (must be bool or int)",
                self.text,
                other.kind()
            ))),
        }
    }
}

// =============================================================================
// EVALUATOR
// =============================================================================

const FUNCTIONS: [&str; 7] = ["len", "any", "all", "sum", "min", "max", "abs"];
const METHODS: [&str; 4] = ["startswith", "endswith", "lower", "upper"];

struct Evaluator<'a> {
    source: Rc<dyn AttributeSource<'a> + 'a>,
    scopes: Vec<(String, Datum<'a>)>,
}

fn eval_err(msg: String) -> EdmError {
    EdmError::Resolution(msg)
}

impl<'a> Evaluator<'a> {
    fn eval(&mut self, expr: &Expr) -> Result<Datum<'a>, EdmError> {
        match expr {
            Expr::Literal(lit) => Ok(match lit {
                Literal::None => Datum::None,
                Literal::Bool(b) => Datum::Bool(*b),
                Literal::Int(i) => Datum::Int(*i),
                Literal::Float(f) => Datum::Float(*f),
                Literal::Str(s) => Datum::Str(s.clone()),
            }),
            Expr::List(items) => items
                .iter()
                .map(|e| self.eval(e))
                .collect::<Result<Vec<_>, _>>()
                .map(Datum::List),
            Expr::Name(name) => self.lookup(name),
            Expr::Attr(base, name) => {
                let base = self.eval(base)?;
                get_attr(&base, name)
            }
            Expr::Index(base, index) => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                get_item(&base, &index)
            }
            Expr::Call(func, args) => self.call(func, args),
            Expr::Neg(e) => match self.eval(e)?.as_number() {
                Some(Num::Int(i)) => i
                    .checked_neg()
                    .map(Datum::Int)
                    .ok_or_else(|| eval_err("integer overflow".to_string())),
                Some(Num::Float(f)) => Ok(Datum::Float(-f)),
                None => Err(eval_err("bad operand for unary -".to_string())),
            },
            Expr::Not(e) => Ok(Datum::Bool(!self.eval(e)?.truthy())),
            Expr::Arith(first, rest) => {
                let mut acc = self.eval(first)?;
                for (op, e) in rest {
                    acc = binary(*op, acc, self.eval(e)?)?;
                }
                Ok(acc)
            }
            Expr::And(items) => {
                let mut last = Datum::Bool(true);
                for e in items {
                    last = self.eval(e)?;
                    if !last.truthy() {
                        break;
                    }
                }
                Ok(last)
            }
            Expr::Or(items) => {
                let mut last = Datum::Bool(false);
                for e in items {
                    last = self.eval(e)?;
                    if last.truthy() {
                        break;
                    }
                }
                Ok(last)
            }
            Expr::Compare(first, rest) => {
                let mut left = self.eval(first)?;
                for (op, e) in rest {
                    let right = self.eval(e)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(Datum::Bool(false));
                    }
                    left = right;
                }
                Ok(Datum::Bool(true))
            }
            Expr::Comprehension {
                element,
                var,
                iter,
                cond,
            } => {
                let items = iterate(self.eval(iter)?)?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    self.scopes.push((var.clone(), item));
                    let keep = match cond {
                        Some(c) => self.eval(c).map(|d| d.truthy()),
                        None => Ok(true),
                    };
                    let value = match keep {
                        Ok(true) => self.eval(element).map(Some),
                        Ok(false) => Ok(None),
                        Err(e) => Err(e),
                    };
                    self.scopes.pop();
                    out.extend(value?);
                }
                Ok(Datum::List(out))
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<Datum<'a>, EdmError> {
        if let Some((_, v)) = self.scopes.iter().rev().find(|(n, _)| n == name) {
            return Ok(v.clone());
        }
        self.source.get(name)
    }

    fn call(&mut self, func: &Expr, args: &[Expr]) -> Result<Datum<'a>, EdmError> {
        match func {
            Expr::Name(name) if FUNCTIONS.contains(&name.as_str()) => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                builtin(name, args)
            }
            Expr::Attr(base, method) if METHODS.contains(&method.as_str()) => {
                let base = self.eval(base)?;
                let args = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                string_method(&base, method, &args)
            }
            other => Err(eval_err(format!("{:?} is not callable", other))),
        }
    }
}

fn get_attr<'a>(base: &Datum<'a>, name: &str) -> Result<Datum<'a>, EdmError> {
    match base {
        Datum::Object(o) => o.get(name),
        Datum::Dict(d) => d
            .get(name)
            .map(Datum::from_json)
            .ok_or_else(|| eval_err(format!("no key \"{}\"", name))),
        other => Err(eval_err(format!("{} has no attribute \"{}\"", other.kind(), name))),
    }
}

fn get_item<'a>(base: &Datum<'a>, index: &Datum<'a>) -> Result<Datum<'a>, EdmError> {
    let position = |i: i64, len: usize| -> Result<usize, EdmError> {
        let n = len as i64;
        let idx = if i < 0 { i + n } else { i };
        if (0..n).contains(&idx) {
            Ok(idx as usize)
        } else {
            Err(eval_err(format!("index {} out of range", i)))
        }
    };
    match (base, index) {
        (Datum::List(l), Datum::Int(i)) => Ok(l[position(*i, l.len())?].clone()),
        (Datum::Str(s), Datum::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Datum::Str(chars[position(*i, chars.len())?].to_string()))
        }
        (Datum::Dict(d), Datum::Str(k)) => d
            .get(k)
            .map(Datum::from_json)
            .ok_or_else(|| eval_err(format!("no key \"{}\"", k))),
        (Datum::Object(o), Datum::Str(k)) => o.get(k),
        (b, i) => Err(eval_err(format!("{} cannot be indexed by {}", b.kind(), i.kind()))),
    }
}

fn iterate(d: Datum<'_>) -> Result<Vec<Datum<'_>>, EdmError> {
    match d {
        Datum::List(l) => Ok(l),
        Datum::Str(s) => Ok(s.chars().map(|c| Datum::Str(c.to_string())).collect()),
        Datum::Dict(m) => Ok(m.keys().map(|k| Datum::Str(k.clone())).collect()),
        other => Err(eval_err(format!("{} is not iterable", other.kind()))),
    }
}

fn equals<'a>(l: &Datum<'a>, r: &Datum<'a>) -> bool {
    if let (Some(a), Some(b)) = (l.as_number(), r.as_number()) {
        return match (a, b) {
            (Num::Int(x), Num::Int(y)) => x == y,
            (x, y) => x.to_f64() == y.to_f64(),
        };
    }
    match (l, r) {
        (Datum::None, Datum::None) => true,
        (Datum::Str(a), Datum::Str(b)) => a == b,
        (Datum::List(a), Datum::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| equals(x, y))
        }
        (Datum::Dict(a), Datum::Dict(b)) => a == b,
        (Datum::Object(a), Datum::Object(b)) => match (a.id(), b.id()) {
            (Some(x), Some(y)) => x == y,
            _ => std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b)),
        },
        _ => false,
    }
}

fn compare<'a>(op: CmpOp, l: &Datum<'a>, r: &Datum<'a>) -> Result<bool, EdmError> {
    use std::cmp::Ordering;
    let ordering = || -> Result<Ordering, EdmError> {
        match (l.as_number(), r.as_number(), l, r) {
            (Some(Num::Int(a)), Some(Num::Int(b)), _, _) => Ok(a.cmp(&b)),
            (Some(a), Some(b), _, _) => a
                .to_f64()
                .partial_cmp(&b.to_f64())
                .ok_or_else(|| eval_err("comparison with NaN".to_string())),
            (_, _, Datum::Str(a), Datum::Str(b)) => Ok(a.cmp(b)),
            _ => Err(eval_err(format!(
                "cannot order {} and {}",
                l.kind(),
                r.kind()
            ))),
        }
    };
    let contains = || -> Result<bool, EdmError> {
        match (l, r) {
            (_, Datum::List(items)) => Ok(items.iter().any(|x| equals(l, x))),
            (Datum::Str(needle), Datum::Str(hay)) => Ok(hay.contains(needle.as_str())),
            (Datum::Str(k), Datum::Dict(m)) => Ok(m.contains_key(k)),
            _ => Err(eval_err(format!(
                "\"in\" is not supported between {} and {}",
                l.kind(),
                r.kind()
            ))),
        }
    };
    Ok(match op {
        CmpOp::Eq => equals(l, r),
        CmpOp::Ne => !equals(l, r),
        CmpOp::Lt => ordering()? == Ordering::Less,
        CmpOp::Le => ordering()? != Ordering::Greater,
        CmpOp::Gt => ordering()? == Ordering::Greater,
        CmpOp::Ge => ordering()? != Ordering::Less,
        CmpOp::In => contains()?,
        CmpOp::NotIn => !contains()?,
    })
}

fn binary<'a>(op: BinOp, l: Datum<'a>, r: Datum<'a>) -> Result<Datum<'a>, EdmError> {
    let overflow = || eval_err("integer overflow".to_string());
    match (op, l.as_number(), r.as_number()) {
        (BinOp::Div, Some(a), Some(b)) => {
            let d = b.to_f64();
            if d == 0.0 {
                return Err(eval_err("division by zero".to_string()));
            }
            Ok(Datum::Float(a.to_f64() / d))
        }
        (_, Some(Num::Int(a)), Some(Num::Int(b))) => match op {
            BinOp::Add => a.checked_add(b).map(Datum::Int).ok_or_else(overflow),
            BinOp::Sub => a.checked_sub(b).map(Datum::Int).ok_or_else(overflow),
            BinOp::Mul => a.checked_mul(b).map(Datum::Int).ok_or_else(overflow),
            BinOp::Mod | BinOp::Div => {
                if b == 0 {
                    return Err(eval_err("modulo by zero".to_string()));
                }
                let m = a.checked_rem_euclid(b).ok_or_else(overflow)?;
                Ok(Datum::Int(if b < 0 && m != 0 { m + b } else { m }))
            }
        },
        (_, Some(a), Some(b)) => {
            let (a, b) = (a.to_f64(), b.to_f64());
            match op {
                BinOp::Add => Ok(Datum::Float(a + b)),
                BinOp::Sub => Ok(Datum::Float(a - b)),
                BinOp::Mul => Ok(Datum::Float(a * b)),
                BinOp::Mod | BinOp::Div => {
                    if b == 0.0 {
                        return Err(eval_err("modulo by zero".to_string()));
                    }
                    let m = a % b;
                    Ok(Datum::Float(if m != 0.0 && (m < 0.0) != (b < 0.0) { m + b } else { m }))
                }
            }
        }
        (BinOp::Add, _, _) => match (l, r) {
            (Datum::Str(a), Datum::Str(b)) => Ok(Datum::Str(a + &b)),
            (Datum::List(mut a), Datum::List(b)) => {
                a.extend(b);
                Ok(Datum::List(a))
            }
            (l, r) => Err(eval_err(format!("cannot add {} and {}", l.kind(), r.kind()))),
        },
        (_, _, _) => Err(eval_err(format!(
            "unsupported operands {} and {}",
            l.kind(),
            r.kind()
        ))),
    }
}

fn builtin<'a>(name: &str, mut args: Vec<Datum<'a>>) -> Result<Datum<'a>, EdmError> {
    let arity = |n: usize, args: &[Datum<'a>]| {
        if args.len() == n {
            Ok(())
        } else {
            Err(eval_err(format!("{}() takes {} argument(s)", name, n)))
        }
    };
    match name {
        "len" => {
            arity(1, &args)?;
            let n = match &args[0] {
                Datum::List(l) => l.len(),
                Datum::Str(s) => s.chars().count(),
                Datum::Dict(d) => d.len(),
                other => return Err(eval_err(format!("{} has no len()", other.kind()))),
            };
            Ok(Datum::Int(n as i64))
        }
        "any" => {
            arity(1, &args)?;
            let items = iterate(args.remove(0))?;
            Ok(Datum::Bool(items.iter().any(Datum::truthy)))
        }
        "all" => {
            arity(1, &args)?;
            let items = iterate(args.remove(0))?;
            Ok(Datum::Bool(items.iter().all(Datum::truthy)))
        }
        "sum" => {
            arity(1, &args)?;
            iterate(args.remove(0))?
                .into_iter()
                .try_fold(Datum::Int(0), |acc, x| binary(BinOp::Add, acc, x))
        }
        "abs" => {
            arity(1, &args)?;
            match args[0].as_number() {
                Some(Num::Int(i)) => i
                    .checked_abs()
                    .map(Datum::Int)
                    .ok_or_else(|| eval_err("integer overflow".to_string())),
                Some(Num::Float(f)) => Ok(Datum::Float(f.abs())),
                None => Err(eval_err(format!("bad operand for abs(): {}", args[0].kind()))),
            }
        }
        "min" | "max" => {
            let items = if args.len() == 1 {
                iterate(args.remove(0))?
            } else {
                args
            };
            let mut iter = items.into_iter();
            let mut best = iter
                .next()
                .ok_or_else(|| eval_err(format!("{}() of an empty sequence", name)))?;
            let wanted = if name == "min" { CmpOp::Lt } else { CmpOp::Gt };
            for x in iter {
                if compare(wanted, &x, &best)? {
                    best = x;
                }
            }
            Ok(best)
        }
        other => Err(eval_err(format!("unknown function {}", other))),
    }
}

fn string_method<'a>(base: &Datum<'a>, method: &str, args: &[Datum<'a>]) -> Result<Datum<'a>, EdmError> {
    let Datum::Str(s) = base else {
        return Err(eval_err(format!("{} has no method {}", base.kind(), method)));
    };
    match (method, args) {
        ("startswith", [Datum::Str(p)]) => Ok(Datum::Bool(s.starts_with(p.as_str()))),
        ("endswith", [Datum::Str(p)]) => Ok(Datum::Bool(s.ends_with(p.as_str()))),
        ("lower", []) => Ok(Datum::Str(s.to_lowercase())),
        ("upper", []) => Ok(Datum::Str(s.to_uppercase())),
        _ => Err(eval_err(format!("bad arguments to str.{}()", method))),
    }
}

// =============================================================================
// GRAMMAR
// =============================================================================

const KEYWORDS: [&str; 12] = [
    "and", "or", "not", "in", "for", "if", "True", "False", "None", "true", "false", "null",
];

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag(kw), not(satisfy(is_ident_continue)))
}

fn identifier(input: &str) -> IResult<&str, String> {
    map(
        verify(
            recognize(pair(
                take_while1(is_ident_start),
                take_while(is_ident_continue),
            )),
            |s: &str| !KEYWORDS.contains(&s),
        ),
        str::to_string,
    )(input)
}

fn number(input: &str) -> IResult<&str, Literal> {
    let float = recognize(tuple((
        digit1,
        alt((
            recognize(pair(
                preceded(pchar('.'), digit1),
                opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
            )),
            recognize(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        )),
    )));
    alt((
        map_res(float, |s: &str| s.parse::<f64>().map(Literal::Float)),
        map_res(digit1, |s: &str| s.parse::<i64>().map(Literal::Int)),
    ))(input)
}

fn string_lit(input: &str) -> IResult<&str, String> {
    let escapes = || {
        alt((
            value("\\", tag("\\")),
            value("\"", tag("\"")),
            value("'", tag("'")),
            value("\n", tag("n")),
            value("\t", tag("t")),
        ))
    };
    alt((
        delimited(
            pchar('"'),
            map(opt(escaped_transform(is_not("\\\""), '\\', escapes())), Option::unwrap_or_default),
            pchar('"'),
        ),
        delimited(
            pchar('\''),
            map(opt(escaped_transform(is_not("\\'"), '\\', escapes())), Option::unwrap_or_default),
            pchar('\''),
        ),
    ))(input)
}

type CompTail = (String, Expr, Option<Expr>);

/// The nesting level below `depth`, or a failure past `MAX_FILTER_DEPTH`.
fn deeper(input: &str, depth: usize) -> Result<usize, nom::Err<nom::error::Error<&str>>> {
    if depth >= MAX_FILTER_DEPTH {
        Err(nom::Err::Failure(nom::error::Error::new(input, ErrorKind::TooLarge)))
    } else {
        Ok(depth + 1)
    }
}

fn comprehension_tail(input: &str, depth: usize) -> IResult<&str, CompTail> {
    map(
        tuple((
            ws(keyword("for")),
            ws(identifier),
            ws(keyword("in")),
            |i| or_expr(i, depth),
            opt(preceded(ws(keyword("if")), |i| or_expr(i, depth))),
        )),
        |(_, var, _, iter, cond)| (var, iter, cond),
    )(input)
}

fn comprehension(element: Expr, (var, iter, cond): CompTail) -> Expr {
    Expr::Comprehension {
        element: Box::new(element),
        var,
        iter: Box::new(iter),
        cond: cond.map(Box::new),
    }
}

/// Contents of a list display or argument list.
enum Items {
    Comprehension(Expr),
    Exprs(Vec<Expr>),
}

/// A comprehension, or comma-separated expressions with an optional
/// trailing comma.
fn items(input: &str, depth: usize) -> IResult<&str, Items> {
    let (input, first) = opt(|i| or_expr(i, depth))(input)?;
    let Some(first) = first else {
        return Ok((input, Items::Exprs(Vec::new())));
    };
    let (input, tail) = opt(|i| comprehension_tail(i, depth))(input)?;
    if let Some(tail) = tail {
        return Ok((input, Items::Comprehension(comprehension(first, tail))));
    }
    let (input, rest) = many0(preceded(ws(pchar(',')), |i| or_expr(i, depth)))(input)?;
    let (input, _) = opt(ws(pchar(',')))(input)?;
    let mut exprs = vec![first];
    exprs.extend(rest);
    Ok((input, Items::Exprs(exprs)))
}

fn list_display(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (input, _) = ws(pchar('['))(input)?;
    let depth = deeper(input, depth)?;
    let (input, contents) = items(input, depth)?;
    let (input, _) = ws(pchar(']'))(input)?;
    let expr = match contents {
        Items::Comprehension(comp) => comp,
        Items::Exprs(exprs) => Expr::List(exprs),
    };
    Ok((input, expr))
}

fn call_args(input: &str, depth: usize) -> IResult<&str, Vec<Expr>> {
    let (input, _) = ws(pchar('('))(input)?;
    let depth = deeper(input, depth)?;
    let (input, contents) = items(input, depth)?;
    let (input, _) = ws(pchar(')'))(input)?;
    let args = match contents {
        Items::Comprehension(comp) => vec![comp],
        Items::Exprs(exprs) => exprs,
    };
    Ok((input, args))
}

fn subscript(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (input, _) = ws(pchar('['))(input)?;
    let depth = deeper(input, depth)?;
    terminated(|i| or_expr(i, depth), ws(pchar(']')))(input)
}

fn atom(input: &str, depth: usize) -> IResult<&str, Expr> {
    ws(alt((
        map(number, Expr::Literal),
        map(string_lit, |s| Expr::Literal(Literal::Str(s))),
        value(
            Expr::Literal(Literal::Bool(true)),
            alt((keyword("True"), keyword("true"))),
        ),
        value(
            Expr::Literal(Literal::Bool(false)),
            alt((keyword("False"), keyword("false"))),
        ),
        value(
            Expr::Literal(Literal::None),
            alt((keyword("None"), keyword("null"))),
        ),
        |i| parenthesized(i, depth),
        |i| list_display(i, depth),
        map(identifier, Expr::Name),
    )))(input)
}

fn parenthesized(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (input, _) = ws(pchar('('))(input)?;
    let depth = deeper(input, depth)?;
    terminated(|i| or_expr(i, depth), ws(pchar(')')))(input)
}

enum Postfix {
    Attr(String),
    Index(Expr),
    Call(Vec<Expr>),
}

fn postfix(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (input, base) = atom(input, depth)?;
    let (rest, ops) = many0(alt((
        map(preceded(ws(pchar('.')), ws(identifier)), Postfix::Attr),
        map(|i| subscript(i, depth), Postfix::Index),
        map(|i| call_args(i, depth), Postfix::Call),
    )))(input)?;
    if depth + ops.len() > MAX_FILTER_DEPTH {
        return Err(nom::Err::Failure(nom::error::Error::new(input, ErrorKind::TooLarge)));
    }
    let expr = ops.into_iter().fold(base, |acc, op| match op {
        Postfix::Attr(name) => Expr::Attr(Box::new(acc), name),
        Postfix::Index(i) => Expr::Index(Box::new(acc), Box::new(i)),
        Postfix::Call(args) => Expr::Call(Box::new(acc), args),
    });
    Ok((rest, expr))
}

fn unary(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (rest, sign) = opt(ws(alt((pchar('-'), pchar('+')))))(input)?;
    match sign {
        None => postfix(input, depth),
        Some(sign) => {
            let d = deeper(rest, depth)?;
            let (rest, e) = unary(rest, d)?;
            Ok((rest, if sign == '-' { Expr::Neg(Box::new(e)) } else { e }))
        }
    }
}

fn term(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (input, first) = unary(input, depth)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinOp::Mul, pchar('*')),
            value(BinOp::Div, pchar('/')),
            value(BinOp::Mod, pchar('%')),
        ))),
        |i| unary(i, depth),
    ))(input)?;
    Ok((input, chain(first, rest)))
}

fn arith(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (input, first) = term(input, depth)?;
    let (input, rest) = many0(pair(
        ws(alt((value(BinOp::Add, pchar('+')), value(BinOp::Sub, pchar('-'))))),
        |i| term(i, depth),
    ))(input)?;
    Ok((input, chain(first, rest)))
}

fn chain(first: Expr, rest: Vec<(BinOp, Expr)>) -> Expr {
    if rest.is_empty() {
        first
    } else {
        Expr::Arith(Box::new(first), rest)
    }
}

fn cmp_op(input: &str) -> IResult<&str, CmpOp> {
    ws(alt((
        value(CmpOp::Eq, tag("==")),
        value(CmpOp::Ne, tag("!=")),
        value(CmpOp::Le, tag("<=")),
        value(CmpOp::Ge, tag(">=")),
        value(CmpOp::Lt, tag("<")),
        value(CmpOp::Gt, tag(">")),
        value(CmpOp::NotIn, pair(keyword("not"), ws(keyword("in")))),
        value(CmpOp::In, keyword("in")),
    )))(input)
}

fn comparison(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (input, first) = arith(input, depth)?;
    let (input, rest) = many0(pair(cmp_op, |i| arith(i, depth)))(input)?;
    if rest.is_empty() {
        Ok((input, first))
    } else {
        Ok((input, Expr::Compare(Box::new(first), rest)))
    }
}

fn not_expr(input: &str, depth: usize) -> IResult<&str, Expr> {
    match ws(keyword("not"))(input) {
        Ok((rest, _)) => {
            let d = deeper(rest, depth)?;
            map(|i| not_expr(i, d), |e| Expr::Not(Box::new(e)))(rest)
        }
        Err(nom::Err::Error(_)) => comparison(input, depth),
        Err(e) => Err(e),
    }
}

fn and_expr(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (input, first) = not_expr(input, depth)?;
    let (input, rest) = many0(preceded(ws(keyword("and")), |i| not_expr(i, depth)))(input)?;
    if rest.is_empty() {
        return Ok((input, first));
    }
    let mut items = vec![first];
    items.extend(rest);
    Ok((input, Expr::And(items)))
}

fn or_expr(input: &str, depth: usize) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input, depth)?;
    let (input, rest) = many0(preceded(ws(keyword("or")), |i| and_expr(i, depth)))(input)?;
    if rest.is_empty() {
        return Ok((input, first));
    }
    let mut items = vec![first];
    items.extend(rest);
    Ok((input, Expr::Or(items)))
}

// =============================================================================
// TESTS
// =============================================================================
