//! # Unit Algebra
//!
//! Parses physical unit strings (`"mm"`, `"kN*m"`, `"g/cm3"`, `"um/m"`,
//! `"m s^-2"`) into a dimension vector plus a scale, and computes the factor
//! converting values between two dimensionally compatible units.
//!
//! Scales are kept as `mantissa × 10^exponent` with an exact integer
//! exponent, so that prefix-only conversions (`mm` → `m`) are performed by
//! exact multiplication or division by a power of ten.

#![allow(clippy::float_arithmetic)]

use crate::EdmError;
use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char as pchar, digit1, multispace0, multispace1},
    combinator::{all_consuming, map, map_res, opt, recognize},
    multi::many0,
    sequence::{delimited, pair, preceded, tuple},
};

/// Number of base dimensions: length, mass, time, current, temperature,
/// amount of substance, luminous intensity.
pub const BASE_DIMENSIONS: usize = 7;

type Dims = [i32; BASE_DIMENSIONS];

/// Largest magnitude of a dimension power or decimal exponent of a unit.
const MAX_UNIT_EXPONENT: i32 = 1000;

/// Deepest parenthesis nesting accepted in a unit string.
const MAX_GROUP_DEPTH: usize = 16;

const NONE: Dims = [0, 0, 0, 0, 0, 0, 0];
const LENGTH: Dims = [1, 0, 0, 0, 0, 0, 0];
const MASS: Dims = [0, 1, 0, 0, 0, 0, 0];
const TIME: Dims = [0, 0, 1, 0, 0, 0, 0];
const CURRENT: Dims = [0, 0, 0, 1, 0, 0, 0];
const TEMPERATURE: Dims = [0, 0, 0, 0, 1, 0, 0];
const AMOUNT: Dims = [0, 0, 0, 0, 0, 1, 0];
const LUMINOSITY: Dims = [0, 0, 0, 0, 0, 0, 1];
const FORCE: Dims = [1, 1, -2, 0, 0, 0, 0];
const PRESSURE: Dims = [-1, 1, -2, 0, 0, 0, 0];
const ENERGY: Dims = [2, 1, -2, 0, 0, 0, 0];
const POWER: Dims = [2, 1, -3, 0, 0, 0, 0];
const FREQUENCY: Dims = [0, 0, -1, 0, 0, 0, 0];
const CHARGE: Dims = [0, 0, 1, 1, 0, 0, 0];
const VOLTAGE: Dims = [2, 1, -3, -1, 0, 0, 0];
const RESISTANCE: Dims = [2, 1, -3, -2, 0, 0, 0];
const VOLUME: Dims = [3, 0, 0, 0, 0, 0, 0];

/// A known unit symbol.
struct Symbol {
    name: &'static str,
    dims: Dims,
    mantissa: f64,
    exp10: i32,
    /// Whether SI prefixes may be attached.
    prefixable: bool,
}

const fn sym(name: &'static str, dims: Dims, mantissa: f64, exp10: i32, prefixable: bool) -> Symbol {
    Symbol {
        name,
        dims,
        mantissa,
        exp10,
        prefixable,
    }
}

const SYMBOLS: &[Symbol] = &[
    sym("m", LENGTH, 1.0, 0, true),
    sym("g", MASS, 1.0, -3, true),
    sym("s", TIME, 1.0, 0, true),
    sym("A", CURRENT, 1.0, 0, true),
    sym("K", TEMPERATURE, 1.0, 0, true),
    sym("mol", AMOUNT, 1.0, 0, true),
    sym("cd", LUMINOSITY, 1.0, 0, true),
    sym("N", FORCE, 1.0, 0, true),
    sym("Pa", PRESSURE, 1.0, 0, true),
    sym("J", ENERGY, 1.0, 0, true),
    sym("W", POWER, 1.0, 0, true),
    sym("Hz", FREQUENCY, 1.0, 0, true),
    sym("C", CHARGE, 1.0, 0, true),
    sym("V", VOLTAGE, 1.0, 0, true),
    sym("Ohm", RESISTANCE, 1.0, 0, true),
    sym("Ω", RESISTANCE, 1.0, 0, true),
    sym("l", VOLUME, 1.0, -3, true),
    sym("L", VOLUME, 1.0, -3, true),
    sym("bar", PRESSURE, 1.0, 5, true),
    sym("t", MASS, 1.0, 3, false),
    sym("min", TIME, 6.0, 1, false),
    sym("h", TIME, 3.6, 3, false),
    sym("d", TIME, 8.64, 4, false),
    sym("rad", NONE, 1.0, 0, true),
    sym("deg", NONE, std::f64::consts::PI / 180.0, 0, false),
    sym("%", NONE, 1.0, -2, false),
];

/// SI prefixes, two-letter prefixes first so that `da` wins over `d`.
const PREFIXES: &[(&str, i32)] = &[
    ("da", 1),
    ("Y", 24),
    ("Z", 21),
    ("E", 18),
    ("P", 15),
    ("T", 12),
    ("G", 9),
    ("M", 6),
    ("k", 3),
    ("h", 2),
    ("d", -1),
    ("c", -2),
    ("m", -3),
    ("u", -6),
    ("µ", -6),
    ("n", -9),
    ("p", -12),
    ("f", -15),
    ("a", -18),
    ("z", -21),
    ("y", -24),
];

// =============================================================================
// UNIT
// =============================================================================

/// A parsed physical unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unit {
    dims: Dims,
    mantissa: f64,
    exp10: i32,
}

impl Unit {
    /// The dimensionless unit `1`.
    #[must_use]
    pub const fn dimensionless() -> Self {
        Self {
            dims: NONE,
            mantissa: 1.0,
            exp10: 0,
        }
    }

    /// Parse a unit string.
    pub fn parse(text: &str) -> Result<Self, EdmError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::dimensionless());
        }
        if group_depth(trimmed) > MAX_GROUP_DEPTH {
            return Err(EdmError::Parse(format!("unit \"{}\" is nested too deeply", text)));
        }
        let (_, terms) = all_consuming(unit_expr)(trimmed)
            .map_err(|_| EdmError::Parse(format!("invalid unit \"{}\"", text)))?;
        let unit = combine(&terms, text)?;
        if !unit.mantissa.is_normal() {
            return Err(EdmError::Parse(format!("unit \"{}\" has no usable scale", text)));
        }
        Ok(unit)
    }

    /// Whether values in `self` can be converted to `other`.
    #[must_use]
    pub fn is_convertible_to(&self, other: &Self) -> bool {
        self.dims == other.dims
    }

    /// Factor converting values expressed in `self` into `target`.
    pub fn factor_to(&self, target: &Self) -> Option<Factor> {
        if !self.is_convertible_to(target) {
            return None;
        }
        Some(Factor {
            mantissa: self.mantissa / target.mantissa,
            exp10: self.exp10 - target.exp10,
        })
    }

    fn mul(&self, other: &Self, text: &str) -> Result<Self, EdmError> {
        let mut dims = self.dims;
        for (d, o) in dims.iter_mut().zip(other.dims.iter()) {
            *d = bounded(d.checked_add(*o), text)?;
        }
        Ok(Self {
            dims,
            mantissa: self.mantissa * other.mantissa,
            exp10: bounded(self.exp10.checked_add(other.exp10), text)?,
        })
    }

    fn powi(&self, p: i32, text: &str) -> Result<Self, EdmError> {
        let mut dims = self.dims;
        for d in &mut dims {
            *d = bounded(d.checked_mul(p), text)?;
        }
        Ok(Self {
            dims,
            mantissa: self.mantissa.powi(p),
            exp10: bounded(self.exp10.checked_mul(p), text)?,
        })
    }
}

/// Keep an exponent within `MAX_UNIT_EXPONENT`.
fn bounded(v: Option<i32>, text: &str) -> Result<i32, EdmError> {
    v.filter(|v| v.unsigned_abs() <= MAX_UNIT_EXPONENT.unsigned_abs()).ok_or_else(|| {
        EdmError::Parse(format!("unit exponent out of range in \"{}\"", text))
    })
}

fn combine(terms: &[(Op, Term<'_>)], text: &str) -> Result<Unit, EdmError> {
    let mut unit = Unit::dimensionless();
    for (op, term) in terms {
        let term = term.resolve(text)?;
        unit = match op {
            Op::Mul => unit.mul(&term, text)?,
            Op::Div => unit.mul(&term.powi(-1, text)?, text)?,
        };
    }
    Ok(unit)
}

fn group_depth(text: &str) -> usize {
    let mut depth = 0usize;
    let mut deepest = 0;
    for c in text.chars() {
        match c {
            '(' => {
                depth += 1;
                deepest = deepest.max(depth);
            }
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    deepest
}

/// Multiplicative conversion factor between two units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Factor {
    mantissa: f64,
    exp10: i32,
}

impl Factor {
    /// Whether applying the factor leaves values unchanged.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        (self.mantissa - 1.0).abs() < f64::EPSILON && self.exp10 == 0
    }

    /// Convert a value.
    #[must_use]
    pub fn apply(&self, value: f64) -> f64 {
        let scaled = if (self.mantissa - 1.0).abs() < f64::EPSILON {
            value
        } else {
            value * self.mantissa
        };
        // Unit exponents are bounded, so the difference of two fits in i32.
        let power = 10f64.powi(i32::try_from(self.exp10.unsigned_abs()).unwrap_or(i32::MAX));
        if self.exp10 >= 0 {
            scaled * power
        } else {
            scaled / power
        }
    }
}

// =============================================================================
// GRAMMAR
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Op {
    Mul,
    Div,
}

#[derive(Debug, Clone)]
enum Term<'a> {
    Symbol(&'a str, i32),
    Number(u32),
    Group(Vec<(Op, Term<'a>)>, i32),
}

impl Term<'_> {
    fn resolve(&self, text: &str) -> Result<Unit, EdmError> {
        match self {
            Term::Number(n) => Ok(Unit {
                dims: NONE,
                mantissa: f64::from(*n),
                exp10: 0,
            }),
            Term::Symbol(name, power) => lookup_symbol(name)
                .ok_or_else(|| EdmError::Parse(format!("unknown unit \"{}\" in \"{}\"", name, text)))?
                .powi(*power, text),
            Term::Group(terms, power) => combine(terms, text)?.powi(*power, text),
        }
    }
}

fn lookup_symbol(name: &str) -> Option<Unit> {
    let to_unit = |s: &Symbol| Unit {
        dims: s.dims,
        mantissa: s.mantissa,
        exp10: s.exp10,
    };
    if let Some(s) = SYMBOLS.iter().find(|s| s.name == name) {
        return Some(to_unit(s));
    }
    PREFIXES.iter().find_map(|(prefix, exp)| {
        let rest = name.strip_prefix(prefix)?;
        let s = SYMBOLS.iter().find(|s| s.name == rest && s.prefixable)?;
        let mut unit = to_unit(s);
        unit.exp10 += exp;
        Some(unit)
    })
}

fn signed_int(input: &str) -> IResult<&str, i32> {
    map_res(
        recognize(pair(opt(alt((pchar('+'), pchar('-')))), digit1)),
        str::parse::<i32>,
    )(input)
}

fn power(input: &str) -> IResult<&str, i32> {
    map(
        opt(alt((
            preceded(alt((tag("**"), tag("^"))), signed_int),
            signed_int,
        ))),
        |p| p.unwrap_or(1),
    )(input)
}

fn symbol_term(input: &str) -> IResult<&str, Term<'_>> {
    let (input, name) = take_while1(|c: char| c.is_alphabetic() || c == '%')(input)?;
    let (input, p) = power(input)?;
    Ok((input, Term::Symbol(name, p)))
}

fn number_term(input: &str) -> IResult<&str, Term<'_>> {
    map(map_res(digit1, str::parse::<u32>), Term::Number)(input)
}

fn group_term(input: &str) -> IResult<&str, Term<'_>> {
    let (input, inner) = delimited(
        pair(pchar('('), multispace0),
        unit_expr,
        pair(multispace0, pchar(')')),
    )(input)?;
    let (input, p) = power(input)?;
    Ok((input, Term::Group(inner, p)))
}

fn term(input: &str) -> IResult<&str, Term<'_>> {
    alt((group_term, number_term, symbol_term))(input)
}

fn separator(input: &str) -> IResult<&str, Op> {
    alt((
        map(tuple((multispace0, pchar('*'), multispace0)), |_| Op::Mul),
        map(tuple((multispace0, pchar('/'), multispace0)), |_| Op::Div),
        map(tuple((multispace0, pchar('.'), multispace0)), |_| Op::Mul),
        map(multispace1, |_| Op::Mul),
    ))(input)
}

fn unit_expr(input: &str) -> IResult<&str, Vec<(Op, Term<'_>)>> {
    let (input, first) = term(input)?;
    let (input, rest) = many0(pair(separator, term))(input)?;
    let mut terms = vec![(Op::Mul, first)];
    terms.extend(rest);
    Ok((input, terms))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn convert(value: f64, from: &str, to: &str) -> f64 {
        let from = Unit::parse(from).expect("from");
        let to = Unit::parse(to).expect("to");
        from.factor_to(&to).expect("convertible").apply(value)
    }

    #[test]
    fn prefix_conversion_is_exact() {
        assert_eq!(convert(2500.0, "mm", "m"), 2.5);
        assert_eq!(convert(20.0, "cm", "m"), 0.2);
        assert_eq!(convert(1.0, "km", "m"), 1000.0);
    }

    #[test]
    fn compound_units() {
        assert_eq!(convert(1.0, "kN*m", "kN m"), 1.0);
        assert_eq!(convert(1.0, "kN*m", "N*m"), 1000.0);
        assert!((convert(3.5, "g/cm3", "kg/m3") - 3500.0).abs() < 1e-9);
        assert!((convert(344.0, "um/m", "") - 344e-6).abs() < 1e-15);
        assert!((convert(89.5, "MPa", "N/mm2") - 89.5).abs() < 1e-12);
    }

    #[test]
    fn power_spellings_agree() {
        let a = Unit::parse("m2").expect("m2");
        let b = Unit::parse("m^2").expect("m^2");
        let c = Unit::parse("m**2").expect("m**2");
        assert_eq!(a, b);
        assert_eq!(b, c);
        let accel = Unit::parse("m s-2").expect("m s-2");
        assert!(accel.is_convertible_to(&Unit::parse("m/s/s").expect("m/s/s")));
        assert!(accel.is_convertible_to(&Unit::parse("N/kg").expect("N/kg")));
    }

    #[test]
    fn exact_symbols_win_over_prefixes() {
        assert!((convert(1.0, "min", "s") - 60.0).abs() < 1e-12);
        assert!((convert(1.0, "h", "min") - 60.0).abs() < 1e-12);
        assert!(Unit::parse("cd").expect("cd").is_convertible_to(&Unit::parse("kcd").expect("kcd")));
        assert!(Unit::parse("Pa").expect("Pa").is_convertible_to(&Unit::parse("bar").expect("bar")));
    }

    #[test]
    fn groups() {
        assert!((convert(1.0, "kg/(m s2)", "Pa") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn incompatible_units_have_no_factor() {
        let m = Unit::parse("m").expect("m");
        let s = Unit::parse("s").expect("s");
        assert!(m.factor_to(&s).is_none());
    }

    #[test]
    fn unknown_units_are_parse_errors() {
        assert!(matches!(Unit::parse("furlong"), Err(EdmError::Parse(_))));
        assert!(matches!(Unit::parse("m//s"), Err(EdmError::Parse(_))));
        assert!(matches!(Unit::parse("kmin"), Err(EdmError::Parse(_))));
    }

    #[test]
    fn huge_powers_are_rejected() {
        for text in ["km^1000000000", "m^-2147483648", "%^2000000000", "(km2)^999", "deg^100000"] {
            assert!(matches!(Unit::parse(text), Err(EdmError::Parse(_))), "{}", text);
        }
        let deep = format!("{}m{}", "(".repeat(10_000), ")".repeat(10_000));
        assert!(matches!(Unit::parse(&deep), Err(EdmError::Parse(_))));
        assert!(Unit::parse("((m))").is_ok());
        assert!((convert(1.0, "km^3", "m^3") - 1e9).abs() < 1e-3);
    }

    #[test]
    fn identity_factor() {
        let m = Unit::parse("m").expect("m");
        assert!(m.factor_to(&m).expect("same").is_identity());
        let mm = Unit::parse("mm").expect("mm");
        assert!(!mm.factor_to(&m).expect("length").is_identity());
    }
}
