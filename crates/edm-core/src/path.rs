//! # Path Grammar
//!
//! Dot-paths address attributes across linked objects:
//!
//! ```text
//! cs.rve.origin                  plain attribute traversal
//! csState[0].rveStates[-1]       single index (negative counts from the end)
//! a[1,].b[2,0,1]                 multi-index (trailing comma for one element)
//! rveStates[::-1]                slice, Python semantics
//! rveStates[:|len(materials)>1]  filter after `|`, evaluated per candidate
//! ```
//!
//! The filter text runs to the bracket that balances the subscript's opening
//! bracket, so filters may themselves contain `[...]`.

use crate::EdmError;
use crate::primitives::MAX_FILTER_DEPTH;
use nom::{
    IResult,
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char as pchar, digit1, one_of},
    combinator::{all_consuming, map, map_res, opt, recognize},
    error::ErrorKind,
    multi::{many1, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// TYPES
// =============================================================================

/// Bracketed selection applied to an array link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscript {
    /// `[i]`
    Index(i64),
    /// `[i,]`, `[a,b,c]`
    Multi(Vec<i64>),
    /// `[start:stop:step]`, each part optional.
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
}

impl Subscript {
    /// The full identity slice `[:]`.
    #[must_use]
    pub const fn full() -> Self {
        Subscript::Slice {
            start: None,
            stop: None,
            step: None,
        }
    }

    /// Select positions of a sequence of length `len`.
    ///
    /// Indices may be negative; out-of-range indices and a zero slice step
    /// are resolution errors.
    pub fn select(&self, len: usize) -> Result<Vec<usize>, EdmError> {
        match self {
            Subscript::Index(i) => Ok(vec![normalize_index(*i, len)?]),
            Subscript::Multi(ii) => ii.iter().map(|i| normalize_index(*i, len)).collect(),
            Subscript::Slice { start, stop, step } => slice_indices(len, *start, *stop, *step),
        }
    }
}

fn normalize_index(i: i64, len: usize) -> Result<usize, EdmError> {
    let n = len as i64;
    let idx = if i < 0 { i + n } else { i };
    if (0..n).contains(&idx) {
        Ok(idx as usize)
    } else {
        Err(EdmError::Resolution(format!(
            "index {} out of range for length {}",
            i, len
        )))
    }
}

fn slice_indices(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<Vec<usize>, EdmError> {
    let n = len as i64;
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(EdmError::Resolution("slice step cannot be zero".to_string()));
    }
    let (lower, upper) = if step < 0 { (-1, n - 1) } else { (0, n) };
    let adjust = |v: i64| (if v < 0 { v + n } else { v }).clamp(lower, upper);
    let start = start.map_or(if step < 0 { upper } else { lower }, adjust);
    let stop = stop.map_or(if step < 0 { lower } else { upper }, adjust);

    let mut out = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        out.push(i as usize);
        match i.checked_add(step) {
            Some(next) => i = next,
            None => break,
        }
    }
    Ok(out)
}

/// One segment of a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathEntry {
    pub attr: String,
    pub subscript: Option<Subscript>,
    pub filter: Option<String>,
}

impl PathEntry {
    /// An entry without subscript.
    #[must_use]
    pub fn attr(name: impl Into<String>) -> Self {
        Self {
            attr: name.into(),
            subscript: None,
            filter: None,
        }
    }

    /// An entry with a single index.
    #[must_use]
    pub fn indexed(name: impl Into<String>, index: i64) -> Self {
        Self {
            attr: name.into(),
            subscript: Some(Subscript::Index(index)),
            filter: None,
        }
    }

    /// Whether the entry selects at most one element (no subscript or a
    /// single index, and no filter).
    #[must_use]
    pub fn is_plain(&self) -> bool {
        self.filter.is_none() && matches!(self.subscript, None | Some(Subscript::Index(_)))
    }
}

impl fmt::Display for PathEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.attr)?;
        let Some(sub) = &self.subscript else {
            return Ok(());
        };
        f.write_str("[")?;
        match sub {
            Subscript::Index(i) => write!(f, "{}", i)?,
            Subscript::Multi(ii) if ii.len() == 1 => write!(f, "{},", ii[0])?,
            Subscript::Multi(ii) => {
                let parts: Vec<String> = ii.iter().map(i64::to_string).collect();
                f.write_str(&parts.join(","))?;
            }
            Subscript::Slice { start, stop, step } => {
                let opt = |v: &Option<i64>| v.map(|v| v.to_string()).unwrap_or_default();
                write!(f, "{}:{}", opt(start), opt(stop))?;
                if let Some(k) = step {
                    write!(f, ":{}", k)?;
                }
            }
        }
        if let Some(filter) = &self.filter {
            write!(f, "|{}", filter)?;
        }
        f.write_str("]")
    }
}

/// A parsed dot-path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path(Vec<PathEntry>);

impl Path {
    /// The empty path (the object itself).
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse a dot-path.
    pub fn parse(text: &str) -> Result<Self, EdmError> {
        if text.is_empty() {
            return Ok(Self::root());
        }
        match all_consuming(dot_path)(text) {
            Ok((_, entries)) => Ok(Self(entries)),
            Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(EdmError::Parse(format!(
                "invalid path \"{}\" near \"{}\"",
                text, e.input
            ))),
            Err(nom::Err::Incomplete(_)) => {
                Err(EdmError::Parse(format!("incomplete path \"{}\"", text)))
            }
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[PathEntry] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether every entry is plain; a plain path resolves to exactly one
    /// location.
    #[must_use]
    pub fn is_plain(&self) -> bool {
        self.0.iter().all(PathEntry::is_plain)
    }

    /// A new path with `entry` appended.
    #[must_use]
    pub fn child(&self, entry: PathEntry) -> Self {
        let mut entries = self.0.clone();
        entries.push(entry);
        Self(entries)
    }

    /// Append an entry in place.
    pub fn push(&mut self, entry: PathEntry) {
        self.0.push(entry);
    }

    /// Remove the last entry.
    pub fn pop(&mut self) -> Option<PathEntry> {
        self.0.pop()
    }
}

impl From<Vec<PathEntry>> for Path {
    fn from(entries: Vec<PathEntry>) -> Self {
        Self(entries)
    }
}

impl FromStr for Path {
    type Err = EdmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}

// =============================================================================
// GRAMMAR
// =============================================================================

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(is_ident_start),
        take_while(is_ident_continue),
    ))(input)
}

fn integer(input: &str) -> IResult<&str, i64> {
    map_res(recognize(pair(opt(one_of("+-")), digit1)), str::parse::<i64>)(input)
}

fn slice(input: &str) -> IResult<&str, Subscript> {
    map(
        tuple((
            opt(integer),
            preceded(pchar(':'), opt(integer)),
            opt(preceded(pchar(':'), opt(integer))),
        )),
        |(start, stop, step)| Subscript::Slice {
            start,
            stop,
            step: step.flatten(),
        },
    )(input)
}

fn multi_index(input: &str) -> IResult<&str, Subscript> {
    map(
        pair(many1(terminated(integer, pchar(','))), opt(integer)),
        |(mut head, last)| {
            head.extend(last);
            Subscript::Multi(head)
        },
    )(input)
}

fn index(input: &str) -> IResult<&str, Subscript> {
    map(integer, Subscript::Index)(input)
}

/// Text with balanced square brackets, up to the first unmatched `]`.
fn balanced(input: &str) -> IResult<&str, &str> {
    let mut depth = 0usize;
    for (pos, c) in input.char_indices() {
        match c {
            '[' => {
                depth += 1;
                if depth > MAX_FILTER_DEPTH {
                    return Err(nom::Err::Failure(nom::error::Error::new(
                        &input[pos..],
                        ErrorKind::TooLarge,
                    )));
                }
            }
            ']' if depth == 0 => return Ok((&input[pos..], &input[..pos])),
            ']' => depth -= 1,
            _ => {}
        }
    }
    if depth == 0 {
        Ok(("", input))
    } else {
        Err(nom::Err::Error(nom::error::Error::new(input, ErrorKind::Char)))
    }
}

fn subscript(input: &str) -> IResult<&str, (Subscript, Option<&str>)> {
    delimited(
        pchar('['),
        pair(
            alt((slice, multi_index, index)),
            opt(preceded(pchar('|'), balanced)),
        ),
        pchar(']'),
    )(input)
}

fn entry(input: &str) -> IResult<&str, PathEntry> {
    map(pair(identifier, opt(subscript)), |(attr, sub)| {
        let (subscript, filter) = match sub {
            Some((s, f)) => (Some(s), f.map(str::to_string)),
            None => (None, None),
        };
        PathEntry {
            attr: attr.to_string(),
            subscript,
            filter,
        }
    })(input)
}

fn dot_path(input: &str) -> IResult<&str, Vec<PathEntry>> {
    separated_list1(pchar('.'), entry)(input)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Option<Subscript> {
        Some(Subscript::Slice { start, stop, step })
    }

    fn parse(s: &str) -> Vec<PathEntry> {
        Path::parse(s).expect("valid path").entries().to_vec()
    }

    #[test]
    fn chained_subscripts() {
        let p = parse("a[1,].b[:3:-1].c[0].d");
        assert_eq!(p.len(), 4);
        assert_eq!(p[0].subscript, Some(Subscript::Multi(vec![1])));
        assert_eq!(p[1].subscript, slice(None, Some(3), Some(-1)));
        assert_eq!(p[2].subscript, Some(Subscript::Index(0)));
        assert_eq!(p[3], PathEntry::attr("d"));
    }

    #[test]
    fn subscript_forms() {
        assert_eq!(parse("a[1]")[0].subscript, Some(Subscript::Index(1)));
        assert_eq!(parse("a[-1]")[0].subscript, Some(Subscript::Index(-1)));
        assert_eq!(parse("a[1,2,3]")[0].subscript, Some(Subscript::Multi(vec![1, 2, 3])));
        assert_eq!(parse("a[1,2,3,]")[0].subscript, Some(Subscript::Multi(vec![1, 2, 3])));
        assert_eq!(parse("a[:]")[0].subscript, slice(None, None, None));
        assert_eq!(parse("a[::]")[0].subscript, slice(None, None, None));
        assert_eq!(parse("a[1:]")[0].subscript, slice(Some(1), None, None));
        assert_eq!(parse("a[::-1]")[0].subscript, slice(None, None, Some(-1)));
        assert_eq!(parse("a[+2:-1:2]")[0].subscript, slice(Some(2), Some(-1), Some(2)));
    }

    #[test]
    fn filters() {
        let p = parse("a[1,2,3].b[2].c[1:2|a>3]");
        assert_eq!(p[2].filter.as_deref(), Some("a>3"));
        let p = parse("a[:|a[45[45]]>3]");
        assert_eq!(p[0].filter.as_deref(), Some("a[45[45]]>3"));
        assert!(!p[0].is_plain());
        let p = parse("a[0|x]");
        assert!(!p[0].is_plain());
        let p = parse(r#"rveStates[:|sigmaHom["value"]<85]"#);
        assert_eq!(p[0].filter.as_deref(), Some(r#"sigmaHom["value"]<85"#));
    }

    #[test]
    fn malformed_paths() {
        for bad in ["a.", ".a", "a[", "a[]", "a[x]", "a[1", "a[1]]", "1a", "a[|x]", "a..b", "a[:|[]"] {
            assert!(
                matches!(Path::parse(bad), Err(EdmError::Parse(_))),
                "{} should not parse",
                bad
            );
        }
    }

    #[test]
    fn empty_path_is_root() {
        assert!(Path::parse("").expect("empty").is_empty());
    }

    #[test]
    fn canonical_unparse() {
        for (input, canonical) in [
            ("a[1,].b[:3:-1].c[0].d", "a[1,].b[:3:-1].c[0].d"),
            ("a[::]", "a[:]"),
            ("a[1:2:]", "a[1:2]"),
            ("a[1,2,]", "a[1,2]"),
            ("a[+1]", "a[1]"),
            ("a[:|len(b)<2]", "a[:|len(b)<2]"),
        ] {
            let p = Path::parse(input).expect("valid");
            assert_eq!(p.to_string(), canonical);
            assert_eq!(Path::parse(canonical).expect("canonical"), p);
        }
    }

    #[test]
    fn plainness() {
        assert!(Path::parse("a.b[0].c").expect("p").is_plain());
        assert!(!Path::parse("a.b[0,].c").expect("p").is_plain());
        assert!(!Path::parse("a[:]").expect("p").is_plain());
    }

    #[test]
    fn python_slice_semantics() {
        let full = Subscript::full();
        assert_eq!(full.select(3).expect("ok"), vec![0, 1, 2]);
        let rev = Subscript::Slice { start: None, stop: None, step: Some(-1) };
        assert_eq!(rev.select(3).expect("ok"), vec![2, 1, 0]);
        let tail = Subscript::Slice { start: None, stop: Some(3), step: Some(-1) };
        assert_eq!(tail.select(6).expect("ok"), vec![5, 4]);
        let clamp = Subscript::Slice { start: Some(-10), stop: Some(10), step: None };
        assert_eq!(clamp.select(2).expect("ok"), vec![0, 1]);
        let empty = Subscript::Slice { start: Some(2), stop: Some(1), step: None };
        assert!(empty.select(4).expect("ok").is_empty());
        let step0 = Subscript::Slice { start: None, stop: None, step: Some(0) };
        assert!(step0.select(3).is_err());
    }

    #[test]
    fn extreme_slice_steps_stop_at_the_bound() {
        let up = Subscript::Slice { start: Some(1), stop: None, step: Some(i64::MAX) };
        assert_eq!(up.select(3).expect("ok"), vec![1]);
        let down = Subscript::Slice { start: None, stop: None, step: Some(i64::MIN) };
        assert_eq!(down.select(3).expect("ok"), vec![2]);
        let from_min = Subscript::Slice { start: Some(i64::MIN), stop: Some(i64::MAX), step: Some(i64::MAX) };
        assert_eq!(from_min.select(3).expect("ok"), vec![0]);
        let p = Path::parse("xs[1::9223372036854775807].n").expect("parse");
        assert_eq!(p.entries()[0].subscript, slice(Some(1), None, Some(i64::MAX)));
    }

    #[test]
    fn deeply_nested_filters_are_rejected() {
        let ok = format!("a[:|{}1{}]", "[".repeat(MAX_FILTER_DEPTH), "]".repeat(MAX_FILTER_DEPTH));
        assert!(Path::parse(&ok).is_ok());
        let deep = format!("a[:|{}1{}]", "[".repeat(20_000), "]".repeat(20_000));
        assert!(matches!(Path::parse(&deep), Err(EdmError::Parse(_))));
        assert!(matches!(Path::parse("a[:|[1]"), Err(EdmError::Parse(_))));
    }

    #[test]
    fn index_selection() {
        assert_eq!(Subscript::Index(-1).select(3).expect("ok"), vec![2]);
        assert!(Subscript::Index(3).select(3).is_err());
        assert!(Subscript::Index(-4).select(3).is_err());
        assert_eq!(Subscript::Multi(vec![2, 0, 2]).select(3).expect("ok"), vec![2, 0, 2]);
        assert!(Subscript::Multi(vec![0, 5]).select(3).is_err());
    }
}
