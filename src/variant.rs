//! Tagged value used for raw input, intermediate step output and results.
//!
//! A [`Variant`] is what flows between preprocessing steps. It is also the
//! payload of history entries and of every task/result message on the wire.

use std::cmp::Ordering;
use std::fmt;

/// Tagged value union
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Variant {
    /// No value
    #[default]
    None,
    /// Text value
    Str(String),
    /// Floating point value
    Dbl(f64),
    /// Unsigned integer value
    Ui64(u64),
    /// Opaque binary blob
    Bin(Vec<u8>),
}

/// Discriminant of a [`Variant`], matching its wire tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VariantKind {
    None = 0,
    Str = 1,
    Dbl = 2,
    Ui64 = 3,
    Bin = 4,
}

impl VariantKind {
    /// Human-readable type name used in diagnostics
    pub fn desc(self) -> &'static str {
        match self {
            VariantKind::None => "none",
            VariantKind::Str => "string",
            VariantKind::Dbl => "double",
            VariantKind::Ui64 => "uint64",
            VariantKind::Bin => "binary",
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(VariantKind::None),
            1 => Some(VariantKind::Str),
            2 => Some(VariantKind::Dbl),
            3 => Some(VariantKind::Ui64),
            4 => Some(VariantKind::Bin),
            _ => None,
        }
    }
}

/// Number of binary bytes shown by [`Variant::desc`]
const BIN_DESC_BYTES: usize = 7;

impl Variant {
    pub fn kind(&self) -> VariantKind {
        match self {
            Variant::None => VariantKind::None,
            Variant::Str(_) => VariantKind::Str,
            Variant::Dbl(_) => VariantKind::Dbl,
            Variant::Ui64(_) => VariantKind::Ui64,
            Variant::Bin(_) => VariantKind::Bin,
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Variant::None)
    }

    /// Type name used in diagnostics ("string", "double", ...)
    pub fn type_desc(&self) -> &'static str {
        self.kind().desc()
    }

    /// Value rendered the way diagnostics and string coercion show it.
    ///
    /// Doubles use six decimals with trailing zeros removed, binary blobs
    /// show their first bytes as hex.
    pub fn desc(&self) -> String {
        match self {
            Variant::None => String::new(),
            Variant::Str(s) => s.clone(),
            Variant::Dbl(d) => format_dbl(*d),
            Variant::Ui64(u) => u.to_string(),
            Variant::Bin(b) => b
                .iter()
                .take(BIN_DESC_BYTES)
                .map(|byte| format!("{:02x}", byte))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Convert to a double, parsing strings
    pub fn to_dbl(&self) -> Option<f64> {
        match self {
            Variant::Dbl(d) => Some(*d),
            Variant::Ui64(u) => Some(*u as f64),
            Variant::Str(s) => parse_dbl(s),
            _ => None,
        }
    }

    /// Convert to an unsigned integer. Negative doubles fail, others truncate.
    pub fn to_ui64(&self) -> Option<u64> {
        match self {
            Variant::Ui64(u) => Some(*u),
            Variant::Dbl(d) if *d >= 0.0 && d.is_finite() => Some(*d as u64),
            Variant::Dbl(_) => None,
            Variant::Str(s) => parse_ui64(s),
            _ => None,
        }
    }

    /// Convert to text. Binary and empty values have no text form.
    pub fn to_str(&self) -> Option<String> {
        match self {
            Variant::Str(s) => Some(s.clone()),
            Variant::Dbl(_) | Variant::Ui64(_) => Some(self.desc()),
            _ => None,
        }
    }

    /// Convert into the given kind, returning `None` when the value is not suitable
    pub fn convert(&self, kind: VariantKind) -> Option<Variant> {
        match kind {
            VariantKind::None => Some(Variant::None),
            VariantKind::Dbl => self.to_dbl().map(Variant::Dbl),
            VariantKind::Ui64 => self.to_ui64().map(Variant::Ui64),
            VariantKind::Str => self.to_str().map(Variant::Str),
            VariantKind::Bin => match self {
                Variant::Bin(_) => Some(self.clone()),
                _ => None,
            },
        }
    }

    /// Parse text into the narrowest numeric variant (integer first, then double)
    pub fn numeric(text: &str) -> Option<Variant> {
        let trimmed = text.trim_end_matches(['\r', '\n']).trim();
        if trimmed.starts_with("++") {
            return None;
        }
        if let Some(u) = parse_ui64(trimmed) {
            return Some(Variant::Ui64(u));
        }
        parse_dbl(trimmed).map(Variant::Dbl)
    }

    /// Compare two values, numerically when both sides are numeric.
    pub fn compare(&self, other: &Variant) -> Ordering {
        match (self, other) {
            (Variant::None, Variant::None) => Ordering::Equal,
            (Variant::None, _) => Ordering::Less,
            (_, Variant::None) => Ordering::Greater,
            (Variant::Bin(a), Variant::Bin(b)) => a.cmp(b),
            (Variant::Bin(_), _) => Ordering::Less,
            (_, Variant::Bin(_)) => Ordering::Greater,
            (Variant::Ui64(a), Variant::Ui64(b)) => a.cmp(b),
            _ => match (self.to_dbl(), other.to_dbl()) {
                (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                _ => self.desc().cmp(&other.desc()),
            },
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.desc())
    }
}

impl From<&str> for Variant {
    fn from(s: &str) -> Self {
        Variant::Str(s.to_string())
    }
}

impl From<String> for Variant {
    fn from(s: String) -> Self {
        Variant::Str(s)
    }
}

impl From<f64> for Variant {
    fn from(d: f64) -> Self {
        Variant::Dbl(d)
    }
}

impl From<u64> for Variant {
    fn from(u: u64) -> Self {
        Variant::Ui64(u)
    }
}

/// Six decimals with trailing zeros (and a dangling dot) removed
pub fn format_dbl(value: f64) -> String {
    let mut s = format!("{:.6}", value);
    strip_zeros(&mut s);
    s
}

fn strip_zeros(s: &mut String) {
    if !s.contains('.') {
        return;
    }
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
}

fn parse_dbl(text: &str) -> Option<f64> {
    let trimmed = text.trim_end_matches(['\r', '\n']).trim();
    if trimmed.is_empty()
        || !trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
    {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|d| d.is_finite())
}

fn parse_ui64(text: &str) -> Option<u64> {
    let trimmed = text.trim_end_matches(['\r', '\n']).trim();
    let mut buf = trimmed.strip_prefix('+').unwrap_or(trimmed).to_string();
    strip_zeros(&mut buf);
    if buf.is_empty() || !buf.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    buf.parse::<u64>().ok()
}
