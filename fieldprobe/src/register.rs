//! Typed register model.
//!
//! A [`Register`] describes where a value lives (base address and word
//! count), how its raw 16-bit words decode into a [`Value`], and tracks the
//! last decoded value together with its age.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::transport::Access;

/// Maximum age of a value unless overridden by name.
pub const AGE_LIMIT_DEFAULT: Duration = Duration::from_secs(4);

/// Shorter limit for readings expected to change rapidly.
pub const AGE_LIMIT_FAST: Duration = Duration::from_secs(1);

/// Maximum age for a register with the given name.
pub fn default_max_age(name: &str) -> Duration {
    match name {
        "/Ac/Power" | "/Ac/L1/Power" | "/Ac/L2/Power" | "/Ac/L3/Power" => AGE_LIMIT_FAST,
        _ => AGE_LIMIT_DEFAULT,
    }
}

/// Errors from decoding or encoding register words.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("expected {expected} words, got {got}")]
    Length { expected: u16, got: usize },
    #[error("raw value {0:#06x} has no table entry")]
    Unmapped(u16),
    #[error("invalid {0} text")]
    Encoding(&'static str),
    #[error("register is not numeric")]
    NotNumeric,
    #[error("register has no value")]
    NoValue,
}

/// A decoded register value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
    Enum { raw: u16, label: String },
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Enum { raw, .. } => Some(*raw as f64),
            Value::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Enum { label, .. } => Some(label),
            Value::Number(_) => None,
        }
    }

    /// Integral numbers as i64, for table lookups.
    fn as_index(&self) -> Option<i64> {
        match self {
            Value::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => Some(*n as i64),
            Value::Enum { raw, .. } => Some(*raw as i64),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<u16> for Value {
    fn from(n: u16) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => match self.as_index() {
                Some(i) => write!(f, "{}", i),
                None => write!(f, "{}", n),
            },
            Value::Text(s) => f.write_str(s),
            Value::Enum { label, .. } => f.write_str(label),
        }
    }
}

/// Binary layout of a numeric register.
///
/// Plain variants are big-endian word order; `Le` variants put the low word
/// first. Bytes within a word are always big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumFormat {
    U16,
    S16,
    U32,
    S32,
    F32,
    U32Le,
    S32Le,
    F32Le,
    U64,
    S64,
}

impl NumFormat {
    /// Number of 16-bit words occupied.
    pub fn word_count(&self) -> u16 {
        match self {
            NumFormat::U16 | NumFormat::S16 => 1,
            NumFormat::U32
            | NumFormat::S32
            | NumFormat::F32
            | NumFormat::U32Le
            | NumFormat::S32Le
            | NumFormat::F32Le => 2,
            NumFormat::U64 | NumFormat::S64 => 4,
        }
    }

    fn little_endian(&self) -> bool {
        matches!(self, NumFormat::U32Le | NumFormat::S32Le | NumFormat::F32Le)
    }

    /// Join words into the raw unsigned bit pattern.
    fn assemble(&self, words: &[u16]) -> u64 {
        let fold = |acc: u64, w: &u16| (acc << 16) | *w as u64;
        if self.little_endian() {
            words.iter().rev().fold(0, fold)
        } else {
            words.iter().fold(0, fold)
        }
    }

    /// Split a raw bit pattern back into words.
    fn split(&self, raw: u64) -> Vec<u16> {
        let n = self.word_count() as usize;
        let mut words: Vec<u16> = (0..n)
            .map(|i| (raw >> (16 * (n - 1 - i))) as u16)
            .collect();
        if self.little_endian() {
            words.reverse();
        }
        words
    }

    fn interpret(&self, raw: u64) -> f64 {
        match self {
            NumFormat::U16 => raw as u16 as f64,
            NumFormat::S16 => raw as u16 as i16 as f64,
            NumFormat::U32 | NumFormat::U32Le => raw as u32 as f64,
            NumFormat::S32 | NumFormat::S32Le => raw as u32 as i32 as f64,
            NumFormat::F32 | NumFormat::F32Le => f32::from_bits(raw as u32) as f64,
            NumFormat::U64 => raw as f64,
            NumFormat::S64 => raw as i64 as f64,
        }
    }

    fn raw_from(&self, v: f64) -> u64 {
        match self {
            NumFormat::U16 => v.round() as u16 as u64,
            NumFormat::S16 => v.round() as i16 as u16 as u64,
            NumFormat::U32 | NumFormat::U32Le => v.round() as u32 as u64,
            NumFormat::S32 | NumFormat::S32Le => v.round() as i32 as u32 as u64,
            NumFormat::F32 | NumFormat::F32Le => (v as f32).to_bits() as u64,
            NumFormat::U64 => v.round() as u64,
            NumFormat::S64 => v.round() as i64 as u64,
        }
    }
}

/// Character encoding of a text register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    #[default]
    Ascii,
    Utf8,
    Latin1,
}

/// How a register's words are interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterKind {
    /// Integer or float, divided by `scale`.
    Numeric { format: NumFormat, scale: f64 },
    /// Packed characters, two per word, NUL padded.
    Text { encoding: TextEncoding },
    /// Single word looked up in a fixed table.
    Mapped { table: BTreeMap<u16, String> },
}

/// Human formatting of a register value.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayFormat {
    /// Fixed precision with a unit suffix, e.g. "230.1 V".
    Units { precision: usize, suffix: String },
    /// Names for particular integral values.
    Labels(BTreeMap<i64, String>),
}

impl DisplayFormat {
    pub fn units(precision: usize, suffix: impl Into<String>) -> Self {
        DisplayFormat::Units {
            precision,
            suffix: suffix.into(),
        }
    }

    /// Labels indexed by position, starting at zero.
    pub fn labels<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        DisplayFormat::Labels(
            labels
                .into_iter()
                .enumerate()
                .map(|(i, s)| (i as i64, s.into()))
                .collect(),
        )
    }
}

/// Callback fired after a register's value changed.
pub type ChangeCallback = Arc<dyn Fn(&Register) + Send + Sync>;

/// A register definition plus its current value.
#[derive(Clone)]
pub struct Register {
    pub base: u16,
    pub count: u16,
    pub name: Option<String>,
    kind: RegisterKind,
    access: Option<Access>,
    invalid: Option<u64>,
    display: Option<DisplayFormat>,
    writable: bool,
    max_age: Duration,
    value: Option<Value>,
    updated: Option<Instant>,
    on_change: Option<ChangeCallback>,
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = format!("{:#06x}", self.base);
        f.debug_struct("Register")
            .field("base", &base)
            .field("count", &self.count)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

impl Register {
    pub fn new(base: u16, count: u16, kind: RegisterKind) -> Self {
        Self {
            base,
            count,
            name: None,
            kind,
            access: None,
            invalid: None,
            display: None,
            writable: false,
            max_age: AGE_LIMIT_DEFAULT,
            value: None,
            updated: None,
            on_change: None,
        }
    }

    /// Numeric register in the given layout, scale 1.
    pub fn numeric(base: u16, format: NumFormat) -> Self {
        Self::new(
            base,
            format.word_count(),
            RegisterKind::Numeric { format, scale: 1.0 },
        )
    }

    pub fn u16(base: u16) -> Self {
        Self::numeric(base, NumFormat::U16)
    }

    pub fn s16(base: u16) -> Self {
        Self::numeric(base, NumFormat::S16)
    }

    pub fn u32(base: u16) -> Self {
        Self::numeric(base, NumFormat::U32)
    }

    pub fn s32(base: u16) -> Self {
        Self::numeric(base, NumFormat::S32)
    }

    pub fn f32(base: u16) -> Self {
        Self::numeric(base, NumFormat::F32)
    }

    pub fn u32le(base: u16) -> Self {
        Self::numeric(base, NumFormat::U32Le)
    }

    pub fn s32le(base: u16) -> Self {
        Self::numeric(base, NumFormat::S32Le)
    }

    pub fn f32le(base: u16) -> Self {
        Self::numeric(base, NumFormat::F32Le)
    }

    /// Text register spanning `count` words.
    pub fn text(base: u16, count: u16) -> Self {
        Self::new(
            base,
            count,
            RegisterKind::Text {
                encoding: TextEncoding::Ascii,
            },
        )
    }

    /// Single-word register decoded through `table`.
    pub fn mapped<S: Into<String>>(base: u16, table: impl IntoIterator<Item = (u16, S)>) -> Self {
        Self::new(
            base,
            1,
            RegisterKind::Mapped {
                table: table.into_iter().map(|(k, v)| (k, v.into())).collect(),
            },
        )
    }

    /// Set the name; the age limit follows the name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.max_age = default_max_age(&name);
        self.name = Some(name);
        self
    }

    /// Divisor applied after decoding (numeric registers only).
    pub fn scale(mut self, factor: f64) -> Self {
        if let RegisterKind::Numeric { scale, .. } = &mut self.kind {
            *scale = factor;
        }
        self
    }

    pub fn encoding(mut self, enc: TextEncoding) -> Self {
        if let RegisterKind::Text { encoding } = &mut self.kind {
            *encoding = enc;
        }
        self
    }

    /// Raw bit pattern meaning "not present".
    pub fn invalid(mut self, raw: u64) -> Self {
        self.invalid = Some(raw);
        self
    }

    pub fn display(mut self, display: DisplayFormat) -> Self {
        self.display = Some(display);
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = age;
        self
    }

    /// Pin the register bank this register is read from.
    pub fn access(mut self, access: Access) -> Self {
        self.access = Some(access);
        self
    }

    pub fn on_change(mut self, callback: impl Fn(&Register) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(callback));
        self
    }

    pub fn kind(&self) -> &RegisterKind {
        &self.kind
    }

    pub fn bank(&self) -> Option<Access> {
        self.access
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.updated
    }

    pub fn limit(&self) -> Duration {
        self.max_age
    }

    /// Interpret raw words without touching the stored value.
    ///
    /// `Ok(None)` means the device reported the "not present" sentinel.
    pub fn decode(&self, words: &[u16]) -> Result<Option<Value>, DecodeError> {
        if words.len() != self.count as usize {
            return Err(DecodeError::Length {
                expected: self.count,
                got: words.len(),
            });
        }

        match &self.kind {
            RegisterKind::Numeric { format, scale } => {
                let raw = format.assemble(words);
                if self.invalid == Some(raw) {
                    return Ok(None);
                }
                Ok(Some(Value::Number(format.interpret(raw) / scale)))
            }
            RegisterKind::Text { encoding } => {
                let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
                while bytes.last() == Some(&0) {
                    bytes.pop();
                }
                let text: String = match encoding {
                    TextEncoding::Ascii if bytes.is_ascii() => {
                        bytes.iter().map(|&b| b as char).collect()
                    }
                    TextEncoding::Ascii => return Err(DecodeError::Encoding("ascii")),
                    TextEncoding::Utf8 => {
                        String::from_utf8(bytes).map_err(|_| DecodeError::Encoding("utf-8"))?
                    }
                    TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
                };
                Ok(Some(Value::Text(text)))
            }
            RegisterKind::Mapped { table } => {
                let raw = words[0];
                if self.invalid == Some(raw as u64) {
                    return Ok(None);
                }
                table
                    .get(&raw)
                    .map(|label| {
                        Some(Value::Enum {
                            raw,
                            label: label.clone(),
                        })
                    })
                    .ok_or(DecodeError::Unmapped(raw))
            }
        }
    }

    /// Words to write for the current value (numeric registers only).
    pub fn encode(&self) -> Result<Vec<u16>, DecodeError> {
        let RegisterKind::Numeric { format, scale } = &self.kind else {
            return Err(DecodeError::NotNumeric);
        };
        let value = self
            .value
            .as_ref()
            .and_then(Value::as_f64)
            .ok_or(DecodeError::NoValue)?;

        Ok(format.split(format.raw_from(value * scale)))
    }

    /// Store a decoded value and refresh the timestamp.
    ///
    /// Returns true when the value differs from the previous one, including
    /// the first value after none.
    pub fn update(&mut self, value: Option<Value>) -> bool {
        let changed = value != self.value;
        self.value = value;
        self.updated = Some(Instant::now());
        changed
    }

    /// Decode and store. On error the previous value is kept and keeps ageing.
    pub fn decode_and_update(&mut self, words: &[u16]) -> Result<bool, DecodeError> {
        let value = self.decode(words)?;
        Ok(self.update(value))
    }

    /// Stage a value for writing without marking it as read.
    pub fn set_value(&mut self, value: impl Into<Value>) {
        self.value = Some(value.into());
    }

    /// Fire the change callback, if any.
    pub fn notify(&self) {
        if let Some(callback) = &self.on_change {
            callback(self);
        }
    }

    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.updated.map(|t| now.saturating_duration_since(t))
    }

    /// Whether the last update is within the age limit at `now`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.age(now).is_some_and(|age| age <= self.max_age)
    }

    /// Human-readable value, or `None` before the first decode.
    ///
    /// Values with no matching label fall back to the raw value.
    pub fn formatted(&self) -> Option<String> {
        let value = self.value.as_ref()?;
        let text = match (&self.display, value) {
            (Some(DisplayFormat::Units { precision, suffix }), Value::Number(n)) => {
                if suffix.is_empty() {
                    format!("{:.*}", precision, n)
                } else {
                    format!("{:.*} {}", precision, n, suffix)
                }
            }
            (Some(DisplayFormat::Labels(labels)), v) => v
                .as_index()
                .and_then(|i| labels.get(&i).cloned())
                .unwrap_or_else(|| v.to_string()),
            (_, v) => v.to_string(),
        };
        Some(text)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.formatted() {
            Some(text) => f.write_str(&text),
            None => f.write_str("--"),
        }
    }
}
