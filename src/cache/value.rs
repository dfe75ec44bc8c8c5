//! Typed views over the raw text held in the remote store

use serde::{Deserialize, Serialize};

/// The type a key is bound to after its first typed access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
  Bool,
  Char,
  Double,
  Integer,
  String,
  StringArray,
}

impl ValueKind {
  pub fn is_numeric(self) -> bool {
    matches!(self, ValueKind::Double | ValueKind::Integer)
  }

  /// Whether a key bound as `self` may be read or written as `requested`.
  /// Integer and double widen into each other; everything else must match.
  pub fn accepts(self, requested: ValueKind) -> bool {
    self == requested || (self.is_numeric() && requested.is_numeric())
  }
}

impl std::fmt::Display for ValueKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ValueKind::Bool => write!(f, "bool"),
      ValueKind::Char => write!(f, "char"),
      ValueKind::Double => write!(f, "double"),
      ValueKind::Integer => write!(f, "integer"),
      ValueKind::String => write!(f, "string"),
      ValueKind::StringArray => write!(f, "string-array"),
    }
  }
}

impl std::str::FromStr for ValueKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "bool" | "boolean" => Ok(ValueKind::Bool),
      "char" | "character" => Ok(ValueKind::Char),
      "double" | "float" | "f64" => Ok(ValueKind::Double),
      "integer" | "int" | "long" | "i64" => Ok(ValueKind::Integer),
      "string" | "str" => Ok(ValueKind::String),
      "string-array" | "string_array" | "array" => Ok(ValueKind::StringArray),
      _ => Err(format!("Unknown value kind: {}", s)),
    }
  }
}

/// A decoded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
  Bool(bool),
  Char(char),
  Double(f64),
  Integer(i64),
  String(String),
  StringArray(Vec<String>),
}

impl Value {
  pub fn kind(&self) -> ValueKind {
    match self {
      Value::Bool(_) => ValueKind::Bool,
      Value::Char(_) => ValueKind::Char,
      Value::Double(_) => ValueKind::Double,
      Value::Integer(_) => ValueKind::Integer,
      Value::String(_) => ValueKind::String,
      Value::StringArray(_) => ValueKind::StringArray,
    }
  }

  /// Value written when a reader initializes a key the store does not have
  pub fn zero(kind: ValueKind) -> Self {
    match kind {
      ValueKind::Bool => Value::Bool(false),
      ValueKind::Char => Value::Char('\0'),
      ValueKind::Double => Value::Double(0.0),
      ValueKind::Integer => Value::Integer(0),
      ValueKind::String => Value::String(String::new()),
      ValueKind::StringArray => Value::StringArray(Vec::new()),
    }
  }

  /// Interpret raw store text as `kind`. `None` when the text has no
  /// meaning for that kind (booleans and arrays only; numbers fall back to 0).
  pub fn decode(kind: ValueKind, raw: &str) -> Option<Self> {
    match kind {
      ValueKind::Bool => decode_bool(raw).map(Value::Bool),
      ValueKind::Char => Some(Value::Char(raw.chars().next().unwrap_or('\0'))),
      ValueKind::Double => Some(Value::Double(decode_double(raw))),
      ValueKind::Integer => Some(Value::Integer(decode_integer(raw))),
      ValueKind::String => Some(Value::String(raw.to_string())),
      ValueKind::StringArray => parse_pg_array(raw).map(Value::StringArray),
    }
  }

  /// Text form stored remotely
  pub fn encode(&self) -> String {
    match self {
      Value::Bool(true) => "true".to_string(),
      Value::Bool(false) => "false".to_string(),
      Value::Char('\0') => String::new(),
      Value::Char(c) => c.to_string(),
      Value::Double(d) => d.to_string(),
      Value::Integer(i) => i.to_string(),
      Value::String(s) => s.clone(),
      Value::StringArray(items) => format_pg_array(items),
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Value::Double(d) => Some(*d),
      Value::Integer(i) => Some(*i as f64),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Value::Integer(i) => Some(*i),
      Value::Double(d) => Some(d.trunc() as i64),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self {
    Value::Bool(b)
  }
}

impl From<char> for Value {
  fn from(c: char) -> Self {
    Value::Char(c)
  }
}

impl From<f64> for Value {
  fn from(d: f64) -> Self {
    Value::Double(d)
  }
}

impl From<i64> for Value {
  fn from(i: i64) -> Self {
    Value::Integer(i)
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::String(s.to_string())
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::String(s)
  }
}

impl From<Vec<String>> for Value {
  fn from(items: Vec<String>) -> Self {
    Value::StringArray(items)
  }
}

fn decode_bool(raw: &str) -> Option<bool> {
  match raw.chars().next()? {
    'T' | 't' | 'Y' | 'y' | '1' => Some(true),
    'F' | 'f' | 'N' | 'n' | '0' => Some(false),
    _ => None,
  }
}

fn decode_double(raw: &str) -> f64 {
  let s = raw.trim();
  if let Ok(d) = s.parse::<f64>() {
    return d;
  }
  numeric_prefix(s).parse::<f64>().unwrap_or(0.0)
}

fn decode_integer(raw: &str) -> i64 {
  let s = raw.trim();
  if let Ok(i) = s.parse::<i64>() {
    return i;
  }
  // `as` saturates and truncates toward zero
  decode_double(s).trunc() as i64
}

/// Longest prefix that looks like a decimal float (sign, digits, fraction, exponent)
fn numeric_prefix(s: &str) -> &str {
  let bytes = s.as_bytes();
  let mut end = 0;
  if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
    end += 1;
  }
  let digits_start = end;
  while end < bytes.len() && bytes[end].is_ascii_digit() {
    end += 1;
  }
  if end < bytes.len() && bytes[end] == b'.' {
    end += 1;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
      end += 1;
    }
  }
  if end == digits_start || (end == digits_start + 1 && bytes[digits_start] == b'.') {
    return "";
  }
  if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
    let mut exp = end + 1;
    if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
      exp += 1;
    }
    let exp_digits = exp;
    while exp < bytes.len() && bytes[exp].is_ascii_digit() {
      exp += 1;
    }
    if exp > exp_digits {
      end = exp;
    }
  }
  &s[..end]
}

/// Parse a PostgreSQL array literal such as `{here,"I am","for example"}`
pub fn parse_pg_array(raw: &str) -> Option<Vec<String>> {
  let inner = raw.trim().strip_prefix('{')?.strip_suffix('}')?;
  let mut items = Vec::new();
  if inner.trim().is_empty() {
    return Some(items);
  }

  let mut chars = inner.chars().peekable();
  loop {
    while chars.peek().map_or(false, |c| c.is_whitespace()) {
      chars.next();
    }
    let mut item = String::new();
    if chars.peek() == Some(&'"') {
      chars.next();
      let mut closed = false;
      while let Some(c) = chars.next() {
        match c {
          '\\' => item.push(chars.next()?),
          '"' => {
            closed = true;
            break;
          }
          _ => item.push(c),
        }
      }
      if !closed {
        return None;
      }
      while chars.peek().map_or(false, |c| c.is_whitespace()) {
        chars.next();
      }
    } else {
      while let Some(&c) = chars.peek() {
        if c == ',' {
          break;
        }
        if c == '"' || c == '{' || c == '}' {
          return None;
        }
        item.push(c);
        chars.next();
      }
      let trimmed = item.trim_end().to_string();
      item = trimmed;
    }
    items.push(item);
    match chars.next() {
      Some(',') => continue,
      None => break,
      Some(_) => return None,
    }
  }
  Some(items)
}

/// Format items as a PostgreSQL array literal, quoting where needed
pub fn format_pg_array(items: &[String]) -> String {
  let parts: Vec<String> = items
    .iter()
    .map(|item| {
      let needs_quotes = item.is_empty()
        || item.eq_ignore_ascii_case("null")
        || item
          .chars()
          .any(|c| c.is_whitespace() || matches!(c, ',' | '"' | '\\' | '{' | '}'));
      if needs_quotes {
        let escaped = item.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{}\"", escaped)
      } else {
        item.clone()
      }
    })
    .collect();
  format!("{{{}}}", parts.join(","))
}
