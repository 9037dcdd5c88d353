//! Typed parameter values and their text form
//!
//! Values are self-describing: every value knows its [`ValueType`], can append
//! its text form to a buffer, and a type can consume a value of its shape from
//! the front of a text buffer, handing back the remainder. Primitive parameters
//! of a net carry these texts inside their quoted parameter strings.
//!
//! Text forms:
//! - scalars: `true`, `-12`, `0.25`
//! - arrays: `[v0,v1,...]` with a fixed length
//! - records: `{name:value,name:value}` with fields in declaration order

use crate::{Result, RccError};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Patterns for scalar text. Each has two capture groups: the scalar and the
/// remainder of the buffer.
struct ScalarPatterns {
    boolean: Regex,
    integer: Regex,
    double: Regex,
}

static SCALAR_PATTERNS: OnceLock<std::result::Result<ScalarPatterns, regex::Error>> = OnceLock::new();

fn scalar_patterns() -> Result<&'static ScalarPatterns> {
    SCALAR_PATTERNS
        .get_or_init(|| {
            Ok(ScalarPatterns {
                boolean: Regex::new(r"(?s)^(true|false)(.*)$")?,
                integer: Regex::new(r"(?s)^(-?[0-9]+)(.*)$")?,
                double: Regex::new(
                    r"(?s)^(NaN|-?inf|-?(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)(?:[eE][-+]?[0-9]+)?)(.*)$",
                )?,
            })
        })
        .as_ref()
        .map_err(|e| RccError::Value(format!("Invalid scalar pattern: {}", e)))
}

/// Shape of a value
#[derive(Debug, Clone, PartialEq)]
pub enum ValueType {
    Bool,
    Int,
    Double,
    Array(Box<ValueType>, usize),
    Record(Vec<(String, ValueType)>),
}

/// A typed value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Double(f64),
    Array { element: ValueType, items: Vec<Value> },
    Record(Vec<(String, Value)>),
}

impl ValueType {
    /// Consume one value of this type from the front of `text`
    ///
    /// Returns the value and the unconsumed remainder.
    pub fn consume<'a>(&self, text: &'a str) -> Result<(Value, &'a str)> {
        match self {
            ValueType::Bool => {
                let (token, rest) = match_scalar(&scalar_patterns()?.boolean, text, "bool")?;
                Ok((Value::Bool(token == "true"), rest))
            }
            ValueType::Int => {
                let (token, rest) = match_scalar(&scalar_patterns()?.integer, text, "int")?;
                let value = token
                    .parse::<i64>()
                    .map_err(|e| RccError::Value(format!("Invalid int '{}': {}", token, e)))?;
                Ok((Value::Int(value), rest))
            }
            ValueType::Double => {
                let (token, rest) = match_scalar(&scalar_patterns()?.double, text, "double")?;
                let value = token
                    .parse::<f64>()
                    .map_err(|e| RccError::Value(format!("Invalid double '{}': {}", token, e)))?;
                Ok((Value::Double(value), rest))
            }
            ValueType::Array(element, len) => {
                let mut rest = expect_char(text, '[')?;
                let mut items = Vec::with_capacity(*len);
                for index in 0..*len {
                    if index > 0 {
                        rest = expect_char(rest, ',')?;
                    }
                    let (item, after) = element.consume(rest)?;
                    items.push(item);
                    rest = after;
                }
                let rest = expect_char(rest, ']').map_err(|_| {
                    RccError::Value(format!("Array of length {} not closed", len))
                })?;
                Ok((
                    Value::Array {
                        element: (**element).clone(),
                        items,
                    },
                    rest,
                ))
            }
            ValueType::Record(fields) => {
                let mut rest = expect_char(text, '{')?;
                let mut values = Vec::with_capacity(fields.len());
                for (index, (name, field_type)) in fields.iter().enumerate() {
                    if index > 0 {
                        rest = expect_char(rest, ',')?;
                    }
                    let colon = rest.find(':').ok_or_else(|| {
                        RccError::Value(format!("Missing key for field '{}'", name))
                    })?;
                    let key = &rest[..colon];
                    if key != name {
                        return Err(RccError::Value(format!(
                            "Unexpected key '{}', expected '{}'",
                            key, name
                        )));
                    }
                    let (value, after) = field_type.consume(&rest[colon + 1..])?;
                    values.push((name.clone(), value));
                    rest = after;
                }
                let rest = expect_char(rest, '}')
                    .map_err(|_| RccError::Value("Record has unknown trailing fields".to_string()))?;
                Ok((Value::Record(values), rest))
            }
        }
    }

    /// Parse `text` as exactly one value of this type
    pub fn parse(&self, text: &str) -> Result<Value> {
        let (value, rest) = self.consume(text)?;
        if !rest.is_empty() {
            return Err(RccError::Value(format!("Trailing text after value: '{}'", rest)));
        }
        Ok(value)
    }
}

fn match_scalar<'a>(pattern: &Regex, text: &'a str, kind: &str) -> Result<(&'a str, &'a str)> {
    let captures = pattern
        .captures(text)
        .ok_or_else(|| RccError::Value(format!("Expected {} at '{}'", kind, text)))?;
    match (captures.get(1), captures.get(2)) {
        (Some(token), Some(rest)) => Ok((token.as_str(), rest.as_str())),
        _ => Err(RccError::Value(format!("Expected {} at '{}'", kind, text))),
    }
}

fn expect_char(text: &str, expected: char) -> Result<&str> {
    text.strip_prefix(expected)
        .ok_or_else(|| RccError::Value(format!("Expected '{}' at '{}'", expected, text)))
}

impl Value {
    /// Build an array, checking that every item has the element type
    pub fn array(element: ValueType, items: Vec<Value>) -> Result<Self> {
        if let Some(bad) = items.iter().find(|item| item.value_type() != element) {
            return Err(RccError::Value(format!(
                "Array item {} does not have element type {:?}",
                bad, element
            )));
        }
        Ok(Value::Array { element, items })
    }

    pub fn record<I, S>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let fields: Vec<(String, Value)> = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        for (index, (name, _)) in fields.iter().enumerate() {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(RccError::Value(format!("Invalid record field name '{}'", name)));
            }
            if fields[..index].iter().any(|(other, _)| other == name) {
                return Err(RccError::Value(format!("Duplicate record field '{}'", name)));
            }
        }
        Ok(Value::Record(fields))
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Double(_) => ValueType::Double,
            Value::Array { element, items } => ValueType::Array(Box::new(element.clone()), items.len()),
            Value::Record(fields) => ValueType::Record(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), value.value_type()))
                    .collect(),
            ),
        }
    }

    /// Append the text form to `buf`
    pub fn write_to(&self, buf: &mut String) {
        match self {
            Value::Bool(b) => buf.push_str(if *b { "true" } else { "false" }),
            Value::Int(i) => buf.push_str(&i.to_string()),
            Value::Double(d) => buf.push_str(&d.to_string()),
            Value::Array { items, .. } => {
                buf.push('[');
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        buf.push(',');
                    }
                    item.write_to(buf);
                }
                buf.push(']');
            }
            Value::Record(fields) => {
                buf.push('{');
                for (index, (name, value)) in fields.iter().enumerate() {
                    if index > 0 {
                        buf.push(',');
                    }
                    buf.push_str(name);
                    buf.push(':');
                    value.write_to(buf);
                }
                buf.push('}');
            }
        }
    }

    pub fn to_text(&self) -> String {
        let mut buf = String::new();
        self.write_to(&mut buf);
        buf
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}
