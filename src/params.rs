//! Connection parameters: the loosely shaped values a caller hands over
//! (`"COM3"`, `("COM3", 9600)`, a named map) and their canonical named form.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{CommError, CommResult};

/// A single connection parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Null,
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view; booleans count as 0/1 and numeric strings are parsed
    /// (`"0x0403"` included).
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Bool(b) => Some(i64::from(*b)),
            ParamValue::Float(f)
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 =>
            {
                Some(*f as i64)
            }
            ParamValue::Str(s) => parse_int(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(f) => Some(*f),
            ParamValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            ParamValue::Int(v) => Some(*v != 0),
            ParamValue::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }
}

fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Str(s) => write!(f, "{s}"),
            ParamValue::Null => write!(f, "null"),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

macro_rules! int_param {
    ($($t:ty),*) => {
        $(impl From<$t> for ParamValue {
            fn from(v: $t) -> Self {
                ParamValue::Int(i64::from(v))
            }
        })*
    };
}

int_param!(i64, i32, u32, u16, u8);

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(ParamValue::Null, Into::into)
    }
}

/// Canonical named connection parameters, in field order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnParams(IndexMap<String, ParamValue>);

impl ConnParams {
    pub fn new() -> Self {
        ConnParams(IndexMap::new())
    }

    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<ParamValue>) {
        self.0.insert(name.to_owned(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    /// Present and not null.
    pub fn value(&self, name: &str) -> Option<&ParamValue> {
        self.get(name).filter(|v| !v.is_null())
    }

    pub fn require_str(&self, name: &str) -> CommResult<String> {
        match self.value(name) {
            Some(ParamValue::Str(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(CommError::Validation(format!(
                "missing connection parameter '{name}'"
            ))),
        }
    }

    pub fn int_or(&self, name: &str, default: i64) -> CommResult<i64> {
        match self.value(name) {
            None => Ok(default),
            Some(v) => v.as_i64().ok_or_else(|| {
                CommError::Validation(format!("parameter '{name}' is not an integer: {v}"))
            }),
        }
    }

    pub fn bool_or(&self, name: &str, default: bool) -> CommResult<bool> {
        match self.value(name) {
            None => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| {
                CommError::Validation(format!("parameter '{name}' is not a flag: {v}"))
            }),
        }
    }

    /// Overlay `self` on top of `base`: fields of `self` win.
    pub fn overlay(&self, base: &ConnParams) -> ConnParams {
        let mut merged = base.clone();
        for (k, v) in &self.0 {
            merged.0.insert(k.clone(), v.clone());
        }
        merged
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for ConnParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        ConnParams(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Display for ConnParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}: {v}")?;
        }
        write!(f, "}}")
    }
}

/// Connection parameters as supplied by a caller, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum Conn {
    Named(ConnParams),
    Positional(Vec<ParamValue>),
    Scalar(ParamValue),
}

impl Conn {
    /// The value used for pattern based detection: the first positional
    /// element or the scalar itself.
    pub fn head(&self) -> Option<&ParamValue> {
        match self {
            Conn::Named(_) => None,
            Conn::Positional(values) => values.first(),
            Conn::Scalar(v) => Some(v),
        }
    }
}

impl From<ConnParams> for Conn {
    fn from(v: ConnParams) -> Self {
        Conn::Named(v)
    }
}

impl From<Vec<ParamValue>> for Conn {
    fn from(v: Vec<ParamValue>) -> Self {
        Conn::Positional(v)
    }
}

impl From<ParamValue> for Conn {
    fn from(v: ParamValue) -> Self {
        Conn::Scalar(v)
    }
}

impl From<&str> for Conn {
    fn from(v: &str) -> Self {
        Conn::Scalar(v.into())
    }
}

impl From<String> for Conn {
    fn from(v: String) -> Self {
        Conn::Scalar(v.into())
    }
}

impl From<i64> for Conn {
    fn from(v: i64) -> Self {
        Conn::Scalar(v.into())
    }
}

impl<A: Into<ParamValue>, B: Into<ParamValue>> From<(A, B)> for Conn {
    fn from((a, b): (A, B)) -> Self {
        Conn::Positional(vec![a.into(), b.into()])
    }
}

impl<A: Into<ParamValue>, B: Into<ParamValue>, C: Into<ParamValue>> From<(A, B, C)> for Conn {
    fn from((a, b, c): (A, B, C)) -> Self {
        Conn::Positional(vec![a.into(), b.into(), c.into()])
    }
}

/// Turn `conn` into named parameters using the backend's ordered field list.
///
/// Named parameters pass through unchanged (unknown keys included), a
/// positional sequence is zipped against `fields`, a scalar fills the first
/// field only.
pub fn normalize(conn: &Conn, fields: &[&str]) -> CommResult<ConnParams> {
    match conn {
        Conn::Named(params) => Ok(params.clone()),
        Conn::Positional(values) => {
            if values.len() > fields.len() {
                return Err(CommError::Validation(format!(
                    "{} positional connection parameters given, only {} fields known ({})",
                    values.len(),
                    fields.len(),
                    fields.join(", ")
                )));
            }
            Ok(fields
                .iter()
                .zip(values)
                .map(|(name, v)| (*name, v.clone()))
                .collect())
        }
        Conn::Scalar(v) => match fields.first() {
            Some(name) => Ok(ConnParams::new().with(name, v.clone())),
            None => Err(CommError::Validation(format!(
                "cannot interpret connection parameter '{v}' without named fields"
            ))),
        },
    }
}

/// Merge two connection parameter sets; `primary` overrides `secondary`
/// field by field.
pub fn combine(primary: &Conn, secondary: &Conn, fields: &[&str]) -> CommResult<ConnParams> {
    let base = normalize(secondary, fields)?;
    Ok(normalize(primary, fields)?.overlay(&base))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERIAL: &[&str] = &["port", "baudrate", "bytesize", "parity"];

    #[test]
    fn positional_zips_prefix() {
        let params = normalize(&("COM3", 9600).into(), SERIAL).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("port"), Some(&ParamValue::from("COM3")));
        assert_eq!(params.get("baudrate"), Some(&ParamValue::Int(9600)));
        assert!(!params.contains("bytesize"));
        let keys: Vec<_> = params.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["port", "baudrate"]);
    }

    #[test]
    fn scalar_fills_first_field() {
        let params = normalize(&"COM4".into(), SERIAL).unwrap();
        assert_eq!(params, ConnParams::new().with("port", "COM4"));
        assert!(normalize(&"COM4".into(), &[]).is_err());
    }

    #[test]
    fn named_passes_unknown_keys() {
        let named = ConnParams::new().with("port", "COM1").with("exotic", true);
        let params = normalize(&named.clone().into(), SERIAL).unwrap();
        assert_eq!(params, named);
    }

    #[test]
    fn too_many_positional_values() {
        let conn = Conn::Positional(vec![1.into(), 2.into(), 3.into()]);
        assert!(matches!(
            normalize(&conn, &["a", "b"]),
            Err(CommError::Validation(_))
        ));
    }

    #[test]
    fn combine_primary_wins() {
        let primary = ConnParams::new().with("port", "COM5");
        let secondary = ConnParams::new().with("port", "COM1").with("baudrate", 19200);
        let merged = combine(&primary.into(), &secondary.into(), SERIAL).unwrap();
        assert_eq!(merged.get("port"), Some(&ParamValue::from("COM5")));
        assert_eq!(merged.get("baudrate"), Some(&ParamValue::Int(19200)));

        let merged = combine(
            &"COM9".into(),
            &Conn::Positional(vec!["COM1".into(), 115200.into()]),
            SERIAL,
        )
        .unwrap();
        assert_eq!(merged.require_str("port").unwrap(), "COM9");
        assert_eq!(merged.int_or("baudrate", 0).unwrap(), 115200);
    }

    #[test]
    fn value_views() {
        assert_eq!(ParamValue::from("0x0403").as_i64(), Some(0x0403));
        assert_eq!(ParamValue::from(true).as_i64(), Some(1));
        assert_eq!(ParamValue::Int(0).as_bool(), Some(false));
        assert_eq!(ParamValue::from(Option::<u16>::None), ParamValue::Null);
        let params = ConnParams::new().with("port", ParamValue::Null);
        assert!(params.require_str("port").is_err());
        assert_eq!(params.int_or("baudrate", 42).unwrap(), 42);
        assert!(ConnParams::new().with("n", "x").int_or("n", 0).is_err());
    }

    #[test]
    fn float_integers_must_fit() {
        assert_eq!(ParamValue::Float(9600.0).as_i64(), Some(9600));
        assert_eq!(ParamValue::Float(1.5).as_i64(), None);
        assert_eq!(ParamValue::Float(1e300).as_i64(), None);
        assert_eq!(ParamValue::Float(-1e300).as_i64(), None);
        assert_eq!(ParamValue::Float(f64::NAN).as_i64(), None);
        assert!(ConnParams::new().with("baudrate", 1e300).int_or("baudrate", 0).is_err());
    }
}
