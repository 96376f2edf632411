//! Invocation values, method signatures and overload resolution.
//!
//! Resolution runs in two passes. The first accepts only signatures whose
//! parameter types equal the argument types. The second admits numeric
//! widening, optional parameters (which also take `Null`) and `Any`, then
//! keeps the unique signature that is at least as specific as every other
//! candidate. Ties are rejected.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Concrete type of this value; `Null` has none.
    pub fn param_type(&self) -> Option<ParamType> {
        Some(match self {
            Value::Null => return None,
            Value::Bool(_) => ParamType::Bool,
            Value::Byte(_) => ParamType::Byte,
            Value::Short(_) => ParamType::Short,
            Value::Int(_) => ParamType::Int,
            Value::Long(_) => ParamType::Long,
            Value::Float(_) => ParamType::Float,
            Value::Double(_) => ParamType::Double,
            Value::Str(_) => ParamType::Str,
            Value::Bytes(_) => ParamType::Bytes,
            Value::List(_) => ParamType::List,
            Value::Map(_) => ParamType::Map,
        })
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Byte(v) => Some(*v as i64),
            Value::Short(v) => Some(*v as i64),
            Value::Int(v) => Some(*v as i64),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Widen to `target`. Callers only pass targets the value is assignable to.
    fn widen_to(&self, target: &ParamType) -> Value {
        if let Some(n) = self.as_i64() {
            match target {
                ParamType::Short => return Value::Short(n as i16),
                ParamType::Int => return Value::Int(n as i32),
                ParamType::Long => return Value::Long(n),
                ParamType::Float => return Value::Float(n as f32),
                ParamType::Double => return Value::Double(n as f64),
                _ => {}
            }
        }
        match (self, target) {
            (Value::Float(v), ParamType::Double) => Value::Double(*v as f64),
            (v, _) => v.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Byte(v) => write!(f, "{}", v),
            Value::Short(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{:?}", v),
            Value::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
            Value::List(v) => write!(f, "[{} items]", v.len()),
            Value::Map(v) => write!(f, "{{{} entries}}", v.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamType {
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Str,
    Bytes,
    List,
    Map,
    /// Accepts the inner type or `Null`
    Optional(Box<ParamType>),
    /// Accepts anything
    Any,
}

impl ParamType {
    pub fn optional(inner: ParamType) -> Self {
        ParamType::Optional(Box::new(inner))
    }

    fn numeric_rank(&self) -> Option<u8> {
        match self {
            ParamType::Byte => Some(0),
            ParamType::Short => Some(1),
            ParamType::Int => Some(2),
            ParamType::Long => Some(3),
            ParamType::Float => Some(4),
            ParamType::Double => Some(5),
            _ => None,
        }
    }

    /// Whether every value of `self` is also a valid `other`.
    pub fn is_assignable_to(&self, other: &ParamType) -> bool {
        if self == other || *other == ParamType::Any {
            return true;
        }
        match (self, other) {
            (ParamType::Optional(a), ParamType::Optional(b)) => a.is_assignable_to(b),
            (ParamType::Optional(_), _) => false,
            (a, ParamType::Optional(b)) => a.is_assignable_to(b),
            (a, b) => match (a.numeric_rank(), b.numeric_rank()) {
                (Some(from), Some(to)) => from <= to,
                _ => false,
            },
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match value.param_type() {
            Some(t) => t.is_assignable_to(self),
            None => matches!(self, ParamType::Optional(_) | ParamType::Any),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Optional(inner) => write!(f, "{}?", inner),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodSignature {
    pub name: String,
    pub params: Vec<ParamType>,
}

impl MethodSignature {
    pub fn new(name: &str, params: &[ParamType]) -> Self {
        Self {
            name: name.to_string(),
            params: params.to_vec(),
        }
    }

    fn exactly_matches(&self, args: &[Value]) -> bool {
        self.params.len() == args.len()
            && self
                .params
                .iter()
                .zip(args)
                .all(|(p, a)| a.param_type().as_ref() == Some(p))
    }

    fn accepts(&self, args: &[Value]) -> bool {
        self.params.len() == args.len() && self.params.iter().zip(args).all(|(p, a)| p.accepts(a))
    }

    fn at_least_as_specific_as(&self, other: &MethodSignature) -> bool {
        self.params
            .iter()
            .zip(&other.params)
            .all(|(a, b)| a.is_assignable_to(b))
    }

    /// Convert arguments to this signature's parameter types.
    pub fn coerce(&self, args: Vec<Value>) -> Vec<Value> {
        args.into_iter()
            .zip(&self.params)
            .map(|(arg, param)| match param {
                ParamType::Optional(inner) => arg.widen_to(inner),
                other => arg.widen_to(other),
            })
            .collect()
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
        write!(f, "{}({})", self.name, params.join(", "))
    }
}

/// Render argument types the way they appear in "method not found" errors.
pub fn describe_args(args: &[Value]) -> String {
    args.iter()
        .map(|a| match a.param_type() {
            Some(t) => t.to_string(),
            None => "null".to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Pick the signature `name(args)` binds to.
pub fn resolve<'a>(
    signatures: &'a [MethodSignature],
    name: &str,
    args: &[Value],
) -> Option<&'a MethodSignature> {
    let named: Vec<&MethodSignature> = signatures.iter().filter(|s| s.name == name).collect();

    if let Some(exact) = named.iter().find(|s| s.exactly_matches(args)) {
        return Some(*exact);
    }

    let applicable: Vec<&MethodSignature> =
        named.into_iter().filter(|s| s.accepts(args)).collect();
    let mut best = applicable.iter().filter(|candidate| {
        applicable
            .iter()
            .all(|other| candidate.at_least_as_specific_as(other))
    });
    match (best.next(), best.next()) {
        (Some(winner), None) => Some(*winner),
        _ => None,
    }
}
