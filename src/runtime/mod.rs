pub mod builtin;
pub mod context;
pub mod object;
pub mod ops;
pub mod vm;

use crate::base::RawValue;
use object::{EsObject, ObjHandle};

/// A runtime value. Exactly one payload per tag; `Object` holds a shared
/// handle and nothing else.
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Integer(i32),
    Float(f64),
    Str(String),
    Object(ObjHandle),
}

impl Value {
    pub fn object(obj: EsObject) -> Value {
        Value::Object(object::handle(obj))
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) | Value::Float(_) => "number",
            Value::Str(_) => "string",
            Value::Object(o) => {
                if o.borrow().callable.is_some() {
                    "function"
                } else {
                    "object"
                }
            }
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    pub fn as_object(&self) -> Option<ObjHandle> {
        match self {
            Value::Object(o) => Some(o.clone()),
            _ => None,
        }
    }

    // ── Coercions (ECMA-262 §9) ──

    pub fn to_float(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b { 1.0 } else { 0.0 }
            }
            Value::Integer(i) => *i as f64,
            Value::Float(f) => *f,
            Value::Str(s) => s.trim().parse::<f64>().unwrap_or(f64::NAN),
            Value::Object(_) => self.to_primitive(PrimitiveHint::Number).to_float_primitive(),
        }
    }

    // Avoids re-entering the object arm after to_primitive.
    fn to_float_primitive(&self) -> f64 {
        match self {
            Value::Object(_) => f64::NAN,
            other => other.to_float(),
        }
    }

    /// ToInt32: truncate toward zero, then wrap modulo 2^32.
    pub fn to_integer(&self) -> i32 {
        let f = self.to_float();
        if !f.is_finite() {
            return 0;
        }
        f.trunc().rem_euclid(4294967296.0) as u32 as i32
    }

    pub fn to_boolean(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0 && !f.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Object(_) => true,
        }
    }

    /// ToString (§9.8). Whole numbers print without a decimal point.
    pub fn coerce_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) if f.is_nan() => "NaN".to_string(),
            Value::Float(f) if f.is_infinite() => {
                if *f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
            }
            Value::Float(f) => f.to_string(),
            Value::Str(s) => s.clone(),
            Value::Object(o) => object::default_string(o),
        }
    }

    pub fn to_primitive(&self, hint: PrimitiveHint) -> Value {
        match self {
            Value::Object(o) => object::default_value(o, hint),
            other => other.clone(),
        }
    }

    /// Internal identity, distinct from language-level equality: objects
    /// compare by handle.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => std::rc::Rc::ptr_eq(a, b),
            _ => strict_equals(self, other),
        }
    }

    pub fn from_raw_literal(raw: &RawValue) -> Option<Value> {
        match raw {
            RawValue::Str(s) => Some(Value::Str(s.clone())),
            RawValue::Boolean(b) => Some(Value::Bool(*b)),
            RawValue::Integer(i) => Some(Value::Integer(*i)),
            RawValue::Float(f) => Some(Value::Float(*f)),
            RawValue::Constant(_) | RawValue::Register(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveHint {
    Number,
    String,
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.coerce_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Value {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        // Whole in-range numbers normalize to the integer representation.
        if f.fract() == 0.0 && f.is_finite() && f.abs() <= i32::MAX as f64 {
            Value::Integer(f as i32)
        } else {
            Value::Float(f)
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(s)
    }
}

// ── Equality and relational algorithms ──

/// Numeric equality: NaN equals nothing, positive and negative zero are
/// equal.
pub fn number_equals(x: &Value, y: &Value) -> bool {
    let (a, b) = (x.to_float(), y.to_float());
    if a.is_nan() || b.is_nan() {
        return false;
    }
    a == b
}

/// Strict equality (§11.9.6). Integer and Float share the number type;
/// objects compare by handle identity.
pub fn strict_equals(x: &Value, y: &Value) -> bool {
    match (x, y) {
        (Value::Undefined, Value::Undefined) => true,
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Object(a), Value::Object(b)) => std::rc::Rc::ptr_eq(a, b),
        _ if x.is_numeric() && y.is_numeric() => number_equals(x, y),
        _ => false,
    }
}

/// Abstract equality (§11.9.3).
pub fn abstract_equals(x: &Value, y: &Value) -> bool {
    use Value::*;
    match (x, y) {
        (Null, Undefined) | (Undefined, Null) => true,
        _ if x.is_numeric() && y.is_numeric() => number_equals(x, y),
        (Undefined, Undefined) | (Null, Null) => true,
        (Bool(_), _) => abstract_equals(&Value::Float(x.to_float()), y),
        (_, Bool(_)) => abstract_equals(x, &Value::Float(y.to_float())),
        (Str(a), Str(b)) => a == b,
        (Object(a), Object(b)) => std::rc::Rc::ptr_eq(a, b),
        (Str(_), _) | (_, Str(_)) if x.is_numeric() || y.is_numeric() => number_equals(x, y),
        (Object(_), Str(_)) | (Object(_), Integer(_)) | (Object(_), Float(_)) => {
            abstract_equals(&x.to_primitive(PrimitiveHint::Number), y)
        }
        (Str(_), Object(_)) | (Integer(_), Object(_)) | (Float(_), Object(_)) => {
            abstract_equals(x, &y.to_primitive(PrimitiveHint::Number))
        }
        _ => false,
    }
}

/// The abstract relational comparison (§11.8.5): `x < y`. Returns
/// `Undefined` when either side coerces to NaN.
pub fn abstract_less(x: &Value, y: &Value) -> Value {
    let px = x.to_primitive(PrimitiveHint::Number);
    let py = y.to_primitive(PrimitiveHint::Number);
    if let (Value::Str(a), Value::Str(b)) = (&px, &py) {
        return Value::Bool(a < b);
    }
    let (a, b) = (px.to_float(), py.to_float());
    if a.is_nan() || b.is_nan() {
        Value::Undefined
    } else {
        Value::Bool(a < b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_boolean_table() {
        assert!(!Value::Undefined.to_boolean());
        assert!(!Value::Null.to_boolean());
        assert!(!Value::Str(String::new()).to_boolean());
        assert!(Value::Str("0".into()).to_boolean());
        assert!(!Value::Integer(0).to_boolean());
        assert!(!Value::Float(f64::NAN).to_boolean());
        assert!(!Value::Float(-0.0).to_boolean());
        assert!(Value::Float(0.5).to_boolean());
        assert!(Value::object(EsObject::plain()).to_boolean());
    }

    #[test]
    fn to_float_table() {
        assert!(Value::Undefined.to_float().is_nan());
        assert_eq!(Value::Null.to_float(), 0.0);
        assert_eq!(Value::Bool(true).to_float(), 1.0);
        assert_eq!(Value::Str("  2.5 ".into()).to_float(), 2.5);
        assert!(Value::Str("two".into()).to_float().is_nan());
    }

    #[test]
    fn to_integer_truncates_toward_zero() {
        assert_eq!(Value::Float(2.9).to_integer(), 2);
        assert_eq!(Value::Float(-2.9).to_integer(), -2);
        assert_eq!(Value::Float(f64::NAN).to_integer(), 0);
        assert_eq!(Value::Float(f64::INFINITY).to_integer(), 0);
        // ToInt32 wraps
        assert_eq!(Value::Float(4294967296.0 + 5.0).to_integer(), 5);
    }

    #[test]
    fn coerce_string_numbers() {
        assert_eq!(Value::Float(42.0).coerce_string(), "42");
        assert_eq!(Value::Float(0.5).coerce_string(), "0.5");
        assert_eq!(Value::Float(f64::NAN).coerce_string(), "NaN");
        assert_eq!(Value::Float(f64::NEG_INFINITY).coerce_string(), "-Infinity");
        assert_eq!(Value::Undefined.coerce_string(), "undefined");
    }

    #[test]
    fn strict_implies_abstract() {
        let samples = [
            Value::Undefined,
            Value::Null,
            Value::Bool(true),
            Value::Integer(3),
            Value::Float(3.0),
            Value::Str("3".into()),
        ];
        for x in &samples {
            for y in &samples {
                if strict_equals(x, y) {
                    assert!(abstract_equals(x, y), "{:?} vs {:?}", x, y);
                }
            }
        }
    }

    #[test]
    fn null_and_undefined_abstractly_equal() {
        assert!(abstract_equals(&Value::Null, &Value::Undefined));
        assert!(abstract_equals(&Value::Undefined, &Value::Null));
        assert!(!strict_equals(&Value::Null, &Value::Undefined));
    }

    #[test]
    fn nan_never_equals_itself() {
        let nan = Value::Float(f64::NAN);
        assert!(!abstract_equals(&nan, &nan));
        assert!(!strict_equals(&nan, &nan));
    }

    #[test]
    fn number_string_coercion() {
        assert!(abstract_equals(&Value::Integer(5), &Value::Str("5".into())));
        assert!(abstract_equals(&Value::Str("5".into()), &Value::Float(5.0)));
        assert!(!abstract_equals(&Value::Integer(5), &Value::Str("x".into())));
    }

    #[test]
    fn boolean_promotes_to_number() {
        assert!(abstract_equals(&Value::Bool(true), &Value::Str("1".into())));
        assert!(abstract_equals(&Value::Bool(false), &Value::Integer(0)));
    }

    #[test]
    fn object_identity_vs_equality() {
        let a = Value::object(EsObject::plain());
        let b = a.clone();
        let c = Value::object(EsObject::plain());
        assert!(strict_equals(&a, &b));
        assert!(!strict_equals(&a, &c));
        assert!(!abstract_equals(&a, &c));
    }

    #[test]
    fn abstract_less_nan_is_undefined() {
        let r = abstract_less(&Value::Float(f64::NAN), &Value::Integer(1));
        assert!(matches!(r, Value::Undefined));
        assert!(matches!(
            abstract_less(&Value::Integer(1), &Value::Integer(2)),
            Value::Bool(true)
        ));
        assert!(matches!(
            abstract_less(&Value::Str("a".into()), &Value::Str("b".into())),
            Value::Bool(true)
        ));
    }
}
