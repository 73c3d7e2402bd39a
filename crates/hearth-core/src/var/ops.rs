//! Operator semantics over values
//!
//! Every operator is type-checked and returns `Err(code)` instead of
//! coercing: mixed int/float arithmetic is E_TYPE, zero divisors are E_DIV,
//! and a float result that leaves the representable range is E_FLOAT.
//! Indexing is 1-based with inclusive bounds.

use super::{str_cmp, ErrCode, Value};
use std::cmp::Ordering;
use std::rc::Rc;

fn float_result(f: f64) -> Result<Value, ErrCode> {
    if f.is_finite() {
        Ok(Value::Float(f))
    } else {
        Err(ErrCode::E_FLOAT)
    }
}

impl Value {
    /// Addition; also string concatenation
    pub fn add(&self, other: &Value) -> Result<Value, ErrCode> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
            (Value::Float(a), Value::Float(b)) => float_result(a + b),
            (Value::Str(a), Value::Str(b)) => {
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                Ok(Value::Str(Rc::from(s.as_str())))
            }
            _ => Err(ErrCode::E_TYPE),
        }
    }

    /// Subtraction
    pub fn sub(&self, other: &Value) -> Result<Value, ErrCode> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(*b))),
            (Value::Float(a), Value::Float(b)) => float_result(a - b),
            _ => Err(ErrCode::E_TYPE),
        }
    }

    /// Multiplication
    pub fn mul(&self, other: &Value) -> Result<Value, ErrCode> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(*b))),
            (Value::Float(a), Value::Float(b)) => float_result(a * b),
            _ => Err(ErrCode::E_TYPE),
        }
    }

    /// Division; zero divisor raises E_DIV
    pub fn div(&self, other: &Value) -> Result<Value, ErrCode> {
        match (self, other) {
            (Value::Int(_), Value::Int(0)) => Err(ErrCode::E_DIV),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_div(*b))),
            (Value::Float(_), Value::Float(b)) if *b == 0.0 => Err(ErrCode::E_DIV),
            (Value::Float(a), Value::Float(b)) => float_result(a / b),
            _ => Err(ErrCode::E_TYPE),
        }
    }

    /// Modulo; zero divisor raises E_DIV
    pub fn rem(&self, other: &Value) -> Result<Value, ErrCode> {
        match (self, other) {
            (Value::Int(_), Value::Int(0)) => Err(ErrCode::E_DIV),
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_rem(*b))),
            (Value::Float(_), Value::Float(b)) if *b == 0.0 => Err(ErrCode::E_DIV),
            (Value::Float(a), Value::Float(b)) => float_result(a % b),
            _ => Err(ErrCode::E_TYPE),
        }
    }

    /// Exponentiation; a negative integer exponent is only defined for
    /// bases 1 and -1
    pub fn pow(&self, other: &Value) -> Result<Value, ErrCode> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => {
                if *b >= 0 {
                    let exp = u32::try_from(*b).map_err(|_| ErrCode::E_RANGE)?;
                    Ok(Value::Int(a.wrapping_pow(exp)))
                } else {
                    match a {
                        1 => Ok(Value::Int(1)),
                        -1 => Ok(Value::Int(if b % 2 == 0 { 1 } else { -1 })),
                        _ => Err(ErrCode::E_INVARG),
                    }
                }
            }
            (Value::Float(a), Value::Float(b)) => float_result(a.powf(*b)),
            _ => Err(ErrCode::E_TYPE),
        }
    }

    /// Unary negation
    pub fn neg(&self) -> Result<Value, ErrCode> {
        match self {
            Value::Int(a) => Ok(Value::Int(a.wrapping_neg())),
            Value::Float(a) => Ok(Value::Float(-a)),
            _ => Err(ErrCode::E_TYPE),
        }
    }

    /// Ordered comparison within a comparable type pair
    pub fn compare(&self, other: &Value) -> Result<Ordering, ErrCode> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Ok(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => Ok(a.total_cmp(b)),
            (Value::Str(a), Value::Str(b)) => Ok(str_cmp(a, b)),
            (Value::Obj(a), Value::Obj(b)) => Ok(a.cmp(b)),
            (Value::Err(a), Value::Err(b)) => Ok(a.cmp(b)),
            _ => Err(ErrCode::E_TYPE),
        }
    }

    /// Membership: 1-based position of `self` in the list `other`, or 0
    pub fn index_in(&self, other: &Value) -> Result<Value, ErrCode> {
        match other {
            Value::List(l) => Ok(Value::Int(l.index_of(self))),
            _ => Err(ErrCode::E_TYPE),
        }
    }

    /// Length of a string, list, or map
    pub fn length(&self) -> Result<Value, ErrCode> {
        match self {
            Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::List(l) => Ok(Value::Int(l.len() as i64)),
            Value::Map(m) => Ok(Value::Int(m.len() as i64)),
            _ => Err(ErrCode::E_TYPE),
        }
    }

    /// 1-based indexing of a string or list; map lookup by key
    pub fn index(&self, index: &Value) -> Result<Value, ErrCode> {
        match self {
            Value::List(l) => {
                let i = as_index(index)?;
                l.index(i)
            }
            Value::Str(s) => {
                let i = as_index(index)?;
                if i < 1 {
                    return Err(ErrCode::E_RANGE);
                }
                match s.chars().nth(i as usize - 1) {
                    Some(c) => Ok(Value::Str(Rc::from(c.to_string().as_str()))),
                    None => Err(ErrCode::E_RANGE),
                }
            }
            Value::Map(m) => m.get(index),
            _ => Err(ErrCode::E_TYPE),
        }
    }

    /// Structural index assignment, producing the updated value
    pub fn index_set(&self, index: &Value, value: Value) -> Result<Value, ErrCode> {
        match self {
            Value::List(l) => {
                let i = as_index(index)?;
                let mut updated = l.clone();
                updated.index_set(i, value)?;
                Ok(Value::List(updated))
            }
            Value::Map(m) => {
                let mut updated = m.clone();
                updated.insert(index.clone(), value)?;
                Ok(Value::Map(updated))
            }
            Value::Str(s) => {
                let i = as_index(index)?;
                let Value::Str(replacement) = value else {
                    return Err(ErrCode::E_TYPE);
                };
                let chars: Vec<char> = s.chars().collect();
                if i < 1 || i as usize > chars.len() {
                    return Err(ErrCode::E_RANGE);
                }
                let mut out = String::with_capacity(s.len() + replacement.len());
                out.extend(&chars[..i as usize - 1]);
                out.push_str(&replacement);
                out.extend(&chars[i as usize..]);
                Ok(Value::Str(Rc::from(out.as_str())))
            }
            _ => Err(ErrCode::E_TYPE),
        }
    }

    /// 1-based inclusive range of a string or list
    pub fn range(&self, from: &Value, to: &Value) -> Result<Value, ErrCode> {
        let (from, to) = (as_index(from)?, as_index(to)?);
        match self {
            Value::List(l) => Ok(Value::List(l.range(from, to)?)),
            Value::Str(s) => {
                if to < from {
                    return Ok(Value::Str(Rc::from("")));
                }
                let chars: Vec<char> = s.chars().collect();
                if from < 1 || to as usize > chars.len() {
                    return Err(ErrCode::E_RANGE);
                }
                let out: String = chars[from as usize - 1..to as usize].iter().collect();
                Ok(Value::Str(Rc::from(out.as_str())))
            }
            _ => Err(ErrCode::E_TYPE),
        }
    }

    /// Structural range assignment, producing the updated value
    pub fn range_set(&self, from: &Value, to: &Value, value: &Value) -> Result<Value, ErrCode> {
        let (from, to) = (as_index(from)?, as_index(to)?);
        match (self, value) {
            (Value::List(l), Value::List(v)) => {
                let mut updated = l.clone();
                updated.range_set(from, to, v)?;
                Ok(Value::List(updated))
            }
            (Value::Str(s), Value::Str(v)) => {
                let chars: Vec<char> = s.chars().collect();
                let len = chars.len() as i64;
                if from < 1 || from > len + 1 || to < from - 1 || to > len {
                    return Err(ErrCode::E_RANGE);
                }
                let mut out = String::with_capacity(s.len() + v.len());
                out.extend(&chars[..from as usize - 1]);
                out.push_str(v);
                out.extend(&chars[to as usize..]);
                Ok(Value::Str(Rc::from(out.as_str())))
            }
            (Value::List(_) | Value::Str(_), _) => Err(ErrCode::E_TYPE),
            _ => Err(ErrCode::E_TYPE),
        }
    }
}

fn as_index(v: &Value) -> Result<i64, ErrCode> {
    match v {
        Value::Int(i) => Ok(*i),
        _ => Err(ErrCode::E_TYPE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::var::{v_err, v_float, v_int, v_list, v_str, Map};

    #[test]
    fn test_int_arithmetic() {
        assert_eq!(v_int(40).add(&v_int(2)).unwrap(), v_int(42));
        assert_eq!(v_int(7).rem(&v_int(3)).unwrap(), v_int(1));
        assert_eq!(v_int(2).pow(&v_int(10)).unwrap(), v_int(1024));
        assert_eq!(v_int(5).neg().unwrap(), v_int(-5));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(v_int(1).div(&v_int(0)), Err(ErrCode::E_DIV));
        assert_eq!(v_int(1).rem(&v_int(0)), Err(ErrCode::E_DIV));
        assert_eq!(v_float(1.0).div(&v_float(0.0)), Err(ErrCode::E_DIV));
    }

    #[test]
    fn test_no_numeric_coercion() {
        assert_eq!(v_int(1).add(&v_float(1.0)), Err(ErrCode::E_TYPE));
        assert_eq!(v_float(1.0).mul(&v_int(2)), Err(ErrCode::E_TYPE));
    }

    #[test]
    fn test_float_domain_error() {
        let big = v_float(f64::MAX);
        assert_eq!(big.mul(&big), Err(ErrCode::E_FLOAT));
        assert_eq!(v_float(-1.0).pow(&v_float(0.5)), Err(ErrCode::E_FLOAT));
    }

    #[test]
    fn test_negative_int_pow() {
        assert_eq!(v_int(1).pow(&v_int(-3)).unwrap(), v_int(1));
        assert_eq!(v_int(-1).pow(&v_int(-3)).unwrap(), v_int(-1));
        assert_eq!(v_int(2).pow(&v_int(-1)), Err(ErrCode::E_INVARG));
    }

    #[test]
    fn test_string_concat() {
        assert_eq!(v_str("foo").add(&v_str("bar")).unwrap(), v_str("foobar"));
    }

    #[test]
    fn test_compare() {
        assert_eq!(v_int(1).compare(&v_int(2)).unwrap(), Ordering::Less);
        assert_eq!(
            v_str("Apple").compare(&v_str("apple")).unwrap(),
            Ordering::Equal
        );
        assert_eq!(v_int(1).compare(&v_str("1")), Err(ErrCode::E_TYPE));
    }

    #[test]
    fn test_membership() {
        let l = v_list(vec![v_int(10), v_int(20)]);
        assert_eq!(v_int(20).index_in(&l).unwrap(), v_int(2));
        assert_eq!(v_int(30).index_in(&l).unwrap(), v_int(0));
        assert_eq!(v_int(1).index_in(&v_int(2)), Err(ErrCode::E_TYPE));
    }

    #[test]
    fn test_string_indexing() {
        let s = v_str("hello");
        assert_eq!(s.index(&v_int(1)).unwrap(), v_str("h"));
        assert_eq!(s.index(&v_int(5)).unwrap(), v_str("o"));
        assert_eq!(s.index(&v_int(6)), Err(ErrCode::E_RANGE));
        assert_eq!(s.index(&v_int(0)), Err(ErrCode::E_RANGE));
        assert_eq!(s.range(&v_int(2), &v_int(4)).unwrap(), v_str("ell"));
    }

    #[test]
    fn test_string_index_set() {
        let s = v_str("cat");
        assert_eq!(s.index_set(&v_int(1), v_str("b")).unwrap(), v_str("bat"));
        assert_eq!(
            s.index_set(&v_int(2), v_str("ough")).unwrap(),
            v_str("cought")
        );
        assert_eq!(s.index_set(&v_int(4), v_str("x")), Err(ErrCode::E_RANGE));
        assert_eq!(s.index_set(&v_int(1), v_int(1)), Err(ErrCode::E_TYPE));
    }

    #[test]
    fn test_list_index_set_is_cow() {
        let original = v_list(vec![v_int(1), v_int(2)]);
        let updated = original.index_set(&v_int(1), v_int(9)).unwrap();
        assert_eq!(updated, v_list(vec![v_int(9), v_int(2)]));
        assert_eq!(original, v_list(vec![v_int(1), v_int(2)]));
    }

    #[test]
    fn test_map_index() {
        let mut m = Map::new();
        m.insert(v_str("k"), v_int(5)).unwrap();
        let v = Value::Map(m);
        assert_eq!(v.index(&v_str("K")).unwrap(), v_int(5));
        assert_eq!(v.index(&v_str("missing")), Err(ErrCode::E_RANGE));
        let updated = v.index_set(&v_str("k2"), v_int(6)).unwrap();
        assert_eq!(updated.index(&v_str("k2")).unwrap(), v_int(6));
        assert_eq!(v.index(&v_str("k2")), Err(ErrCode::E_RANGE));
    }

    #[test]
    fn test_range_set_string() {
        let s = v_str("monster");
        assert_eq!(
            s.range_set(&v_int(1), &v_int(3), &v_str("ga")).unwrap(),
            v_str("gaster")
        );
    }

    #[test]
    fn test_err_compare() {
        assert!(v_err(ErrCode::E_TYPE)
            .compare(&v_err(ErrCode::E_DIV))
            .unwrap()
            .is_lt());
    }
}
