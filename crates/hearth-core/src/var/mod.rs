//! Runtime values
//!
//! [`Value`] is the tagged, reference-counted datum every part of the VM
//! operates on. Scalars are copied; strings, lists, and maps share their
//! payload through `Rc` and copy on write. Two internal marker kinds
//! ([`Value::Catch`] and [`Value::Finally`]) and the loop cursor
//! ([`Value::Iter`]) only ever appear on operand stacks.

mod error;
mod list;
mod map;
mod ops;

pub use error::ErrCode;
pub use list::List;
pub use map::Map;

use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;

/// A numbered object reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjId(pub i64);

impl ObjId {
    /// The "no object" sentinel
    pub const NOTHING: ObjId = ObjId(-1);
    /// Ambiguous command match
    pub const AMBIGUOUS: ObjId = ObjId(-2);
    /// Failed command match
    pub const FAILED_MATCH: ObjId = ObjId(-3);
    /// The system object
    pub const SYSTEM: ObjId = ObjId(0);

    /// Whether this id can possibly name a database object
    pub fn is_positional(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An anonymous-object reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnonId(pub u64);

/// Code list carried by a catch marker
#[derive(Debug, Clone, PartialEq)]
pub enum CatchCodes {
    /// Matches every raised code
    Any,
    /// Matches the error values in the list
    Codes(List),
}

impl CatchCodes {
    /// Whether a raised code matches this marker
    pub fn matches(&self, code: ErrCode) -> bool {
        match self {
            CatchCodes::Any => true,
            CatchCodes::Codes(list) => list.iter().any(|v| *v == Value::Err(code)),
        }
    }
}

/// Operand-stack marker for one except/catch arm
#[derive(Debug, Clone, PartialEq)]
pub struct CatchMarker {
    /// Codes this arm handles
    pub codes: CatchCodes,
    /// Handler entry point in the current vector
    pub handler: u16,
}

/// Operand-stack marker for a finally body
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinallyMarker {
    /// Handler entry point in the current vector
    pub handler: u16,
}

/// The sequence an in-flight for-loop walks
#[derive(Debug, Clone, PartialEq)]
pub enum IterSeq {
    /// List iteration, by position
    List(List),
    /// Map iteration, in key order
    Map(Map),
}

/// An in-flight for-loop cursor
#[derive(Debug, Clone, PartialEq)]
pub struct IterState {
    /// The collection being walked
    pub seq: IterSeq,
    /// Next position, 0-based
    pub pos: usize,
}

impl IterState {
    /// Advance, yielding (key, value); for lists the key is the 1-based index
    pub fn next(&mut self) -> Option<(Value, Value)> {
        match &self.seq {
            IterSeq::List(list) => {
                let item = list.as_slice().get(self.pos)?.clone();
                self.pos += 1;
                Some((Value::Int(self.pos as i64), item))
            }
            IterSeq::Map(map) => {
                let (k, v) = map.nth(self.pos)?;
                let pair = (k.clone(), v.clone());
                self.pos += 1;
                Some(pair)
            }
        }
    }
}

/// A tagged runtime value
#[derive(Debug, Clone)]
pub enum Value {
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// Shared immutable string
    Str(Rc<str>),
    /// Object reference
    Obj(ObjId),
    /// Anonymous-object reference
    Anon(AnonId),
    /// Error code
    Err(ErrCode),
    /// Ordered list
    List(List),
    /// Associative map
    Map(Map),
    /// For-loop cursor (operand stacks only)
    Iter(Box<IterState>),
    /// Catch marker (operand stacks only)
    Catch(CatchMarker),
    /// Finally marker (operand stacks only)
    Finally(FinallyMarker),
}

// ===== Constructor helpers =====

/// Integer value
pub fn v_int(i: i64) -> Value {
    Value::Int(i)
}

/// Float value
pub fn v_float(f: f64) -> Value {
    Value::Float(f)
}

/// String value
pub fn v_str(s: &str) -> Value {
    Value::Str(Rc::from(s))
}

/// String value from an owned string
pub fn v_string(s: String) -> Value {
    Value::Str(Rc::from(s.as_str()))
}

/// Object value
pub fn v_obj(id: i64) -> Value {
    Value::Obj(ObjId(id))
}

/// Error value
pub fn v_err(code: ErrCode) -> Value {
    Value::Err(code)
}

/// List value from elements
pub fn v_list(items: Vec<Value>) -> Value {
    Value::List(List::from_vec(items))
}

/// Empty list value
pub fn v_empty_list() -> Value {
    Value::List(List::new())
}

/// Empty map value
pub fn v_empty_map() -> Value {
    Value::Map(Map::new())
}

/// Truth as the language renders it: 1 or 0
pub fn v_bool(b: bool) -> Value {
    Value::Int(b as i64)
}

impl Value {
    /// Materialize a program literal
    ///
    /// Compilers only embed scalar map keys, so key validation cannot fail
    /// for well-formed programs; a bad pair is dropped rather than trusted.
    pub fn from_literal(lit: &hearth_bytecode::Literal) -> Value {
        use hearth_bytecode::Literal;
        match lit {
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::Str(s) => v_str(s),
            Literal::Obj(o) => Value::Obj(ObjId(*o)),
            Literal::Err(e) => Value::Err(ErrCode::from_u8(*e).unwrap_or(ErrCode::E_NONE)),
            Literal::List(items) => {
                Value::List(items.iter().map(Value::from_literal).collect())
            }
            Literal::Map(pairs) => {
                let mut map = Map::new();
                for (k, v) in pairs {
                    let _ = map.insert(Value::from_literal(k), Value::from_literal(v));
                }
                Value::Map(map)
            }
        }
    }

    /// Truthiness: nonzero numbers and nonempty collections/strings
    pub fn is_true(&self) -> bool {
        match self {
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
            _ => false,
        }
    }

    /// Type name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Obj(_) => "obj",
            Value::Anon(_) => "anon",
            Value::Err(_) => "err",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Iter(_) => "iter",
            Value::Catch(_) => "catch-marker",
            Value::Finally(_) => "finally-marker",
        }
    }

    /// Numeric type code, for the `typeof` surface; internal kinds have none
    pub fn type_code(&self) -> Option<i64> {
        match self {
            Value::Int(_) => Some(0),
            Value::Obj(_) => Some(1),
            Value::Str(_) => Some(2),
            Value::Err(_) => Some(3),
            Value::List(_) => Some(4),
            Value::Float(_) => Some(9),
            Value::Map(_) => Some(10),
            Value::Anon(_) => Some(12),
            Value::Iter(_) | Value::Catch(_) | Value::Finally(_) => None,
        }
    }

    /// Whether this value is one of the internal stack-only kinds
    pub fn is_marker(&self) -> bool {
        matches!(self, Value::Catch(_) | Value::Finally(_))
    }
}

/// Case-folded string comparison; the language compares strings
/// case-insensitively everywhere
pub(crate) fn str_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = a.bytes().map(|b| b.to_ascii_lowercase());
    let mut bi = b.bytes().map(|b| b.to_ascii_lowercase());
    loop {
        match (ai.next(), bi.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match x.cmp(&y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

fn key_rank(v: &Value) -> Option<u8> {
    match v {
        Value::Int(_) => Some(0),
        Value::Float(_) => Some(1),
        Value::Obj(_) => Some(2),
        Value::Anon(_) => Some(3),
        Value::Str(_) => Some(4),
        Value::Err(_) => Some(5),
        _ => None,
    }
}

/// Total order over valid map keys: type rank first, then value
pub fn key_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    let (ra, rb) = (key_rank(a)?, key_rank(b)?);
    if ra != rb {
        return Some(ra.cmp(&rb));
    }
    Some(match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
        (Value::Obj(x), Value::Obj(y)) => x.cmp(y),
        (Value::Anon(x), Value::Anon(y)) => x.cmp(y),
        (Value::Str(x), Value::Str(y)) => str_cmp(x, y),
        (Value::Err(x), Value::Err(y)) => x.cmp(y),
        _ => unreachable!("ranks matched distinct types"),
    })
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => str_cmp(a, b) == Ordering::Equal,
            (Value::Obj(a), Value::Obj(b)) => a == b,
            (Value::Anon(a), Value::Anon(b)) => a == b,
            (Value::Err(a), Value::Err(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Iter(a), Value::Iter(b)) => a == b,
            (Value::Catch(a), Value::Catch(b)) => a == b,
            (Value::Finally(a), Value::Finally(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Obj(o) => write!(f, "{o}"),
            Value::Anon(a) => write!(f, "*anonymous*#{}", a.0),
            Value::Err(e) => write!(f, "{e}"),
            Value::List(l) => {
                write!(f, "{{")?;
                for (i, item) in l.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
            Value::Map(m) => {
                write!(f, "[")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} -> {v}")?;
                }
                write!(f, "]")
            }
            Value::Iter(it) => write!(f, "<iter @{}>", it.pos),
            Value::Catch(c) => write!(f, "<catch @{}>", c.handler),
            Value::Finally(m) => write!(f, "<finally @{}>", m.handler),
        }
    }
}
