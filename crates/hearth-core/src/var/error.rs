//! Language-level error codes
//!
//! The closed taxonomy raised by bytecode execution and native functions.
//! These are values in the language (a verb can store, compare, and catch
//! them); process-level failures use `VmError` instead.

use std::fmt;

/// A language error code
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrCode {
    /// No error
    E_NONE = 0,
    /// Type mismatch
    E_TYPE = 1,
    /// Division by zero
    E_DIV = 2,
    /// Permission denied
    E_PERM = 3,
    /// Property not found
    E_PROPNF = 4,
    /// Verb not found
    E_VERBNF = 5,
    /// Variable not found
    E_VARNF = 6,
    /// Invalid indirection
    E_INVIND = 7,
    /// Recursive move
    E_RECMOVE = 8,
    /// Too many verb calls
    E_MAXREC = 9,
    /// Range error
    E_RANGE = 10,
    /// Incorrect number of arguments
    E_ARGS = 11,
    /// Move refused by destination
    E_NACC = 12,
    /// Invalid argument
    E_INVARG = 13,
    /// Resource limit exceeded
    E_QUOTA = 14,
    /// Floating-point arithmetic error
    E_FLOAT = 15,
    /// File system error
    E_FILE = 16,
    /// Exec error
    E_EXEC = 17,
}

impl ErrCode {
    /// All codes, in numeric order
    pub const ALL: [ErrCode; 18] = [
        ErrCode::E_NONE,
        ErrCode::E_TYPE,
        ErrCode::E_DIV,
        ErrCode::E_PERM,
        ErrCode::E_PROPNF,
        ErrCode::E_VERBNF,
        ErrCode::E_VARNF,
        ErrCode::E_INVIND,
        ErrCode::E_RECMOVE,
        ErrCode::E_MAXREC,
        ErrCode::E_RANGE,
        ErrCode::E_ARGS,
        ErrCode::E_NACC,
        ErrCode::E_INVARG,
        ErrCode::E_QUOTA,
        ErrCode::E_FLOAT,
        ErrCode::E_FILE,
        ErrCode::E_EXEC,
    ];

    /// Convert a code number back to a code
    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }

    /// Canonical identifier, as written in source code
    pub fn name(self) -> &'static str {
        match self {
            ErrCode::E_NONE => "E_NONE",
            ErrCode::E_TYPE => "E_TYPE",
            ErrCode::E_DIV => "E_DIV",
            ErrCode::E_PERM => "E_PERM",
            ErrCode::E_PROPNF => "E_PROPNF",
            ErrCode::E_VERBNF => "E_VERBNF",
            ErrCode::E_VARNF => "E_VARNF",
            ErrCode::E_INVIND => "E_INVIND",
            ErrCode::E_RECMOVE => "E_RECMOVE",
            ErrCode::E_MAXREC => "E_MAXREC",
            ErrCode::E_RANGE => "E_RANGE",
            ErrCode::E_ARGS => "E_ARGS",
            ErrCode::E_NACC => "E_NACC",
            ErrCode::E_INVARG => "E_INVARG",
            ErrCode::E_QUOTA => "E_QUOTA",
            ErrCode::E_FLOAT => "E_FLOAT",
            ErrCode::E_FILE => "E_FILE",
            ErrCode::E_EXEC => "E_EXEC",
        }
    }

    /// Default human-readable message
    pub fn message(self) -> &'static str {
        match self {
            ErrCode::E_NONE => "No error",
            ErrCode::E_TYPE => "Type mismatch",
            ErrCode::E_DIV => "Division by zero",
            ErrCode::E_PERM => "Permission denied",
            ErrCode::E_PROPNF => "Property not found",
            ErrCode::E_VERBNF => "Verb not found",
            ErrCode::E_VARNF => "Variable not found",
            ErrCode::E_INVIND => "Invalid indirection",
            ErrCode::E_RECMOVE => "Recursive move",
            ErrCode::E_MAXREC => "Too many verb calls",
            ErrCode::E_RANGE => "Range error",
            ErrCode::E_ARGS => "Incorrect number of arguments",
            ErrCode::E_NACC => "Move refused by destination",
            ErrCode::E_INVARG => "Invalid argument",
            ErrCode::E_QUOTA => "Resource limit exceeded",
            ErrCode::E_FLOAT => "Floating-point arithmetic error",
            ErrCode::E_FILE => "File system error",
            ErrCode::E_EXEC => "Exec error",
        }
    }

    /// Parse a canonical identifier
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
