//! Line-oriented text encoding helpers
//!
//! The durable forms of both compiled programs and suspended task state are
//! line-oriented text: one field or node per line, integers in decimal,
//! strings escaped onto a single line. These helpers are shared by the
//! program codec here and the VM persistence layer.

use std::io::{self, BufRead, Write};
use thiserror::Error;

/// Errors produced while decoding a line-oriented stream
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Stream ended before the record was complete
    #[error("unexpected end of input at line {0}")]
    UnexpectedEof(usize),

    /// A line did not parse as the expected field
    #[error("malformed input at line {line}: {detail}")]
    Malformed {
        /// 1-based line number
        line: usize,
        /// What was expected
        detail: String,
    },

    /// Version not supported by this reader
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),

    /// Underlying I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Escape a string onto a single line
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape`]
pub fn unescape(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            _ => return None,
        }
    }
    Some(out)
}

/// Buffered line reader that tracks line numbers for error reporting
pub struct LineReader<R> {
    inner: R,
    line: usize,
}

impl<R: BufRead> LineReader<R> {
    /// Wrap a buffered reader
    pub fn new(inner: R) -> Self {
        Self { inner, line: 0 }
    }

    /// Current 1-based line number (of the last line read)
    pub fn line(&self) -> usize {
        self.line
    }

    /// Read the next line, without its terminator
    pub fn next_line(&mut self) -> Result<String, DecodeError> {
        let mut buf = String::new();
        let n = self.inner.read_line(&mut buf)?;
        if n == 0 {
            return Err(DecodeError::UnexpectedEof(self.line));
        }
        self.line += 1;
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(buf)
    }

    /// Read a line and require an exact match
    pub fn expect(&mut self, expected: &str) -> Result<(), DecodeError> {
        let got = self.next_line()?;
        if got != expected {
            return Err(self.malformed(format!("expected `{expected}`, got `{got}`")));
        }
        Ok(())
    }

    /// Read a line of the form `<tag> <rest>` with a required tag
    pub fn tagged(&mut self, tag: &str) -> Result<String, DecodeError> {
        let got = self.next_line()?;
        match got.strip_prefix(tag).and_then(|r| r.strip_prefix(' ')) {
            Some(rest) => Ok(rest.to_string()),
            None => Err(self.malformed(format!("expected `{tag} ...`, got `{got}`"))),
        }
    }

    /// Read a line holding a single integer
    pub fn int<T: std::str::FromStr>(&mut self) -> Result<T, DecodeError> {
        let got = self.next_line()?;
        got.parse()
            .map_err(|_| self.malformed(format!("expected integer, got `{got}`")))
    }

    /// Read a `<tag> <integer>` line
    pub fn tagged_int<T: std::str::FromStr>(&mut self, tag: &str) -> Result<T, DecodeError> {
        let rest = self.tagged(tag)?;
        rest.parse()
            .map_err(|_| self.malformed(format!("expected integer after `{tag}`, got `{rest}`")))
    }

    /// Build a malformed-input error at the current line
    pub fn malformed(&self, detail: String) -> DecodeError {
        DecodeError::Malformed {
            line: self.line,
            detail,
        }
    }
}

/// Write one formatted line
pub fn write_line(w: &mut impl Write, args: std::fmt::Arguments<'_>) -> io::Result<()> {
    w.write_fmt(args)?;
    w.write_all(b"\n")
}

/// Write one formatted line to a text stream
#[macro_export]
macro_rules! emit {
    ($w:expr, $($arg:tt)*) => {
        $crate::text::write_line($w, format_args!($($arg)*))
    };
}
