//! Compiled-verb artifact
//!
//! A [`Program`] is produced by the external compiler and is immutable once
//! built: the VM only reads it. It carries one main code vector plus zero or
//! more fork vectors (bodies of deferred blocks), a literal pool, the
//! variable-name table, and a compiler-declared operand-stack bound per
//! vector so the interpreter never needs to grow a frame's stack.

use crate::opcode::Opcode;
use crate::text::{escape, unescape, DecodeError, LineReader};
use std::io::{BufRead, Write};

/// Current program text-format version
pub const PROGRAM_VERSION: u32 = 1;

/// Builtin variable slots present in every program's environment.
///
/// The compiler lays user variables out after these.
pub mod vars {
    /// The player on whose behalf the task runs
    pub const PLAYER: u16 = 0;
    /// The object the verb was invoked on
    pub const THIS: u16 = 1;
    /// The calling object
    pub const CALLER: u16 = 2;
    /// The verb name as invoked
    pub const VERB: u16 = 3;
    /// The argument list
    pub const ARGS: u16 = 4;
    /// The raw argument string
    pub const ARGSTR: u16 = 5;
    /// Direct object of the parsed command
    pub const DOBJ: u16 = 6;
    /// Indirect object of the parsed command
    pub const IOBJ: u16 = 7;
    /// First slot available to user variables
    pub const FIRST_USER: u16 = 8;

    /// Names for the builtin slots, in slot order
    pub const NAMES: [&str; 8] = [
        "player", "this", "caller", "verb", "args", "argstr", "dobj", "iobj",
    ];
}

/// A literal pool entry
///
/// Mirrors the subset of runtime values a compiler can embed in code.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// String
    Str(String),
    /// Object reference by number
    Obj(i64),
    /// Error code by number
    Err(u8),
    /// List of literals
    List(Vec<Literal>),
    /// Map of literal pairs, in key order
    Map(Vec<(Literal, Literal)>),
}

/// Selects which code vector of a program a frame executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorId {
    /// The main body
    Main,
    /// A forked sub-vector, by index
    Fork(u16),
}

impl VectorId {
    /// Encode for the durable form: -1 for main, fork index otherwise
    pub fn to_i32(self) -> i32 {
        match self {
            VectorId::Main => -1,
            VectorId::Fork(i) => i as i32,
        }
    }

    /// Reverse of [`VectorId::to_i32`]
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            -1 => Some(VectorId::Main),
            i if (0..=u16::MAX as i32).contains(&i) => Some(VectorId::Fork(i as u16)),
            _ => None,
        }
    }
}

/// One code vector: instruction bytes plus its compile-time metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Vector {
    /// Instruction bytes
    pub code: Vec<u8>,
    /// Compiler-declared maximum operand-stack depth
    pub max_stack: usize,
    /// Sorted (pc, source line) pairs; a pc maps to the line of the last
    /// entry at or before it
    pub line_starts: Vec<(usize, usize)>,
}

impl Vector {
    /// Source line for a pc, if line info is present
    pub fn line_for(&self, pc: usize) -> Option<usize> {
        match self.line_starts.binary_search_by_key(&pc, |&(p, _)| p) {
            Ok(i) => Some(self.line_starts[i].1),
            Err(0) => None,
            Err(i) => Some(self.line_starts[i - 1].1),
        }
    }
}

/// An immutable compiled verb
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    /// Main body vector
    pub main: Vector,
    /// Fork vectors
    pub forks: Vec<Vector>,
    /// Literal pool
    pub literals: Vec<Literal>,
    /// Variable-name table; index is the environment slot
    pub var_names: Vec<String>,
}

impl Program {
    /// Look up a code vector by id
    pub fn vector(&self, id: VectorId) -> Option<&Vector> {
        match id {
            VectorId::Main => Some(&self.main),
            VectorId::Fork(i) => self.forks.get(i as usize),
        }
    }

    /// Literal by pool index
    pub fn literal(&self, index: usize) -> Option<&Literal> {
        self.literals.get(index)
    }

    /// Variable name for an environment slot
    pub fn var_name(&self, slot: usize) -> Option<&str> {
        self.var_names.get(slot).map(|s| s.as_str())
    }

    /// Source line for a (vector, pc) pair
    pub fn line_for(&self, id: VectorId, pc: usize) -> Option<usize> {
        self.vector(id)?.line_for(pc)
    }

    /// Render one instruction at `pc` for trace display; returns the
    /// mnemonic line and the pc of the next instruction
    pub fn disassemble_at(&self, id: VectorId, pc: usize) -> Option<(String, usize)> {
        let vector = self.vector(id)?;
        let byte = *vector.code.get(pc)?;
        let op = match Opcode::from_u8(byte) {
            Some(op) => op,
            None => return Some((format!("{pc:5}: .byte {byte:#04x}"), pc + 1)),
        };
        let operands = vector.code.get(pc + 1..pc + 1 + op.operand_len())?;
        let mut line = format!("{pc:5}: {}", op.name());
        match op.operand_len() {
            0 => {}
            1 => line.push_str(&format!(" {}", operands[0] as i8)),
            8 if op == Opcode::ImmFloat => {
                let v = f64::from_le_bytes(operands.try_into().ok()?);
                line.push_str(&format!(" {v}"));
            }
            8 => {
                let v = i64::from_le_bytes(operands.try_into().ok()?);
                line.push_str(&format!(" {v}"));
            }
            _ => {
                let mut rest = operands;
                while rest.len() >= 2 {
                    let v = u16::from_le_bytes([rest[0], rest[1]]);
                    line.push_str(&format!(" {v}"));
                    rest = &rest[2..];
                }
                if let [b] = rest {
                    line.push_str(&format!(" {b}"));
                }
            }
        }
        Some((line, pc + 1 + op.operand_len()))
    }

    /// Full disassembly of one vector
    pub fn disassemble(&self, id: VectorId) -> Vec<String> {
        let mut out = Vec::new();
        let mut pc = 0;
        while let Some((line, next)) = self.disassemble_at(id, pc) {
            out.push(line);
            pc = next;
        }
        out
    }

    /// Write the durable text form
    pub fn encode_text(&self, w: &mut impl Write) -> std::io::Result<()> {
        crate::emit!(w, "program {PROGRAM_VERSION}")?;
        crate::emit!(w, "vars {}", self.var_names.len())?;
        for name in &self.var_names {
            crate::emit!(w, "{}", escape(name))?;
        }
        crate::emit!(w, "literals {}", self.literals.len())?;
        for lit in &self.literals {
            encode_literal(lit, w)?;
        }
        crate::emit!(w, "vectors {}", 1 + self.forks.len())?;
        encode_vector(&self.main, w)?;
        for fork in &self.forks {
            encode_vector(fork, w)?;
        }
        Ok(())
    }

    /// Read the durable text form
    pub fn decode_text(r: &mut LineReader<impl BufRead>) -> Result<Self, DecodeError> {
        let version: u32 = r.tagged_int("program")?;
        if version != PROGRAM_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let var_count: usize = r.tagged_int("vars")?;
        let mut var_names = Vec::with_capacity(var_count);
        for _ in 0..var_count {
            let raw = r.next_line()?;
            let name = unescape(&raw).ok_or_else(|| r.malformed("bad variable name".into()))?;
            var_names.push(name);
        }
        let lit_count: usize = r.tagged_int("literals")?;
        let mut literals = Vec::with_capacity(lit_count);
        for _ in 0..lit_count {
            literals.push(decode_literal(r)?);
        }
        let vector_count: usize = r.tagged_int("vectors")?;
        if vector_count == 0 {
            return Err(r.malformed("program must have a main vector".into()));
        }
        let main = decode_vector(r)?;
        let mut forks = Vec::with_capacity(vector_count - 1);
        for _ in 1..vector_count {
            forks.push(decode_vector(r)?);
        }
        Ok(Self {
            main,
            forks,
            literals,
            var_names,
        })
    }
}

fn encode_vector(v: &Vector, w: &mut impl Write) -> std::io::Result<()> {
    crate::emit!(w, "vector {} {}", v.max_stack, v.code.len())?;
    let mut hex = String::with_capacity(v.code.len() * 2);
    for byte in &v.code {
        hex.push_str(&format!("{byte:02x}"));
    }
    crate::emit!(w, "{hex}")?;
    crate::emit!(w, "lines {}", v.line_starts.len())?;
    for (pc, line) in &v.line_starts {
        crate::emit!(w, "{pc} {line}")?;
    }
    Ok(())
}

fn decode_vector(r: &mut LineReader<impl BufRead>) -> Result<Vector, DecodeError> {
    let header = r.tagged("vector")?;
    let mut parts = header.split(' ');
    let max_stack: usize = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| r.malformed("bad vector header".into()))?;
    let code_len: usize = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| r.malformed("bad vector header".into()))?;
    let hex = r.next_line()?;
    if hex.len() != code_len * 2 {
        return Err(r.malformed("code length mismatch".into()));
    }
    let mut code = Vec::with_capacity(code_len);
    for i in 0..code_len {
        let byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| r.malformed("bad code byte".into()))?;
        code.push(byte);
    }
    let line_count: usize = r.tagged_int("lines")?;
    let mut line_starts = Vec::with_capacity(line_count);
    for _ in 0..line_count {
        let entry = r.next_line()?;
        let mut parts = entry.split(' ');
        let pc = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| r.malformed("bad line entry".into()))?;
        let line = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| r.malformed("bad line entry".into()))?;
        line_starts.push((pc, line));
    }
    Ok(Vector {
        code,
        max_stack,
        line_starts,
    })
}

fn encode_literal(lit: &Literal, w: &mut impl Write) -> std::io::Result<()> {
    match lit {
        Literal::Int(i) => crate::emit!(w, "int {i}"),
        Literal::Float(f) => {
            // {:?} keeps enough digits to round-trip f64 exactly
            crate::emit!(w, "float {f:?}")
        }
        Literal::Str(s) => crate::emit!(w, "str {}", escape(s)),
        Literal::Obj(o) => crate::emit!(w, "obj {o}"),
        Literal::Err(e) => crate::emit!(w, "err {e}"),
        Literal::List(items) => {
            crate::emit!(w, "list {}", items.len())?;
            for item in items {
                encode_literal(item, w)?;
            }
            Ok(())
        }
        Literal::Map(pairs) => {
            crate::emit!(w, "map {}", pairs.len())?;
            for (k, v) in pairs {
                encode_literal(k, w)?;
                encode_literal(v, w)?;
            }
            Ok(())
        }
    }
}

fn decode_literal(r: &mut LineReader<impl BufRead>) -> Result<Literal, DecodeError> {
    let line = r.next_line()?;
    let (tag, rest) = match line.split_once(' ') {
        Some((tag, rest)) => (tag, rest),
        None => (line.as_str(), ""),
    };
    match tag {
        "int" => rest
            .parse()
            .map(Literal::Int)
            .map_err(|_| r.malformed("bad int literal".into())),
        "float" => rest
            .parse()
            .map(Literal::Float)
            .map_err(|_| r.malformed("bad float literal".into())),
        "str" => unescape(rest)
            .map(Literal::Str)
            .ok_or_else(|| r.malformed("bad str literal".into())),
        "obj" => rest
            .parse()
            .map(Literal::Obj)
            .map_err(|_| r.malformed("bad obj literal".into())),
        "err" => rest
            .parse()
            .map(Literal::Err)
            .map_err(|_| r.malformed("bad err literal".into())),
        "list" => {
            let count: usize = rest
                .parse()
                .map_err(|_| r.malformed("bad list length".into()))?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_literal(r)?);
            }
            Ok(Literal::List(items))
        }
        "map" => {
            let count: usize = rest
                .parse()
                .map_err(|_| r.malformed("bad map length".into()))?;
            let mut pairs = Vec::with_capacity(count);
            for _ in 0..count {
                let k = decode_literal(r)?;
                let v = decode_literal(r)?;
                pairs.push((k, v));
            }
            Ok(Literal::Map(pairs))
        }
        _ => Err(r.malformed(format!("unknown literal tag `{tag}`"))),
    }
}
