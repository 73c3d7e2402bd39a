//! Durable task state
//!
//! Line-oriented, versioned, textual read/write of values, environments,
//! activations, and whole VMs/snapshots, so suspended tasks survive a
//! process restart. Every record round-trips to state sufficient to resume
//! execution identically. Programs referenced by frames are interned into a
//! table at the head of each VM record; a standalone activation record
//! embeds its own.
//!
//! The `hearth-vm <version>` guard line leads every VM-level record; readers
//! grow a new arm per historical version so older saves remain loadable.

use crate::activation::{Activation, NativeFrame};
use crate::var::{
    v_str, AnonId, CatchCodes, CatchMarker, ErrCode, FinallyMarker, IterSeq, IterState, List, Map,
    ObjId, Value,
};
use crate::vm::{Snapshot, Vm};
use hearth_bytecode::text::{escape, unescape, DecodeError, LineReader};
use hearth_bytecode::{emit, Program, VectorId};
use std::io::{BufRead, Write};
use std::sync::Arc;
use thiserror::Error;

/// Current VM record version
pub const VM_VERSION: u32 = 1;

/// Persistence failures
///
/// These surface to the external persistence layer, which owns retry and
/// reporting; in-memory scheduler state is never left half-written.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The stream did not parse
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Write-side I/O failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PersistError {
    fn malformed(r: &LineReader<impl BufRead>, detail: impl Into<String>) -> Self {
        PersistError::Decode(DecodeError::Malformed {
            line: r.line(),
            detail: detail.into(),
        })
    }
}

// ===== Values =====

/// Write one value as a tagged tree, one node per line
pub fn write_value(w: &mut impl Write, value: &Value) -> Result<(), PersistError> {
    match value {
        Value::Int(i) => emit!(w, "int {i}")?,
        Value::Float(f) => emit!(w, "float {f:?}")?,
        Value::Str(s) => emit!(w, "str {}", escape(s))?,
        Value::Obj(o) => emit!(w, "obj {}", o.0)?,
        Value::Anon(a) => emit!(w, "anon {}", a.0)?,
        Value::Err(e) => emit!(w, "err {}", e.name())?,
        Value::List(l) => {
            emit!(w, "list {}", l.len())?;
            for item in l.iter() {
                write_value(w, item)?;
            }
        }
        Value::Map(m) => {
            emit!(w, "map {}", m.len())?;
            for (k, v) in m.iter() {
                write_value(w, k)?;
                write_value(w, v)?;
            }
        }
        Value::Iter(state) => {
            emit!(w, "iter {}", state.pos)?;
            match &state.seq {
                IterSeq::List(l) => write_value(w, &Value::List(l.clone()))?,
                IterSeq::Map(m) => write_value(w, &Value::Map(m.clone()))?,
            }
        }
        Value::Catch(marker) => match &marker.codes {
            CatchCodes::Any => emit!(w, "catch {} any", marker.handler)?,
            CatchCodes::Codes(codes) => {
                emit!(w, "catch {} codes", marker.handler)?;
                write_value(w, &Value::List(codes.clone()))?;
            }
        },
        Value::Finally(marker) => emit!(w, "finally {}", marker.handler)?,
    }
    Ok(())
}

/// Read one value written by [`write_value`]
pub fn read_value(r: &mut LineReader<impl BufRead>) -> Result<Value, PersistError> {
    let line = r.next_line()?;
    let (tag, rest) = match line.split_once(' ') {
        Some((tag, rest)) => (tag, rest),
        None => (line.as_str(), ""),
    };
    let value = match tag {
        "int" => Value::Int(parse(r, rest, "int")?),
        "float" => Value::Float(parse(r, rest, "float")?),
        "str" => {
            let s =
                unescape(rest).ok_or_else(|| PersistError::malformed(r, "bad string escape"))?;
            v_str(&s)
        }
        "obj" => Value::Obj(ObjId(parse(r, rest, "obj")?)),
        "anon" => Value::Anon(AnonId(parse(r, rest, "anon")?)),
        "err" => Value::Err(
            ErrCode::parse(rest)
                .ok_or_else(|| PersistError::malformed(r, format!("unknown error `{rest}`")))?,
        ),
        "list" => {
            let count: usize = parse(r, rest, "list length")?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_value(r)?);
            }
            Value::List(List::from_vec(items))
        }
        "map" => {
            let count: usize = parse(r, rest, "map length")?;
            let mut map = Map::new();
            for _ in 0..count {
                let k = read_value(r)?;
                let v = read_value(r)?;
                map.insert(k, v)
                    .map_err(|_| PersistError::malformed(r, "invalid map key"))?;
            }
            Value::Map(map)
        }
        "iter" => {
            let pos: usize = parse(r, rest, "iter position")?;
            let seq = match read_value(r)? {
                Value::List(l) => IterSeq::List(l),
                Value::Map(m) => IterSeq::Map(m),
                _ => return Err(PersistError::malformed(r, "iter over non-sequence")),
            };
            Value::Iter(Box::new(IterState { seq, pos }))
        }
        "catch" => {
            let (handler, kind) = rest
                .split_once(' ')
                .ok_or_else(|| PersistError::malformed(r, "bad catch marker"))?;
            let handler: u16 = handler
                .parse()
                .map_err(|_| PersistError::malformed(r, "bad catch handler"))?;
            let codes = match kind {
                "any" => CatchCodes::Any,
                "codes" => match read_value(r)? {
                    Value::List(codes) => CatchCodes::Codes(codes),
                    _ => return Err(PersistError::malformed(r, "catch codes not a list")),
                },
                _ => return Err(PersistError::malformed(r, "bad catch kind")),
            };
            Value::Catch(CatchMarker { codes, handler })
        }
        "finally" => Value::Finally(FinallyMarker {
            handler: parse(r, rest, "finally handler")?,
        }),
        _ => {
            return Err(PersistError::malformed(
                r,
                format!("unknown value tag `{tag}`"),
            ))
        }
    };
    Ok(value)
}

fn parse<T: std::str::FromStr>(
    r: &LineReader<impl BufRead>,
    text: &str,
    what: &str,
) -> Result<T, PersistError> {
    text.parse()
        .map_err(|_| PersistError::malformed(r, format!("bad {what}: `{text}`")))
}

// ===== Environments =====

/// Write a variable environment, preserving empty slots
pub fn write_env(w: &mut impl Write, env: &[Option<Value>]) -> Result<(), PersistError> {
    emit!(w, "env {}", env.len())?;
    for slot in env {
        match slot {
            None => emit!(w, "unset")?,
            Some(v) => {
                emit!(w, "slot")?;
                write_value(w, v)?;
            }
        }
    }
    Ok(())
}

/// Read an environment written by [`write_env`]
pub fn read_env(r: &mut LineReader<impl BufRead>) -> Result<Vec<Option<Value>>, PersistError> {
    let count: usize = r.tagged_int("env")?;
    let mut env = Vec::with_capacity(count);
    for _ in 0..count {
        let line = r.next_line()?;
        match line.as_str() {
            "unset" => env.push(None),
            "slot" => env.push(Some(read_value(r)?)),
            other => {
                return Err(PersistError::malformed(
                    r,
                    format!("expected `slot` or `unset`, got `{other}`"),
                ))
            }
        }
    }
    Ok(env)
}

// ===== Activations =====

fn intern_program(programs: &mut Vec<Arc<Program>>, program: &Arc<Program>) -> usize {
    if let Some(i) = programs.iter().position(|p| Arc::ptr_eq(p, program)) {
        return i;
    }
    programs.push(program.clone());
    programs.len() - 1
}

fn write_frame(
    w: &mut impl Write,
    frame: &Activation,
    programs: &mut Vec<Arc<Program>>,
) -> Result<(), PersistError> {
    let program_index = intern_program(programs, &frame.program);
    emit!(w, "frame")?;
    emit!(w, "program {program_index}")?;
    emit!(w, "vector {}", frame.vector.to_i32())?;
    emit!(w, "pc {} {}", frame.pc, frame.error_pc)?;
    emit!(
        w,
        "ids {} {} {}",
        frame.player.0,
        frame.definer.0,
        frame.permissions.0
    )?;
    emit!(w, "verb {}", escape(&frame.verb_name))?;
    emit!(w, "names {}", escape(&frame.verb_names))?;
    emit!(w, "debug {}", frame.debug as u8)?;
    write_value(w, &frame.this)?;
    write_value(w, &frame.caller)?;
    match &frame.native {
        None => emit!(w, "native -1")?,
        Some(native) => {
            emit!(w, "native {} {}", native.id, native.step)?;
            write_value(w, &native.data)?;
        }
    }
    write_env(w, &frame.env)?;
    emit!(w, "stack {}", frame.stack.len())?;
    for value in &frame.stack {
        write_value(w, value)?;
    }
    Ok(())
}

fn read_frame(
    r: &mut LineReader<impl BufRead>,
    programs: &[Arc<Program>],
) -> Result<Activation, PersistError> {
    r.expect("frame")?;
    let program_index: usize = r.tagged_int("program")?;
    let program = programs
        .get(program_index)
        .cloned()
        .ok_or_else(|| PersistError::malformed(r, "program index out of range"))?;
    let vector_raw: i32 = r.tagged_int("vector")?;
    let vector = VectorId::from_i32(vector_raw)
        .ok_or_else(|| PersistError::malformed(r, "bad vector id"))?;
    let pc_line = r.tagged("pc")?;
    let (pc, error_pc) = split_pair(r, &pc_line)?;
    let ids_line = r.tagged("ids")?;
    let mut ids = ids_line.split(' ');
    let player = ObjId(parse_part(r, ids.next())?);
    let definer = ObjId(parse_part(r, ids.next())?);
    let permissions = ObjId(parse_part(r, ids.next())?);
    let verb_name = unescape(&r.tagged("verb")?)
        .ok_or_else(|| PersistError::malformed(r, "bad verb name"))?;
    let verb_names = unescape(&r.tagged("names")?)
        .ok_or_else(|| PersistError::malformed(r, "bad verb names"))?;
    let debug: u8 = r.tagged_int("debug")?;
    let this = read_value(r)?;
    let caller = read_value(r)?;
    let native_line = r.tagged("native")?;
    let native = if native_line == "-1" {
        None
    } else {
        let (id, step) = native_line
            .split_once(' ')
            .ok_or_else(|| PersistError::malformed(r, "bad native record"))?;
        let id: u16 = parse(r, id, "native id")?;
        let step: u8 = parse(r, step, "native step")?;
        let data = read_value(r)?;
        Some(NativeFrame { id, step, data })
    };
    let env = read_env(r)?;
    let stack_len: usize = r.tagged_int("stack")?;
    let mut stack = Vec::with_capacity(stack_len);
    for _ in 0..stack_len {
        stack.push(read_value(r)?);
    }
    Ok(Activation {
        program,
        vector,
        pc,
        error_pc,
        env,
        stack,
        this,
        player,
        caller,
        definer,
        permissions,
        verb_name,
        verb_names,
        debug: debug != 0,
        native,
    })
}

fn split_pair(
    r: &LineReader<impl BufRead>,
    line: &str,
) -> Result<(usize, usize), PersistError> {
    let (a, b) = line
        .split_once(' ')
        .ok_or_else(|| PersistError::malformed(r, "expected two fields"))?;
    Ok((parse(r, a, "pair")?, parse(r, b, "pair")?))
}

fn parse_part<T: std::str::FromStr>(
    r: &LineReader<impl BufRead>,
    part: Option<&str>,
) -> Result<T, PersistError> {
    let part = part.ok_or_else(|| PersistError::malformed(r, "missing field"))?;
    parse(r, part, "field")
}

/// Write one activation as a standalone record with its program embedded
pub fn write_activation(w: &mut impl Write, frame: &Activation) -> Result<(), PersistError> {
    let mut programs = Vec::new();
    let mut body = Vec::new();
    write_frame(&mut body, frame, &mut programs)?;
    emit!(w, "programs {}", programs.len())?;
    for program in &programs {
        program.encode_text(w)?;
    }
    w.write_all(&body)?;
    Ok(())
}

/// Read an activation written by [`write_activation`]
pub fn read_activation(r: &mut LineReader<impl BufRead>) -> Result<Activation, PersistError> {
    let programs = read_programs(r)?;
    read_frame(r, &programs)
}

fn read_programs(
    r: &mut LineReader<impl BufRead>,
) -> Result<Vec<Arc<Program>>, PersistError> {
    let count: usize = r.tagged_int("programs")?;
    let mut programs = Vec::with_capacity(count);
    for _ in 0..count {
        programs.push(Arc::new(Program::decode_text(r)?));
    }
    Ok(programs)
}

// ===== Whole VMs =====

fn write_state(
    w: &mut impl Write,
    frames: &[Activation],
    max_depth: usize,
    start_vector: VectorId,
    task_local: &Value,
) -> Result<(), PersistError> {
    emit!(w, "hearth-vm {VM_VERSION}")?;
    emit!(w, "max_depth {max_depth}")?;
    emit!(w, "start_vector {}", start_vector.to_i32())?;
    write_value(w, task_local)?;

    // Frames are serialized against an interned program table so shared
    // programs (recursion, forks) are stored once.
    let mut programs = Vec::new();
    let mut body = Vec::new();
    emit!(&mut body, "frames {}", frames.len())?;
    for frame in frames {
        write_frame(&mut body, frame, &mut programs)?;
    }
    emit!(w, "programs {}", programs.len())?;
    for program in &programs {
        program.encode_text(w)?;
    }
    w.write_all(&body)?;
    Ok(())
}

struct State {
    frames: Vec<Activation>,
    max_depth: usize,
    start_vector: VectorId,
    task_local: Value,
}

fn read_state(r: &mut LineReader<impl BufRead>) -> Result<State, PersistError> {
    let version: u32 = r.tagged_int("hearth-vm")?;
    if version != VM_VERSION {
        return Err(PersistError::Decode(DecodeError::UnsupportedVersion(
            version,
        )));
    }
    let max_depth: usize = r.tagged_int("max_depth")?;
    let start_raw: i32 = r.tagged_int("start_vector")?;
    let start_vector = VectorId::from_i32(start_raw)
        .ok_or_else(|| PersistError::malformed(r, "bad start vector"))?;
    let task_local = read_value(r)?;
    let programs = read_programs(r)?;
    let frame_count: usize = r.tagged_int("frames")?;
    let mut frames = Vec::with_capacity(frame_count);
    for _ in 0..frame_count {
        frames.push(read_frame(r, &programs)?);
    }
    Ok(State {
        frames,
        max_depth,
        start_vector,
        task_local,
    })
}

/// Write a live VM
pub fn write_vm(w: &mut impl Write, vm: &Vm) -> Result<(), PersistError> {
    write_state(w, &vm.frames, vm.max_depth, vm.start_vector, &vm.task_local)
}

/// Read a VM written by [`write_vm`]
pub fn read_vm(r: &mut LineReader<impl BufRead>) -> Result<Vm, PersistError> {
    let state = read_state(r)?;
    Ok(Vm {
        frames: state.frames,
        max_depth: state.max_depth,
        start_vector: state.start_vector,
        task_local: state.task_local,
    })
}

/// Write a suspended task's snapshot
pub fn write_snapshot(w: &mut impl Write, snapshot: &Snapshot) -> Result<(), PersistError> {
    write_state(
        w,
        &snapshot.frames,
        snapshot.max_depth,
        snapshot.start_vector,
        &snapshot.task_local,
    )
}

/// Read a snapshot written by [`write_snapshot`]
pub fn read_snapshot(r: &mut LineReader<impl BufRead>) -> Result<Snapshot, PersistError> {
    let state = read_state(r)?;
    Ok(Snapshot {
        frames: state.frames,
        max_depth: state.max_depth,
        start_vector: state.start_vector,
        task_local: state.task_local,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::frame_on;
    use crate::var::{v_err, v_int, v_list};
    use crate::vm::Vm;

    fn roundtrip_value(value: &Value) -> Value {
        let mut buf = Vec::new();
        write_value(&mut buf, value).unwrap();
        let mut r = LineReader::new(&buf[..]);
        read_value(&mut r).unwrap()
    }

    #[test]
    fn test_scalar_value_roundtrip() {
        for v in [
            v_int(-3),
            Value::Float(0.1),
            v_str("two\nlines"),
            Value::Obj(ObjId(-1)),
            Value::Anon(AnonId(9)),
            v_err(ErrCode::E_QUOTA),
        ] {
            assert_eq!(roundtrip_value(&v), v);
        }
    }

    #[test]
    fn test_nested_value_roundtrip() {
        let mut map = Map::new();
        map.insert(v_str("xs"), v_list(vec![v_int(1), v_int(2)]))
            .unwrap();
        let v = v_list(vec![Value::Map(map), v_list(vec![])]);
        assert_eq!(roundtrip_value(&v), v);
    }

    #[test]
    fn test_marker_roundtrip() {
        let catch = Value::Catch(CatchMarker {
            codes: CatchCodes::Codes(List::from_vec(vec![v_err(ErrCode::E_DIV)])),
            handler: 33,
        });
        assert_eq!(roundtrip_value(&catch), catch);

        let any = Value::Catch(CatchMarker {
            codes: CatchCodes::Any,
            handler: 5,
        });
        assert_eq!(roundtrip_value(&any), any);

        let finally = Value::Finally(FinallyMarker { handler: 7 });
        assert_eq!(roundtrip_value(&finally), finally);

        let iter = Value::Iter(Box::new(IterState {
            seq: IterSeq::List(List::from_vec(vec![v_int(1)])),
            pos: 1,
        }));
        assert_eq!(roundtrip_value(&iter), iter);
    }

    #[test]
    fn test_env_roundtrip_preserves_empty_slots() {
        let env = vec![Some(v_int(5)), None, Some(v_list(vec![v_int(1)])), None];
        let mut buf = Vec::new();
        write_env(&mut buf, &env).unwrap();
        let mut r = LineReader::new(&buf[..]);
        assert_eq!(read_env(&mut r).unwrap(), env);
    }

    #[test]
    fn test_activation_roundtrip() {
        let mut frame = frame_on("poke");
        frame.push(v_int(11)).unwrap();
        frame.pc = 1;
        frame.error_pc = 1;

        let mut buf = Vec::new();
        write_activation(&mut buf, &frame).unwrap();
        let mut r = LineReader::new(&buf[..]);
        let back = read_activation(&mut r).unwrap();

        assert_eq!(back.verb_name, "poke");
        assert_eq!(back.pc, 1);
        assert_eq!(back.stack, frame.stack);
        assert_eq!(back.env, frame.env);
        assert_eq!(back.program, frame.program);
        assert!(back.debug);
    }

    #[test]
    fn test_vm_roundtrip_shares_programs() {
        let mut vm = Vm::new(frame_on("outer"), 13);
        // Recursion: same Arc in two frames.
        let inner = Activation {
            pc: 0,
            ..vm.frames[0].clone()
        };
        vm.frames.push(inner);
        vm.top_mut().push(v_int(1)).unwrap();

        let mut buf = Vec::new();
        write_vm(&mut buf, &vm).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        // Interning stores the shared program once.
        assert_eq!(text.matches("programs 1").count(), 1);

        let mut r = LineReader::new(&buf[..]);
        let back = read_vm(&mut r).unwrap();
        assert_eq!(back.depth(), 2);
        assert_eq!(back.max_depth, 13);
        assert_eq!(back.top().stack, vec![v_int(1)]);
        assert!(Arc::ptr_eq(&back.frames[0].program, &back.frames[1].program));
    }

    #[test]
    fn test_future_version_rejected() {
        let data = "hearth-vm 99\n";
        let mut r = LineReader::new(data.as_bytes());
        assert!(matches!(
            read_vm(&mut r),
            Err(PersistError::Decode(DecodeError::UnsupportedVersion(99)))
        ));
    }
}
