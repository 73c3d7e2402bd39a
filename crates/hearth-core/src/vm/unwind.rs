//! Non-local control flow
//!
//! Return, raise/catch, try/finally, intra-frame exit, and forced abort all
//! funnel through one state machine: a [`UnwindReason`] is walked across the
//! call stack until something absorbs it. Finally markers absorb every
//! reason (the handler re-launches the recorded reason when it completes);
//! catch markers absorb only matching raises; aborts stop for nothing but
//! finally markers.

use super::native::NativeRegistry;
use super::{AbortReason, Vm};
use crate::host::Host;
use crate::var::{v_list, v_str, ErrCode, List, Map, Value};
use crate::{VmError, VmResult};
use tracing::debug;

/// A raised language error in flight
#[derive(Debug, Clone, PartialEq)]
pub struct Exception {
    /// The error code
    pub code: ErrCode,
    /// Human-readable message
    pub msg: String,
    /// Associated value; 0 unless the raiser supplied one
    pub value: Value,
}

impl Exception {
    /// Exception carrying the code's default message
    pub fn new(code: ErrCode) -> Self {
        Self {
            code,
            msg: code.message().to_string(),
            value: Value::Int(0),
        }
    }

    /// Exception with a specific message
    pub fn with_msg(code: ErrCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            value: Value::Int(0),
        }
    }
}

/// Stack trace captured at raise time: one map per live frame, innermost
/// first, native continuation frames included
pub type Traceback = List;

/// Why the stack is being unwound
#[derive(Debug)]
pub enum UnwindReason {
    /// A raised exception looking for a matching catch marker
    Raise {
        /// The exception
        exception: Exception,
        /// Trace captured when the raise began
        traceback: Traceback,
    },
    /// A value returning to the calling frame
    Return(Value),
    /// Intra-frame break/continue: unwind the current frame's operand
    /// stack to `stack` and jump to `label`
    Exit {
        /// Target operand-stack depth
        stack: usize,
        /// Target instruction
        label: u16,
    },
    /// Forced teardown; stops only for finally markers
    Abort(AbortReason),
}

/// Where the unwind left the VM
#[derive(Debug)]
pub enum UnwindOutcome {
    /// A handler or caller took over; keep interpreting the top frame
    Resumed,
    /// The top frame is a native continuation; re-enter it with this value
    ReenterNative(Value),
    /// The bottom frame returned
    Done(Value),
    /// The task is gone
    Aborted(AbortReason),
}

/// Begin a raise: capture the trace over the live frames, then unwind
pub fn raise(vm: &Vm, exception: Exception) -> UnwindReason {
    let traceback = capture_traceback(vm);
    UnwindReason::Raise {
        exception,
        traceback,
    }
}

/// One trace entry per live frame, innermost first
pub fn capture_traceback(vm: &Vm) -> Traceback {
    let mut entries = Vec::with_capacity(vm.frames.len());
    for frame in vm.frames.iter().rev() {
        let mut entry = Map::new();
        let _ = entry.insert(v_str("this"), frame.this.clone());
        let _ = entry.insert(v_str("verb"), v_str(&frame.verb_name));
        let _ = entry.insert(v_str("programmer"), Value::Obj(frame.permissions));
        let _ = entry.insert(v_str("verb_loc"), Value::Obj(frame.definer));
        let _ = entry.insert(v_str("player"), Value::Obj(frame.player));
        let _ = entry.insert(v_str("line"), Value::Int(frame.line() as i64));
        let _ = entry.insert(v_str("native"), Value::Int(frame.is_native() as i64));
        entries.push(Value::Map(entry));
    }
    List::from_vec(entries)
}

/// The value a catch handler receives: {code, message, value, traceback}
pub fn handler_value(exception: &Exception, traceback: &Traceback) -> Value {
    v_list(vec![
        Value::Err(exception.code),
        v_str(&exception.msg),
        exception.value.clone(),
        Value::List(traceback.clone()),
    ])
}

// Reason encoding across finally bodies: the pending reason is parked on the
// operand stack as a (code, value) pair while the handler runs.
const REASON_FALLTHROUGH: i64 = 0;
const REASON_RAISE: i64 = 1;
const REASON_RETURN: i64 = 2;
const REASON_EXIT: i64 = 3;
const REASON_ABORT: i64 = 4;

/// The (code, value) pair for normal completion of a protected body
pub fn fallthrough_pair() -> (Value, Value) {
    (Value::Int(REASON_FALLTHROUGH), Value::Int(0))
}

/// Park a reason as the stack pair a finally handler preserves
pub fn encode_reason(reason: UnwindReason) -> (Value, Value) {
    match reason {
        UnwindReason::Raise {
            exception,
            traceback,
        } => (
            Value::Int(REASON_RAISE),
            handler_value(&exception, &traceback),
        ),
        UnwindReason::Return(value) => (Value::Int(REASON_RETURN), value),
        UnwindReason::Exit { stack, label } => (
            Value::Int(REASON_EXIT),
            v_list(vec![Value::Int(stack as i64), Value::Int(label as i64)]),
        ),
        UnwindReason::Abort(r) => (Value::Int(REASON_ABORT), Value::Int(abort_code(r))),
    }
}

/// Reverse of [`encode_reason`]; `None` means fall through normally
pub fn decode_reason(code: &Value, value: Value) -> VmResult<Option<UnwindReason>> {
    let Value::Int(code) = code else {
        return Err(VmError::Corrupt("finally reason code is not an int".into()));
    };
    Ok(match *code {
        REASON_FALLTHROUGH => None,
        REASON_RAISE => {
            let Value::List(parts) = value else {
                return Err(VmError::Corrupt("raise reason payload malformed".into()));
            };
            let (Ok(Value::Err(code)), Ok(Value::Str(msg)), Ok(v), Ok(Value::List(tb))) = (
                parts.index(1),
                parts.index(2),
                parts.index(3),
                parts.index(4),
            ) else {
                return Err(VmError::Corrupt("raise reason payload malformed".into()));
            };
            Some(UnwindReason::Raise {
                exception: Exception {
                    code,
                    msg: msg.to_string(),
                    value: v,
                },
                traceback: tb,
            })
        }
        REASON_RETURN => Some(UnwindReason::Return(value)),
        REASON_EXIT => {
            let Value::List(parts) = value else {
                return Err(VmError::Corrupt("exit reason payload malformed".into()));
            };
            let (Ok(Value::Int(stack)), Ok(Value::Int(label))) = (parts.index(1), parts.index(2))
            else {
                return Err(VmError::Corrupt("exit reason payload malformed".into()));
            };
            Some(UnwindReason::Exit {
                stack: stack as usize,
                label: label as u16,
            })
        }
        REASON_ABORT => {
            let Value::Int(r) = value else {
                return Err(VmError::Corrupt("abort reason payload malformed".into()));
            };
            Some(UnwindReason::Abort(abort_from_code(r)?))
        }
        other => {
            return Err(VmError::Corrupt(format!(
                "unknown finally reason code {other}"
            )))
        }
    })
}

fn abort_code(r: AbortReason) -> i64 {
    match r {
        AbortReason::Ticks => 0,
        AbortReason::Seconds => 1,
        AbortReason::Kill => 2,
        AbortReason::Uncaught => 3,
    }
}

fn abort_from_code(code: i64) -> VmResult<AbortReason> {
    Ok(match code {
        0 => AbortReason::Ticks,
        1 => AbortReason::Seconds,
        2 => AbortReason::Kill,
        3 => AbortReason::Uncaught,
        other => return Err(VmError::Corrupt(format!("unknown abort code {other}"))),
    })
}

enum Hit {
    Finally(u16),
    Catch(u16),
    Discard,
}

/// Walk a reason across the stack until something absorbs it
pub fn unwind(
    vm: &mut Vm,
    mut reason: UnwindReason,
    host: &mut dyn Host,
    natives: &NativeRegistry,
) -> VmResult<UnwindOutcome> {
    loop {
        let target_depth = match &reason {
            UnwindReason::Exit { stack, .. } => *stack,
            _ => 0,
        };

        // Scan the current frame's operand stack top-down for a marker that
        // absorbs this reason; everything passed over is discarded.
        loop {
            let frame = vm.top_mut();
            if frame.stack.len() <= target_depth {
                break;
            }
            let top = frame.stack.len() - 1;
            let hit = match &frame.stack[top] {
                Value::Finally(m) => Hit::Finally(m.handler),
                Value::Catch(m) => match &reason {
                    UnwindReason::Raise { exception, .. } if m.codes.matches(exception.code) => {
                        Hit::Catch(m.handler)
                    }
                    _ => Hit::Discard,
                },
                _ => Hit::Discard,
            };
            match hit {
                Hit::Discard => frame.truncate_stack(top),
                Hit::Finally(handler) => {
                    frame.truncate_stack(top);
                    let (code, value) = encode_reason(reason);
                    frame.push(code)?;
                    frame.push(value)?;
                    frame.jump(handler);
                    return Ok(UnwindOutcome::Resumed);
                }
                Hit::Catch(handler) => {
                    let UnwindReason::Raise {
                        exception,
                        traceback,
                    } = reason
                    else {
                        unreachable!("catch marker hit by a non-raise reason");
                    };
                    frame.truncate_stack(top);
                    frame.push(handler_value(&exception, &traceback))?;
                    frame.jump(handler);
                    return Ok(UnwindOutcome::Resumed);
                }
            }
        }

        // No marker in this frame.
        match reason {
            UnwindReason::Exit { stack, label } => {
                let frame = vm.top_mut();
                frame.truncate_stack(stack);
                frame.jump(label);
                return Ok(UnwindOutcome::Resumed);
            }
            UnwindReason::Return(value) => {
                vm.frames.pop();
                match vm.frames.last_mut() {
                    None => return Ok(UnwindOutcome::Done(value)),
                    Some(caller) if caller.is_native() => {
                        return Ok(UnwindOutcome::ReenterNative(value))
                    }
                    Some(caller) => {
                        caller.push(value)?;
                        return Ok(UnwindOutcome::Resumed);
                    }
                }
            }
            UnwindReason::Raise {
                exception,
                traceback,
            } => {
                let finished = vm
                    .frames
                    .pop()
                    .ok_or_else(|| VmError::Corrupt("raise on empty call stack".into()))?;
                if let Some(native) = &finished.native {
                    natives.cleanup(native.id, &native.data);
                }
                if vm.frames.is_empty() {
                    debug!(code = %exception.code, "uncaught exception, handing to host");
                    host.handle_uncaught(finished.player, &exception, &traceback);
                    return Ok(UnwindOutcome::Aborted(AbortReason::Uncaught));
                }
                reason = UnwindReason::Raise {
                    exception,
                    traceback,
                };
            }
            UnwindReason::Abort(r) => {
                let finished = vm
                    .frames
                    .pop()
                    .ok_or_else(|| VmError::Corrupt("abort on empty call stack".into()))?;
                if let Some(native) = &finished.native {
                    natives.cleanup(native.id, &native.data);
                }
                if vm.frames.is_empty() {
                    return Ok(UnwindOutcome::Aborted(r));
                }
                reason = UnwindReason::Abort(r);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{frame_on, RecordingHost};
    use crate::var::{v_err, v_int, CatchCodes, CatchMarker, FinallyMarker};

    fn registry() -> NativeRegistry {
        NativeRegistry::new()
    }

    #[test]
    fn test_return_delivers_to_caller() {
        let mut vm = Vm::new(frame_on("outer"), 8);
        vm.frames.push(frame_on("inner"));
        let natives = registry();
        let mut host = RecordingHost::default();

        let outcome = unwind(
            &mut vm,
            UnwindReason::Return(v_int(42)),
            &mut host,
            &natives,
        )
        .unwrap();
        assert!(matches!(outcome, UnwindOutcome::Resumed));
        assert_eq!(vm.depth(), 1);
        assert_eq!(vm.top().stack, vec![v_int(42)]);
    }

    #[test]
    fn test_return_from_bottom_frame_is_done() {
        let mut vm = Vm::new(frame_on("only"), 8);
        let natives = registry();
        let mut host = RecordingHost::default();

        let outcome = unwind(
            &mut vm,
            UnwindReason::Return(v_int(7)),
            &mut host,
            &natives,
        )
        .unwrap();
        match outcome {
            UnwindOutcome::Done(v) => assert_eq!(v, v_int(7)),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn test_raise_matches_catch_marker() {
        let mut vm = Vm::new(frame_on("main"), 8);
        let frame = vm.top_mut();
        frame
            .push(Value::Catch(CatchMarker {
                codes: CatchCodes::Codes(List::from_vec(vec![v_err(ErrCode::E_DIV)])),
                handler: 9,
            }))
            .unwrap();
        frame.push(v_int(555)).unwrap(); // partial expression state

        let natives = registry();
        let mut host = RecordingHost::default();
        let reason = raise(&vm, Exception::new(ErrCode::E_DIV));
        let outcome = unwind(&mut vm, reason, &mut host, &natives).unwrap();

        assert!(matches!(outcome, UnwindOutcome::Resumed));
        let frame = vm.top();
        assert_eq!(frame.pc, 9);
        // Stack holds exactly the handler value.
        assert_eq!(frame.stack.len(), 1);
        let Value::List(parts) = &frame.stack[0] else {
            panic!("handler value is not a list");
        };
        assert_eq!(parts.index(1).unwrap(), v_err(ErrCode::E_DIV));
    }

    #[test]
    fn test_raise_skips_nonmatching_marker() {
        let mut vm = Vm::new(frame_on("main"), 8);
        let frame = vm.top_mut();
        frame
            .push(Value::Catch(CatchMarker {
                codes: CatchCodes::Codes(List::from_vec(vec![v_err(ErrCode::E_TYPE)])),
                handler: 5,
            }))
            .unwrap();
        frame
            .push(Value::Catch(CatchMarker {
                codes: CatchCodes::Any,
                handler: 11,
            }))
            .unwrap();

        // E_DIV does not match the closer {E_TYPE} arm... wait, markers are
        // scanned top-down, so ANY (pushed last) is seen first and wins.
        let natives = registry();
        let mut host = RecordingHost::default();
        let reason = raise(&vm, Exception::new(ErrCode::E_DIV));
        unwind(&mut vm, reason, &mut host, &natives).unwrap();
        assert_eq!(vm.top().pc, 11);
    }

    #[test]
    fn test_uncaught_reaches_host_with_full_trace() {
        let mut vm = Vm::new(frame_on("outer"), 8);
        vm.frames.push(frame_on("inner"));
        let natives = registry();
        let mut host = RecordingHost::default();

        let reason = raise(&vm, Exception::new(ErrCode::E_RANGE));
        let outcome = unwind(&mut vm, reason, &mut host, &natives).unwrap();
        assert!(matches!(
            outcome,
            UnwindOutcome::Aborted(AbortReason::Uncaught)
        ));
        assert_eq!(host.uncaught.len(), 1);
        let (exc, tb) = &host.uncaught[0];
        assert_eq!(exc.code, ErrCode::E_RANGE);
        // One entry per frame live at raise time.
        assert_eq!(tb.len(), 2);
    }

    #[test]
    fn test_finally_intercepts_return() {
        let mut vm = Vm::new(frame_on("main"), 8);
        vm.top_mut()
            .push(Value::Finally(FinallyMarker { handler: 20 }))
            .unwrap();

        let natives = registry();
        let mut host = RecordingHost::default();
        let outcome = unwind(
            &mut vm,
            UnwindReason::Return(v_int(3)),
            &mut host,
            &natives,
        )
        .unwrap();

        assert!(matches!(outcome, UnwindOutcome::Resumed));
        let frame = vm.top();
        assert_eq!(frame.pc, 20);
        // Reason pair parked on the stack for FinallyContinue.
        assert_eq!(frame.stack.len(), 2);
        assert_eq!(frame.stack[0], v_int(REASON_RETURN));
        assert_eq!(frame.stack[1], v_int(3));
    }

    #[test]
    fn test_abort_skips_catch_but_not_finally() {
        let mut vm = Vm::new(frame_on("main"), 8);
        let frame = vm.top_mut();
        frame
            .push(Value::Finally(FinallyMarker { handler: 30 }))
            .unwrap();
        frame
            .push(Value::Catch(CatchMarker {
                codes: CatchCodes::Any,
                handler: 40,
            }))
            .unwrap();

        let natives = registry();
        let mut host = RecordingHost::default();
        let outcome = unwind(
            &mut vm,
            UnwindReason::Abort(AbortReason::Ticks),
            &mut host,
            &natives,
        )
        .unwrap();

        // The ANY catch is ignored; the finally below it runs.
        assert!(matches!(outcome, UnwindOutcome::Resumed));
        assert_eq!(vm.top().pc, 30);
        assert_eq!(vm.top().stack[0], v_int(REASON_ABORT));
    }

    #[test]
    fn test_exit_stays_in_frame() {
        let mut vm = Vm::new(frame_on("outer"), 8);
        vm.frames.push(frame_on("inner"));
        let frame = vm.top_mut();
        frame.push(v_int(1)).unwrap();
        frame.push(v_int(2)).unwrap();
        frame.push(v_int(3)).unwrap();

        let natives = registry();
        let mut host = RecordingHost::default();
        let outcome = unwind(
            &mut vm,
            UnwindReason::Exit { stack: 1, label: 17 },
            &mut host,
            &natives,
        )
        .unwrap();

        assert!(matches!(outcome, UnwindOutcome::Resumed));
        assert_eq!(vm.depth(), 2);
        assert_eq!(vm.top().stack, vec![v_int(1)]);
        assert_eq!(vm.top().pc, 17);
    }

    #[test]
    fn test_reason_pair_roundtrip() {
        let reasons = vec![
            UnwindReason::Return(v_int(5)),
            UnwindReason::Exit { stack: 2, label: 9 },
            UnwindReason::Abort(AbortReason::Seconds),
            UnwindReason::Raise {
                exception: Exception::with_msg(ErrCode::E_PERM, "nope"),
                traceback: List::new(),
            },
        ];
        for reason in reasons {
            let kind = std::mem::discriminant(&reason);
            let (code, value) = encode_reason(reason);
            let decoded = decode_reason(&code, value).unwrap().unwrap();
            assert_eq!(std::mem::discriminant(&decoded), kind);
        }
        let (code, value) = fallthrough_pair();
        assert!(decode_reason(&code, value).unwrap().is_none());
    }
}
