//! In-memory test doubles for the external collaborators
//!
//! Used by this crate's unit and integration tests; hosts embedding the VM
//! may also find them useful as reference implementations of the traits.

use crate::activation::Activation;
use crate::db::{VerbInfo, WorldState};
use crate::host::{Host, VerbCall};
use crate::scheduler::TaskId;
use crate::var::{ErrCode, List, ObjId, Value};
use crate::vm::{Exception, ExecCtx, ResumeValue, SchedulerOps};
use hearth_bytecode::{Opcode, Program, ProgramBuilder};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct TestObject {
    parent: Option<ObjId>,
    location: Option<ObjId>,
    props: FxHashMap<String, Value>,
    verbs: FxHashMap<String, VerbInfo>,
}

/// A minimal in-memory object database
#[derive(Default)]
pub struct MemWorld {
    objects: FxHashMap<ObjId, TestObject>,
}

impl MemWorld {
    /// Empty world
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object with an optional parent
    pub fn add_object(&mut self, obj: ObjId, parent: Option<ObjId>) {
        self.objects.insert(
            obj,
            TestObject {
                parent,
                ..Default::default()
            },
        );
    }

    /// Define a property directly on an object
    pub fn set_prop(&mut self, obj: ObjId, name: &str, value: Value) {
        if let Some(o) = self.objects.get_mut(&obj) {
            o.props.insert(name.to_ascii_lowercase(), value);
        }
    }

    /// Define a verb on an object; the definer and owner are the object
    pub fn add_verb(&mut self, obj: ObjId, name: &str, program: Arc<Program>, debug: bool) {
        if let Some(o) = self.objects.get_mut(&obj) {
            o.verbs.insert(
                name.to_ascii_lowercase(),
                VerbInfo {
                    program,
                    definer: obj,
                    owner: obj,
                    names: name.to_string(),
                    debug,
                },
            );
        }
    }
}

impl WorldState for MemWorld {
    fn valid(&self, obj: ObjId) -> bool {
        self.objects.contains_key(&obj)
    }

    fn retrieve_property(
        &mut self,
        _perms: ObjId,
        obj: ObjId,
        name: &str,
    ) -> Result<Value, ErrCode> {
        let name = name.to_ascii_lowercase();
        let mut cursor = Some(obj);
        while let Some(id) = cursor {
            let o = self.objects.get(&id).ok_or(ErrCode::E_INVIND)?;
            if let Some(v) = o.props.get(&name) {
                return Ok(v.clone());
            }
            cursor = o.parent;
        }
        Err(ErrCode::E_PROPNF)
    }

    fn update_property(
        &mut self,
        _perms: ObjId,
        obj: ObjId,
        name: &str,
        value: &Value,
    ) -> Result<(), ErrCode> {
        let o = self.objects.get_mut(&obj).ok_or(ErrCode::E_INVIND)?;
        o.props.insert(name.to_ascii_lowercase(), value.clone());
        Ok(())
    }

    fn find_verb(&mut self, _perms: ObjId, obj: ObjId, name: &str) -> Result<VerbInfo, ErrCode> {
        let name = name.to_ascii_lowercase();
        let mut cursor = Some(obj);
        while let Some(id) = cursor {
            let o = self.objects.get(&id).ok_or(ErrCode::E_INVIND)?;
            if let Some(info) = o.verbs.get(&name) {
                return Ok(info.clone());
            }
            cursor = o.parent;
        }
        Err(ErrCode::E_VERBNF)
    }

    fn parent(&self, obj: ObjId) -> Result<ObjId, ErrCode> {
        self.objects
            .get(&obj)
            .ok_or(ErrCode::E_INVIND)
            .map(|o| o.parent.unwrap_or(ObjId::NOTHING))
    }

    fn children(&self, obj: ObjId) -> Result<Vec<ObjId>, ErrCode> {
        if !self.valid(obj) {
            return Err(ErrCode::E_INVIND);
        }
        Ok(self
            .objects
            .iter()
            .filter(|(_, o)| o.parent == Some(obj))
            .map(|(id, _)| *id)
            .collect())
    }

    fn location(&self, obj: ObjId) -> Result<ObjId, ErrCode> {
        self.objects
            .get(&obj)
            .ok_or(ErrCode::E_INVIND)
            .map(|o| o.location.unwrap_or(ObjId::NOTHING))
    }

    fn contents(&self, obj: ObjId) -> Result<Vec<ObjId>, ErrCode> {
        if !self.valid(obj) {
            return Err(ErrCode::E_INVIND);
        }
        Ok(self
            .objects
            .iter()
            .filter(|(_, o)| o.location == Some(obj))
            .map(|(id, _)| *id)
            .collect())
    }
}

/// Host double that records everything it is told
#[derive(Default)]
pub struct RecordingHost {
    /// Lines sent to players
    pub output: Vec<(ObjId, String)>,
    /// Uncaught exceptions with their tracebacks
    pub uncaught: Vec<(Exception, List)>,
    /// Canned command parses, keyed by the input line
    pub commands: FxHashMap<String, VerbCall>,
    /// Input flow-control transitions
    pub flow: Vec<(ObjId, bool)>,
}

impl Host for RecordingHost {
    fn notify(&mut self, player: ObjId, line: &str) {
        self.output.push((player, line.to_string()));
    }

    fn handle_uncaught(&mut self, _player: ObjId, exception: &Exception, traceback: &List) {
        self.uncaught.push((exception.clone(), traceback.clone()));
    }

    fn parse_command(&mut self, _player: ObjId, line: &str) -> Option<VerbCall> {
        self.commands.get(line).cloned()
    }

    fn set_input_flow(&mut self, player: ObjId, paused: bool) {
        self.flow.push((player, paused));
    }
}

/// Scheduler double: records forks, refuses everything else
#[derive(Default)]
pub struct NoSched {
    /// Forked frames with their delays
    pub forks: Vec<(Activation, Duration)>,
    next_fork_id: u64,
}

impl SchedulerOps for NoSched {
    fn current_task_id(&self) -> TaskId {
        TaskId::from_u64(1)
    }

    fn fork_task(&mut self, frame: Activation, delay: Duration) -> Result<TaskId, ErrCode> {
        self.forks.push((frame, delay));
        self.next_fork_id += 1;
        Ok(TaskId::from_u64(1000 + self.next_fork_id))
    }

    fn kill_task(&mut self, _id: TaskId, _perms: ObjId) -> Result<(), ErrCode> {
        Err(ErrCode::E_INVARG)
    }

    fn resume_task(
        &mut self,
        _id: TaskId,
        _value: ResumeValue,
        _perms: ObjId,
    ) -> Result<(), ErrCode> {
        Err(ErrCode::E_INVARG)
    }

    fn queued_tasks(&self, _perms: ObjId) -> List {
        List::new()
    }

    fn task_stack(&self, _id: TaskId, _perms: ObjId) -> Result<List, ErrCode> {
        Err(ErrCode::E_INVARG)
    }
}

/// A one-instruction frame for unwind and persistence tests
pub fn frame_on(verb: &str) -> Activation {
    let mut b = ProgramBuilder::new();
    b.max_stack(16);
    b.op(Opcode::Done);
    let program = Arc::new(b.build());
    Activation::for_call(
        program,
        Value::Obj(ObjId(10)),
        ObjId(2),
        Value::Obj(ObjId::NOTHING),
        ObjId(10),
        ObjId(2),
        verb,
        verb,
        true,
        List::new(),
        "",
        ObjId::NOTHING,
        ObjId::NOTHING,
    )
}

/// World, host, and a roomy budget for native-function tests
pub fn native_args_parts() -> (MemWorld, RecordingHost, ExecCtx) {
    (
        MemWorld::new(),
        RecordingHost::default(),
        ExecCtx::new(100_000, Duration::from_secs(5)),
    )
}
