use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde::ser::{SerializeStruct, Serializer};

/// Tracer handle passed through to every materialized method.
pub type SharedTracer = Rc<RefCell<dyn EventTracer>>;

/// Consumer of runtime trace events. The runtime makes no decisions based
/// on it; events are passed through unmodified.
pub trait EventTracer: fmt::Debug {
    fn emit(&mut self, event: &TraceEvent);
}

/// Kind of trace event emitted by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TraceEventKind {
    ProgramLoad,
    MethodLoad,
    InputBind,
    OpExecute,
    Run,
    OutputFetch,
}

impl fmt::Display for TraceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEventKind::ProgramLoad => write!(f, "ProgramLoad"),
            TraceEventKind::MethodLoad => write!(f, "MethodLoad"),
            TraceEventKind::InputBind => write!(f, "InputBind"),
            TraceEventKind::OpExecute => write!(f, "OpExecute"),
            TraceEventKind::Run => write!(f, "Run"),
            TraceEventKind::OutputFetch => write!(f, "OutputFetch"),
        }
    }
}

/// Trace record for a single pipeline step.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    pub method_name: String,
    pub op_name: String,
    pub instruction_index: usize,
    pub micros: String,
    pub micros_parts: [u64; 3],
}

impl serde::Serialize for TraceEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("TraceEvent", 5)?;
        state.serialize_field("method_name", &self.method_name)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("op_name", &self.op_name)?;
        state.serialize_field("instruction_index", &self.instruction_index)?;
        state.serialize_field("micros", &self.micros_parts)?;
        state.end()
    }
}

pub(crate) fn timing_parts(duration: Duration) -> (String, [u64; 3]) {
    let total_ns = duration.as_nanos();
    let ms = (total_ns / 1_000_000) as u64;
    let us = ((total_ns / 1_000) % 1_000) as u64;
    let ns = (total_ns % 1_000) as u64;
    (format!("{ms}ms {us}us {ns}ns"), [ms, us, ns])
}
