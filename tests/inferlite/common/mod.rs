use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Result;
use inferlite::{
    DataLoader, DType, EventTracer, MemoryAllocator, OpCode, ProgramBuilder, SharedAllocator,
    SharedTracer, TraceEvent, TraceEventKind,
};

/// One method "identity": copies its single f32[3] input to the output.
pub fn identity_program() -> Vec<u8> {
    let mut builder = ProgramBuilder::new();
    let method = builder.method("identity");
    let x = method.input(DType::F32, &[3]);
    let y = method.planned(DType::F32, &[3]);
    method.op(OpCode::Copy, &[x], y);
    method.output(y);
    builder.build()
}

/// One method "forward": adds its two f32[2] inputs.
pub fn forward_add_program() -> Vec<u8> {
    let mut builder = ProgramBuilder::new();
    let method = builder.method("forward");
    let a = method.input(DType::F32, &[2]);
    let b = method.input(DType::F32, &[2]);
    let y = method.planned(DType::F32, &[2]);
    method.op(OpCode::Add, &[a, b], y);
    method.output(y);
    builder.build()
}

/// One method "forward" scaling its input by a baked-in constant.
pub fn forward_scale_program() -> Vec<u8> {
    let mut builder = ProgramBuilder::new();
    let method = builder.method("forward");
    let x = method.input(DType::F32, &[4]);
    let w = method.constant(&[2.0f32, 2.0, 2.0, 2.0], &[4]);
    let y = method.planned(DType::F32, &[4]);
    method.op(OpCode::Mul, &[x, w], y);
    method.output(y);
    builder.build()
}

/// A method whose plan declares buffers of 128 and 256 bytes, larger than
/// the values placed in them.
pub fn padded_plan_program() -> Vec<u8> {
    let mut builder = ProgramBuilder::new();
    let method = builder.method("forward");
    let x = method.input(DType::F32, &[4]);
    let small = method.buffer(128);
    let large = method.buffer(256);
    let scratch = method.planned_in(DType::F32, &[4], small, 0);
    let y = method.planned_in(DType::F32, &[4], large, 0);
    method.op(OpCode::Copy, &[x], scratch);
    method.op(OpCode::Relu, &[scratch], y);
    method.output(y);
    builder.build()
}

/// A method whose planned value does not fit its declared buffer.
pub fn bad_plan_program() -> Vec<u8> {
    let mut builder = ProgramBuilder::new();
    let method = builder.method("identity");
    let x = method.input(DType::F32, &[3]);
    let cramped = method.buffer(4);
    let y = method.planned_in(DType::F32, &[3], cramped, 0);
    method.op(OpCode::Copy, &[x], y);
    method.output(y);
    builder.build()
}

pub fn write_temp_program(tag: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = std::env::temp_dir().join(format!(
        "inferlite-test-{}-{}.ilp",
        tag,
        std::process::id()
    ));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

/// Loader stub counting how often its bytes are read.
#[derive(Debug)]
pub struct CountingLoader {
    data: Vec<u8>,
    reads: Rc<Cell<usize>>,
}

impl CountingLoader {
    pub fn new(data: Vec<u8>) -> (Self, Rc<Cell<usize>>) {
        let reads = Rc::new(Cell::new(0));
        (
            Self {
                data,
                reads: Rc::clone(&reads),
            },
            reads,
        )
    }
}

impl DataLoader for CountingLoader {
    fn bytes(&self) -> &[u8] {
        self.reads.set(self.reads.get() + 1);
        &self.data
    }
}

/// Tracer stub recording every event it receives.
#[derive(Debug)]
pub struct RecordingTracer {
    events: Rc<RefCell<Vec<TraceEvent>>>,
}

impl RecordingTracer {
    pub fn create() -> (SharedTracer, Rc<RefCell<Vec<TraceEvent>>>) {
        let events = Rc::new(RefCell::new(Vec::new()));
        let tracer = Rc::new(RefCell::new(RecordingTracer {
            events: Rc::clone(&events),
        }));
        (tracer, events)
    }
}

impl EventTracer for RecordingTracer {
    fn emit(&mut self, event: &TraceEvent) {
        self.events.borrow_mut().push(event.clone());
    }
}

pub fn count_events(events: &[TraceEvent], kind: TraceEventKind) -> usize {
    events.iter().filter(|event| event.kind == kind).count()
}

/// Allocator stub counting allocation calls.
#[derive(Debug)]
pub struct CountingAllocator {
    calls: Rc<Cell<usize>>,
}

impl CountingAllocator {
    pub fn create() -> (SharedAllocator, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let allocator = Rc::new(RefCell::new(CountingAllocator {
            calls: Rc::clone(&calls),
        }));
        (allocator, calls)
    }
}

impl MemoryAllocator for CountingAllocator {
    fn allocate(&mut self, nbytes: usize) -> inferlite::Result<Vec<u8>> {
        self.calls.set(self.calls.get() + 1);
        Ok(vec![0u8; nbytes])
    }
}

/// Allocator stub returning buffers shorter than requested.
#[derive(Debug)]
pub struct ShortAllocator;

impl ShortAllocator {
    pub fn create() -> SharedAllocator {
        Rc::new(RefCell::new(ShortAllocator))
    }
}

impl MemoryAllocator for ShortAllocator {
    fn allocate(&mut self, nbytes: usize) -> inferlite::Result<Vec<u8>> {
        Ok(vec![0u8; nbytes / 2])
    }
}
