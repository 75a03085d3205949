mod builder;
mod error;
mod loader;
pub mod logging;
mod memory;
mod method;
mod module;
mod ops;
mod program;
mod tensor;
mod trace;

pub use builder::{MethodBuilder, ProgramBuilder};
pub use error::{Error, Result};
pub use loader::{BufferDataLoader, DataLoader, FileDataLoader, MlockPolicy, MmapDataLoader};
pub use memory::{
    HierarchicalAllocator, MallocAllocator, MemoryAllocator, MemoryManager, SharedAllocator,
};
pub use method::Method;
pub use module::{LoadMode, Module};
pub use ops::OpCode;
pub use program::{MethodMeta, Program, ValueSpec, Verification};
pub use tensor::{DType, Tensor, TensorElement, Value};
pub use trace::{EventTracer, SharedTracer, TraceEvent, TraceEventKind};
