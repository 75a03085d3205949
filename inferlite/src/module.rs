use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Once};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::loader::{DataLoader, FileDataLoader, MlockPolicy, MmapDataLoader};
use crate::memory::{HierarchicalAllocator, MallocAllocator, MemoryManager, SharedAllocator};
use crate::method::Method;
use crate::program::{self, MethodMeta, Program, Verification};
use crate::tensor::{Tensor, Value};
use crate::trace::{timing_parts, SharedTracer, TraceEvent, TraceEventKind};

/// How the serialized program's backing store is acquired at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Plain read into memory.
    File,
    /// Memory map, with the given page-locking policy.
    Mmap { mlock: MlockPolicy },
}

impl Default for LoadMode {
    fn default() -> Self {
        LoadMode::File
    }
}

/// Cache entry owning one loaded method's buffers, allocators, and the
/// materialized method object. Built whole by [`Module::load_method`] or
/// not at all.
#[derive(Debug)]
struct MethodHolder {
    method: Method,
}

/// Orchestrates loading a serialized program and executing its methods.
///
/// Lazily acquires the storage accessor and parsed program, realizes each
/// method's memory plan on first load, and caches the materialized method
/// under its name for the module's whole life. Not thread-safe; guard with
/// external mutual exclusion or give each execution context its own module
/// sharing the `Arc<Program>`.
#[derive(Debug)]
pub struct Module {
    path: Option<PathBuf>,
    load_mode: LoadMode,
    loader: Option<Box<dyn DataLoader>>,
    program: Option<Arc<Program>>,
    persistent_allocator: SharedAllocator,
    temp_allocator: SharedAllocator,
    tracer: Option<SharedTracer>,
    methods: HashMap<String, MethodHolder>,
}

impl Module {
    /// Construct from a storage path; the accessor is built on first load
    /// according to `load_mode`.
    pub fn from_file(
        path: impl AsRef<Path>,
        load_mode: LoadMode,
        tracer: Option<SharedTracer>,
    ) -> Self {
        runtime_init();
        Self {
            path: Some(path.as_ref().to_path_buf()),
            load_mode,
            loader: None,
            program: None,
            persistent_allocator: MallocAllocator::shared(),
            temp_allocator: MallocAllocator::shared(),
            tracer,
            methods: HashMap::new(),
        }
    }

    /// Construct from an already-built storage accessor.
    pub fn from_loader(
        loader: Box<dyn DataLoader>,
        persistent_allocator: Option<SharedAllocator>,
        temp_allocator: Option<SharedAllocator>,
        tracer: Option<SharedTracer>,
    ) -> Self {
        runtime_init();
        Self {
            path: None,
            load_mode: LoadMode::default(),
            loader: Some(loader),
            program: None,
            persistent_allocator: persistent_allocator.unwrap_or_else(MallocAllocator::shared),
            temp_allocator: temp_allocator.unwrap_or_else(MallocAllocator::shared),
            tracer,
            methods: HashMap::new(),
        }
    }

    /// Construct from an already-parsed shared program, skipping accessor
    /// construction and parsing entirely.
    pub fn from_program(
        program: Arc<Program>,
        persistent_allocator: Option<SharedAllocator>,
        temp_allocator: Option<SharedAllocator>,
        tracer: Option<SharedTracer>,
    ) -> Self {
        runtime_init();
        Self {
            path: None,
            load_mode: LoadMode::default(),
            loader: None,
            program: Some(program),
            persistent_allocator: persistent_allocator.unwrap_or_else(MallocAllocator::shared),
            temp_allocator: temp_allocator.unwrap_or_else(MallocAllocator::shared),
            tracer,
            methods: HashMap::new(),
        }
    }

    /// Acquire the storage accessor and parse the program. Idempotent: the
    /// accessor is constructed and the program parsed at most once.
    pub fn load(&mut self, verification: Verification) -> Result<()> {
        if self.program.is_some() {
            return Ok(());
        }
        if self.loader.is_none() {
            self.loader = Some(self.make_loader()?);
        }
        let started = Instant::now();
        let tables = match self.loader.as_deref() {
            Some(loader) => program::parse_tables(loader.bytes(), verification)?,
            None => {
                return Err(Error::AccessorConstruction(
                    "no storage accessor configured".to_string(),
                ))
            }
        };
        // only absorb the accessor once parsing has succeeded, so a failed
        // load leaves no partially-set state
        let loader = match self.loader.take() {
            Some(loader) => loader,
            None => {
                return Err(Error::AccessorConstruction(
                    "no storage accessor configured".to_string(),
                ))
            }
        };
        let program = Arc::new(Program::from_parts(loader, tables));
        crate::trace!("program loaded: {} methods", program.num_methods());
        if let Some(tracer) = &self.tracer {
            let (micros, micros_parts) = timing_parts(started.elapsed());
            tracer.borrow_mut().emit(&TraceEvent {
                kind: TraceEventKind::ProgramLoad,
                method_name: String::new(),
                op_name: String::new(),
                instruction_index: 0,
                micros,
                micros_parts,
            });
        }
        self.program = Some(program);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.program.is_some()
    }

    /// Names of every method in the program. Forces a load.
    pub fn method_names(&mut self) -> Result<HashSet<String>> {
        self.load(Verification::default())?;
        let program = self.shared_program()?;
        let method_count = program.num_methods();
        let mut result = HashSet::with_capacity(method_count);
        for index in 0..method_count {
            result.insert(program.method_name(index)?.to_string());
        }
        Ok(result)
    }

    /// Realize the method's memory plan and materialize it into the cache.
    /// Idempotent per name; a failure inserts nothing.
    pub fn load_method(&mut self, method_name: &str) -> Result<()> {
        if self.is_method_loaded(method_name) {
            return Ok(());
        }
        self.load(Verification::default())?;
        let program = self.shared_program()?;
        let meta = program.method_meta(method_name)?;

        let mut planned_buffers = Vec::with_capacity(meta.num_planned_buffers());
        for index in 0..meta.num_planned_buffers() {
            let size = meta.planned_buffer_size(index)?;
            if size == 0 {
                return Err(Error::MemoryAllocation(format!(
                    "method {}: planned buffer {} has size 0",
                    method_name, index
                )));
            }
            planned_buffers.push(vec![0u8; size]);
        }
        let planned = HierarchicalAllocator::new(planned_buffers);
        let memory = MemoryManager::new(
            Rc::clone(&self.persistent_allocator),
            planned,
            Rc::clone(&self.temp_allocator),
        );
        let method = program.materialize(method_name, memory, self.tracer.clone())?;
        crate::trace!(
            "method {} loaded: {} planned buffers",
            method_name,
            meta.num_planned_buffers()
        );
        self.methods
            .insert(method_name.to_string(), MethodHolder { method });
        Ok(())
    }

    pub fn is_method_loaded(&self, method_name: &str) -> bool {
        self.methods.contains_key(method_name)
    }

    /// Metadata descriptor for a method. Forces the method loaded.
    pub fn method_meta(&mut self, method_name: &str) -> Result<MethodMeta> {
        self.load_method(method_name)?;
        match self.methods.get(method_name) {
            Some(holder) => Ok(holder.method.meta().clone()),
            None => Err(Error::MethodNotFound(method_name.to_string())),
        }
    }

    /// Bind inputs, run the method to completion, and collect its outputs.
    ///
    /// Inputs are bound to ordinal slots in declaration order; the first
    /// binding failure aborts with earlier slots left bound, so the method
    /// must be fully rebound before reuse after such a failure.
    pub fn execute(&mut self, method_name: &str, inputs: &[Value]) -> Result<Vec<Value>> {
        self.load_method(method_name)?;
        let holder = match self.methods.get_mut(method_name) {
            Some(holder) => holder,
            None => return Err(Error::MethodNotFound(method_name.to_string())),
        };
        let method = &mut holder.method;
        if inputs.len() != method.inputs_size() {
            return Err(Error::InputBinding(format!(
                "method {} declares {} inputs, got {}",
                method_name,
                method.inputs_size(),
                inputs.len()
            )));
        }
        for (index, value) in inputs.iter().enumerate() {
            method.set_input(index, value)?;
        }
        method.execute()?;
        method.get_outputs()
    }

    /// Rebind output slot `index` of the method named "forward" to write
    /// directly into the supplied tensor's storage. The tensor's storage
    /// must stay valid through at least the next `execute` of "forward".
    pub fn set_output_data_ptr(&mut self, output_tensor: &Tensor, output_index: usize) -> Result<()> {
        self.load_method("forward")?;
        match self.methods.get_mut("forward") {
            Some(holder) => holder.method.set_output_data_ptr(output_tensor, output_index),
            None => Err(Error::MethodNotFound("forward".to_string())),
        }
    }

    /// The realized planned-memory view of a loaded method, if any.
    pub fn planned_memory(&self, method_name: &str) -> Option<&HierarchicalAllocator> {
        self.methods
            .get(method_name)
            .map(|holder| holder.method.memory().planned())
    }

    /// The shared parsed program, if loaded.
    pub fn program(&self) -> Option<&Arc<Program>> {
        self.program.as_ref()
    }

    fn shared_program(&self) -> Result<Arc<Program>> {
        match &self.program {
            Some(program) => Ok(Arc::clone(program)),
            None => Err(Error::ProgramParse("program is not loaded".to_string())),
        }
    }

    fn make_loader(&self) -> Result<Box<dyn DataLoader>> {
        let path = self.path.as_ref().ok_or_else(|| {
            Error::AccessorConstruction("no storage path or accessor configured".to_string())
        })?;
        Ok(match self.load_mode {
            LoadMode::File => Box::new(FileDataLoader::from_path(path)?),
            LoadMode::Mmap { mlock } => Box::new(MmapDataLoader::from_path(path, mlock)?),
        })
    }
}

/// One-time process-wide runtime initialization.
fn runtime_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        crate::trace!("inferlite runtime initialized");
    });
}
