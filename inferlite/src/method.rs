use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::memory::MemoryManager;
use crate::ops::{self, OpArg, OpCode};
use crate::program::{MethodMeta, MethodRecord, Program, ValueLocation};
use crate::tensor::{Tensor, Value};
use crate::trace::{timing_parts, SharedTracer, TraceEvent, TraceEventKind};

/// One compiled, executable entry point bound to a memory layout.
///
/// A method owns the allocator bundle it was materialized with; the planned
/// buffers back every intermediate and output value, so repeated runs need
/// no plan-related allocation.
#[derive(Debug)]
pub struct Method {
    program: Arc<Program>,
    index: usize,
    meta: MethodMeta,
    memory: MemoryManager,
    inputs: Vec<Option<Value>>,
    /// Externally supplied sinks replacing planned output storage, by slot.
    output_overrides: Vec<Option<Tensor>>,
    /// Constant bytes staged into persistent memory at materialization.
    constants: Vec<Option<Vec<u8>>>,
    /// Output slot for a value id, if the value is a declared output.
    output_slots: Vec<Option<usize>>,
    tracer: Option<SharedTracer>,
}

impl Method {
    pub(crate) fn materialize(
        program: Arc<Program>,
        index: usize,
        memory: MemoryManager,
        tracer: Option<SharedTracer>,
    ) -> Result<Self> {
        let record = program.record_at(index);
        validate_bundle(record, &memory)?;

        let mut output_slots = vec![None; record.values.len()];
        for (slot, &id) in record.outputs.iter().enumerate() {
            output_slots[id] = Some(slot);
        }

        // stage constant data into persistent memory so runs never reach
        // back into the serialized container
        let mut constants = vec![None; record.values.len()];
        for (id, value) in record.values.iter().enumerate() {
            if let ValueLocation::Constant { offset, nbytes } = value.location {
                let bytes = program.constant_bytes(offset, nbytes).map_err(|err| {
                    Error::MethodMaterialization(format!(
                        "method {}: constant value {}: {}",
                        record.name, id, err
                    ))
                })?;
                let mut staged = memory.persistent().borrow_mut().allocate(nbytes)?;
                if staged.len() != nbytes {
                    return Err(Error::MemoryAllocation(format!(
                        "persistent allocator returned {} bytes, requested {}",
                        staged.len(),
                        nbytes
                    )));
                }
                staged.copy_from_slice(bytes);
                constants[id] = Some(staged);
            }
        }

        let meta = record.meta();
        let inputs = vec![None; meta.num_inputs()];
        let output_overrides = vec![None; meta.num_outputs()];
        let method = Self {
            program,
            index,
            meta,
            memory,
            inputs,
            output_overrides,
            constants,
            output_slots,
            tracer,
        };
        method.emit(TraceEventKind::MethodLoad, "", 0, None);
        Ok(method)
    }

    pub fn meta(&self) -> &MethodMeta {
        &self.meta
    }

    pub fn inputs_size(&self) -> usize {
        self.meta.num_inputs()
    }

    pub fn outputs_size(&self) -> usize {
        self.meta.num_outputs()
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Bind one input value to its ordinal slot.
    pub fn set_input(&mut self, index: usize, value: &Value) -> Result<()> {
        let spec = self.meta.inputs.get(index).ok_or_else(|| {
            Error::InputBinding(format!(
                "input index {} out of range ({} declared)",
                index,
                self.meta.num_inputs()
            ))
        })?;
        let tensor = value.tensor().ok_or_else(|| {
            Error::InputBinding(format!(
                "input {} expects a tensor, got {}",
                index,
                value.kind()
            ))
        })?;
        if tensor.dtype() != spec.dtype {
            return Err(Error::InputBinding(format!(
                "input {} dtype mismatch: declared {:?}, got {:?}",
                index,
                spec.dtype,
                tensor.dtype()
            )));
        }
        if tensor.shape() != spec.shape.as_slice() {
            return Err(Error::InputBinding(format!(
                "input {} shape mismatch: declared {:?}, got {:?}",
                index,
                spec.shape,
                tensor.shape()
            )));
        }
        self.inputs[index] = Some(value.clone());
        self.emit(TraceEventKind::InputBind, "", index, None);
        Ok(())
    }

    /// Run the method to completion. All inputs must be bound.
    pub fn execute(&mut self) -> Result<()> {
        for (slot, value) in self.inputs.iter().enumerate() {
            if value.is_none() {
                return Err(Error::Execution(format!("input slot {} is not bound", slot)));
            }
        }
        self.memory.temp().borrow_mut().reset();

        let program = Arc::clone(&self.program);
        let record = program.record_at(self.index);
        let run_started = Instant::now();
        for (idx, instruction) in record.instructions.iter().enumerate() {
            let op_started = Instant::now();
            let mut staged = Vec::with_capacity(instruction.args.len());
            for &arg in &instruction.args {
                staged.push(self.read_value_bytes(record, arg)?);
            }
            let out_info = &record.values[instruction.out];
            let mut out_buf = self
                .memory
                .temp()
                .borrow_mut()
                .allocate(out_info.nbytes())?;
            let op_args: Vec<OpArg<'_>> = instruction
                .args
                .iter()
                .zip(staged.iter())
                .map(|(&arg, bytes)| OpArg {
                    dtype: record.values[arg].dtype,
                    shape: &record.values[arg].shape,
                    bytes,
                })
                .collect();
            ops::run_op(
                instruction.opcode,
                &op_args,
                out_info.dtype,
                &out_info.shape,
                &mut out_buf,
            )?;
            self.write_value_bytes(record, instruction.out, &out_buf)?;
            self.emit_op(instruction.opcode, idx, op_started.elapsed());
        }
        self.emit(TraceEventKind::Run, "", 0, Some(run_started.elapsed()));
        Ok(())
    }

    /// Produce a fresh output sequence sized to the declared output arity.
    pub fn get_outputs(&self) -> Result<Vec<Value>> {
        let program = Arc::clone(&self.program);
        let record = program.record_at(self.index);
        let mut outputs = Vec::with_capacity(record.outputs.len());
        for (slot, &id) in record.outputs.iter().enumerate() {
            if let Some(sink) = &self.output_overrides[slot] {
                outputs.push(Value::Tensor(sink.clone()));
                continue;
            }
            let info = &record.values[id];
            let bytes = self
                .read_value_bytes(record, id)
                .map_err(|err| Error::OutputRetrieval(err.to_string()))?;
            let tensor = Tensor::new(info.dtype, info.shape.clone(), bytes)
                .map_err(|err| Error::OutputRetrieval(err.to_string()))?;
            outputs.push(Value::Tensor(tensor));
        }
        self.emit(TraceEventKind::OutputFetch, "", 0, None);
        Ok(outputs)
    }

    /// Rebind the planned output slot at `index` to write into the supplied
    /// tensor's storage instead of the method's own planned buffer.
    ///
    /// The tensor's storage must stay valid through the next run; cloned
    /// tensors share storage, so holding any clone suffices.
    pub fn set_output_data_ptr(&mut self, tensor: &Tensor, index: usize) -> Result<()> {
        let spec = self.meta.outputs.get(index).ok_or_else(|| {
            Error::OutputRetrieval(format!(
                "output index {} out of range ({} declared)",
                index,
                self.meta.num_outputs()
            ))
        })?;
        if tensor.dtype() != spec.dtype {
            return Err(Error::OutputRetrieval(format!(
                "output {} dtype mismatch: declared {:?}, got {:?}",
                index,
                spec.dtype,
                tensor.dtype()
            )));
        }
        if tensor.nbytes() != spec.nbytes() {
            return Err(Error::OutputRetrieval(format!(
                "output {} byte length mismatch: declared {}, got {}",
                index,
                spec.nbytes(),
                tensor.nbytes()
            )));
        }
        let record = self.program.record_at(self.index);
        let id = record.outputs[index];
        if !matches!(record.values[id].location, ValueLocation::Planned { .. }) {
            return Err(Error::OutputRetrieval(format!(
                "output {} is not backed by planned memory",
                index
            )));
        }
        self.output_overrides[index] = Some(tensor.clone());
        Ok(())
    }

    fn read_value_bytes(&self, record: &MethodRecord, id: usize) -> Result<Vec<u8>> {
        // an overridden output reads and writes external storage
        if let Some(slot) = self.output_slots[id] {
            if let Some(sink) = &self.output_overrides[slot] {
                return Ok(sink.raw_bytes());
            }
        }
        let info = &record.values[id];
        match &info.location {
            ValueLocation::Input(slot) => match &self.inputs[*slot] {
                Some(Value::Tensor(tensor)) => Ok(tensor.raw_bytes()),
                Some(other) => Err(Error::Execution(format!(
                    "input slot {} holds a {}, expected tensor",
                    slot,
                    other.kind()
                ))),
                None => Err(Error::Execution(format!("input slot {} is not bound", slot))),
            },
            ValueLocation::Constant { .. } => match &self.constants[id] {
                Some(bytes) => Ok(bytes.clone()),
                None => Err(Error::Execution(format!("constant value {} not staged", id))),
            },
            ValueLocation::Planned { buffer, offset } => Ok(self
                .memory
                .planned()
                .region(*buffer, *offset, info.nbytes())?
                .to_vec()),
        }
    }

    fn write_value_bytes(&mut self, record: &MethodRecord, id: usize, bytes: &[u8]) -> Result<()> {
        if let Some(slot) = self.output_slots[id] {
            if let Some(sink) = &self.output_overrides[slot] {
                return sink.copy_from_bytes(bytes);
            }
        }
        match &record.values[id].location {
            ValueLocation::Planned { buffer, offset } => {
                let region = self
                    .memory
                    .planned_mut()
                    .region_mut(*buffer, *offset, bytes.len())?;
                region.copy_from_slice(bytes);
                Ok(())
            }
            ValueLocation::Input(_) | ValueLocation::Constant { .. } => Err(Error::Execution(
                format!("instruction writes to read-only value {}", id),
            )),
        }
    }

    fn emit_op(&self, opcode: OpCode, instruction_index: usize, elapsed: Duration) {
        if let Some(tracer) = &self.tracer {
            let (micros, micros_parts) = timing_parts(elapsed);
            tracer.borrow_mut().emit(&TraceEvent {
                kind: TraceEventKind::OpExecute,
                method_name: self.meta.name.clone(),
                op_name: opcode.name().to_string(),
                instruction_index,
                micros,
                micros_parts,
            });
        }
    }

    fn emit(
        &self,
        kind: TraceEventKind,
        op_name: &str,
        instruction_index: usize,
        elapsed: Option<Duration>,
    ) {
        if let Some(tracer) = &self.tracer {
            let (micros, micros_parts) = timing_parts(elapsed.unwrap_or_default());
            tracer.borrow_mut().emit(&TraceEvent {
                kind,
                method_name: self.meta.name.clone(),
                op_name: op_name.to_string(),
                instruction_index,
                micros,
                micros_parts,
            });
        }
    }
}

fn validate_bundle(record: &MethodRecord, memory: &MemoryManager) -> Result<()> {
    let planned = memory.planned();
    if planned.num_buffers() != record.buffer_sizes.len() {
        return Err(Error::MethodMaterialization(format!(
            "method {}: bundle has {} planned buffers, plan declares {}",
            record.name,
            planned.num_buffers(),
            record.buffer_sizes.len()
        )));
    }
    for (id, &size) in record.buffer_sizes.iter().enumerate() {
        if planned.buffer_size(id) != Some(size) {
            return Err(Error::MethodMaterialization(format!(
                "method {}: planned buffer {} is {:?} bytes, plan declares {}",
                record.name,
                id,
                planned.buffer_size(id),
                size
            )));
        }
    }
    for (id, value) in record.values.iter().enumerate() {
        if let ValueLocation::Planned { buffer, offset } = value.location {
            let size = record.buffer_sizes.get(buffer).copied().ok_or_else(|| {
                Error::MethodMaterialization(format!(
                    "method {}: value {} references planned buffer {} out of range",
                    record.name, id, buffer
                ))
            })?;
            let fits = offset
                .checked_add(value.nbytes())
                .map(|end| end <= size)
                .unwrap_or(false);
            if !fits {
                return Err(Error::MethodMaterialization(format!(
                    "method {}: value {} region {}+{} exceeds buffer {} of {} bytes",
                    record.name,
                    id,
                    offset,
                    value.nbytes(),
                    buffer,
                    size
                )));
            }
        }
    }
    Ok(())
}
