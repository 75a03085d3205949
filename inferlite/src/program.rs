use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::loader::DataLoader;
use crate::memory::MemoryManager;
use crate::method::Method;
use crate::ops::OpCode;
use crate::tensor::DType;
use crate::trace::SharedTracer;

pub(crate) const MAGIC: &[u8; 4] = b"ILP\0";
pub(crate) const VERSION: u32 = 1;
pub(crate) const HEADER_SIZE: usize = 40;

/// Strictness applied while parsing a serialized program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Verification {
    /// Header and structural checks only.
    #[default]
    Minimal,
    /// Additionally cross-validate every method's value table, plan
    /// references, constant ranges, and instruction operands.
    InternalConsistency,
}

/// Dtype and shape of one declared method input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueSpec {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl ValueSpec {
    pub fn nbytes(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.size_of()
    }
}

/// Read-only per-method descriptor: planned buffer sizes and arities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodMeta {
    pub name: String,
    pub planned_buffer_sizes: Vec<usize>,
    pub inputs: Vec<ValueSpec>,
    pub outputs: Vec<ValueSpec>,
}

impl MethodMeta {
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn num_planned_buffers(&self) -> usize {
        self.planned_buffer_sizes.len()
    }

    pub fn planned_buffer_size(&self, index: usize) -> Result<usize> {
        self.planned_buffer_sizes.get(index).copied().ok_or_else(|| {
            Error::Metadata(format!(
                "planned buffer index {} out of range ({} declared)",
                index,
                self.planned_buffer_sizes.len()
            ))
        })
    }
}

/// Where a method value's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ValueLocation {
    /// Bound from the caller-supplied input at this ordinal slot.
    Input(usize),
    /// Fixed bytes in the program's constant section.
    Constant { offset: usize, nbytes: usize },
    /// A region of one planned buffer.
    Planned { buffer: usize, offset: usize },
}

#[derive(Debug, Clone)]
pub(crate) struct ValueInfo {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub location: ValueLocation,
}

impl ValueInfo {
    pub fn nbytes(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.size_of()
    }

    pub fn spec(&self) -> ValueSpec {
        ValueSpec {
            dtype: self.dtype,
            shape: self.shape.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Instruction {
    pub opcode: OpCode,
    pub args: Vec<usize>,
    pub out: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct MethodRecord {
    pub name: String,
    pub buffer_sizes: Vec<usize>,
    /// Value ids of the declared inputs, in ordinal order.
    pub inputs: Vec<usize>,
    /// Value ids of the declared outputs, in ordinal order.
    pub outputs: Vec<usize>,
    pub values: Vec<ValueInfo>,
    pub instructions: Vec<Instruction>,
}

impl MethodRecord {
    pub fn meta(&self) -> MethodMeta {
        MethodMeta {
            name: self.name.clone(),
            planned_buffer_sizes: self.buffer_sizes.clone(),
            inputs: self.inputs.iter().map(|&id| self.values[id].spec()).collect(),
            outputs: self
                .outputs
                .iter()
                .map(|&id| self.values[id].spec())
                .collect(),
        }
    }
}

pub(crate) struct ParsedTables {
    pub methods: Vec<MethodRecord>,
    pub by_name: HashMap<String, usize>,
}

/// Immutable parsed representation of one or more compiled methods.
///
/// Owns the storage accessor it was parsed from, so compiled data referring
/// to accessor-provided regions stays valid for the program's whole life.
#[derive(Debug)]
pub struct Program {
    source: Box<dyn DataLoader>,
    methods: Vec<MethodRecord>,
    by_name: HashMap<String, usize>,
}

impl Program {
    /// Parse a program from a storage accessor, absorbing the accessor.
    pub fn load(source: Box<dyn DataLoader>, verification: Verification) -> Result<Self> {
        let tables = parse_tables(source.bytes(), verification)?;
        Ok(Self::from_parts(source, tables))
    }

    pub(crate) fn from_parts(source: Box<dyn DataLoader>, tables: ParsedTables) -> Self {
        Self {
            source,
            methods: tables.methods,
            by_name: tables.by_name,
        }
    }

    pub fn num_methods(&self) -> usize {
        self.methods.len()
    }

    pub fn method_name(&self, index: usize) -> Result<&str> {
        self.methods
            .get(index)
            .map(|record| record.name.as_str())
            .ok_or_else(|| {
                Error::Metadata(format!(
                    "method index {} out of range ({} methods)",
                    index,
                    self.methods.len()
                ))
            })
    }

    pub fn method_meta(&self, name: &str) -> Result<MethodMeta> {
        self.record(name).map(|(_, record)| record.meta())
    }

    /// Materialize an executable method bound to the given allocator bundle.
    pub fn materialize(
        self: &Arc<Self>,
        name: &str,
        memory: MemoryManager,
        tracer: Option<SharedTracer>,
    ) -> Result<Method> {
        let (index, _) = self.record(name)?;
        Method::materialize(Arc::clone(self), index, memory, tracer)
    }

    pub(crate) fn record(&self, name: &str) -> Result<(usize, &MethodRecord)> {
        let index = *self
            .by_name
            .get(name)
            .ok_or_else(|| Error::MethodNotFound(name.to_string()))?;
        Ok((index, &self.methods[index]))
    }

    pub(crate) fn record_at(&self, index: usize) -> &MethodRecord {
        &self.methods[index]
    }

    pub(crate) fn constant_bytes(&self, offset: usize, nbytes: usize) -> Result<&[u8]> {
        let data = self.source.bytes();
        let end = offset
            .checked_add(nbytes)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| {
                Error::Execution(format!(
                    "constant range {}+{} out of bounds ({} bytes)",
                    offset,
                    nbytes,
                    data.len()
                ))
            })?;
        Ok(&data[offset..end])
    }
}

pub(crate) fn parse_tables(data: &[u8], verification: Verification) -> Result<ParsedTables> {
    if data.len() < HEADER_SIZE {
        return Err(Error::ProgramParse("file too small for header".to_string()));
    }

    let mut cursor = 0usize;
    let magic = read_bytes(data, &mut cursor, 4)?;
    if magic != MAGIC {
        return Err(Error::ProgramParse("invalid magic".to_string()));
    }
    let version = read_u32(data, &mut cursor)?;
    if version != VERSION {
        return Err(Error::ProgramParse(format!(
            "unsupported version {}",
            version
        )));
    }
    let n_methods = read_u32(data, &mut cursor)? as usize;
    let _reserved = read_u32(data, &mut cursor)?;
    let offset_methods = read_u64_usize(data, &mut cursor)?;
    let offset_constants = read_u64_usize(data, &mut cursor)?;
    let file_size = read_u64_usize(data, &mut cursor)?;

    if file_size != data.len() {
        return Err(Error::ProgramParse(format!(
            "file size mismatch: header says {}, got {}",
            file_size,
            data.len()
        )));
    }
    if offset_methods < HEADER_SIZE
        || offset_methods > offset_constants
        || offset_constants > file_size
    {
        return Err(Error::ProgramParse("section offsets are not ascending".to_string()));
    }
    if offset_methods % 8 != 0 || offset_constants % 8 != 0 {
        return Err(Error::ProgramParse("section offset not aligned".to_string()));
    }

    // the smallest method record is an empty padded name plus the count row
    check_count(n_methods, 32, offset_constants - offset_methods, "method")?;

    let mut methods = Vec::with_capacity(n_methods);
    let mut by_name = HashMap::with_capacity(n_methods);
    let mut cursor = offset_methods;
    for _ in 0..n_methods {
        let record = parse_method(data, &mut cursor)?;
        if by_name.contains_key(&record.name) {
            return Err(Error::ProgramParse(format!(
                "duplicate method name {}",
                record.name
            )));
        }
        if verification == Verification::InternalConsistency {
            validate_method(&record, offset_constants, file_size)?;
        }
        by_name.insert(record.name.clone(), methods.len());
        methods.push(record);
    }
    if cursor > offset_constants {
        return Err(Error::ProgramParse(
            "method section overruns constant section".to_string(),
        ));
    }

    Ok(ParsedTables { methods, by_name })
}

fn parse_method(data: &[u8], cursor: &mut usize) -> Result<MethodRecord> {
    let name = read_string(data, cursor)?;
    let n_inputs = read_u32(data, cursor)? as usize;
    let n_outputs = read_u32(data, cursor)? as usize;
    let n_buffers = read_u32(data, cursor)? as usize;
    let n_values = read_u32(data, cursor)? as usize;
    let n_instructions = read_u32(data, cursor)? as usize;
    let _reserved = read_u32(data, cursor)?;

    // counts come from the wire; bound each against the bytes left before
    // reserving anything
    let remaining = data.len() - *cursor;
    check_count(n_buffers, 8, remaining, "planned buffer")?;
    check_count(n_inputs, 4, remaining, "input")?;
    check_count(n_outputs, 4, remaining, "output")?;
    check_count(n_values, 32, remaining, "value")?;
    check_count(n_instructions, 12, remaining, "instruction")?;

    let mut buffer_sizes = Vec::with_capacity(n_buffers);
    for _ in 0..n_buffers {
        buffer_sizes.push(read_u64_usize(data, cursor)?);
    }

    let inputs = read_id_list(data, cursor, n_inputs)?;
    let outputs = read_id_list(data, cursor, n_outputs)?;

    let mut values = Vec::with_capacity(n_values);
    for _ in 0..n_values {
        let dtype = DType::from_code(read_u32(data, cursor)?)?;
        let location_code = read_u32(data, cursor)?;
        let arg0 = read_u64_usize(data, cursor)?;
        let arg1 = read_u64_usize(data, cursor)?;
        let ndim = read_u32(data, cursor)? as usize;
        let _reserved = read_u32(data, cursor)?;
        check_count(ndim, 8, data.len() - *cursor, "dimension")?;
        let mut shape = Vec::with_capacity(ndim);
        let mut numel = 1usize;
        for _ in 0..ndim {
            let dim = read_u64_usize(data, cursor)?;
            numel = numel.checked_mul(dim).ok_or_else(|| {
                Error::ProgramParse("value shape overflows".to_string())
            })?;
            shape.push(dim);
        }
        let location = match location_code {
            0 => ValueLocation::Input(arg0),
            1 => ValueLocation::Constant {
                offset: arg0,
                nbytes: arg1,
            },
            2 => ValueLocation::Planned {
                buffer: arg0,
                offset: arg1,
            },
            other => {
                return Err(Error::ProgramParse(format!(
                    "unknown value location code {}",
                    other
                )))
            }
        };
        values.push(ValueInfo {
            dtype,
            shape,
            location,
        });
    }

    let mut instructions = Vec::with_capacity(n_instructions);
    for _ in 0..n_instructions {
        let opcode = OpCode::from_code(read_u32(data, cursor)?)?;
        let n_args = read_u32(data, cursor)? as usize;
        let out = read_u32(data, cursor)? as usize;
        let mut args = Vec::with_capacity(n_args);
        for _ in 0..n_args {
            args.push(read_u32(data, cursor)? as usize);
        }
        if (3 + n_args) % 2 == 1 {
            let _pad = read_u32(data, cursor)?;
        }
        instructions.push(Instruction { opcode, args, out });
    }

    let record = MethodRecord {
        name,
        buffer_sizes,
        inputs,
        outputs,
        values,
        instructions,
    };
    validate_structure(&record)?;
    Ok(record)
}

/// Checks that every stored id is indexable, so later lookups cannot panic.
fn validate_structure(record: &MethodRecord) -> Result<()> {
    let n_values = record.values.len();
    let check = |id: usize, what: &str| -> Result<()> {
        if id >= n_values {
            return Err(Error::ProgramParse(format!(
                "method {}: {} references value {} out of range ({} values)",
                record.name, what, id, n_values
            )));
        }
        Ok(())
    };
    for &id in &record.inputs {
        check(id, "input list")?;
    }
    for &id in &record.outputs {
        check(id, "output list")?;
    }
    for instruction in &record.instructions {
        for &id in &instruction.args {
            check(id, "instruction operand")?;
        }
        check(instruction.out, "instruction destination")?;
    }
    for value in &record.values {
        if let ValueLocation::Input(slot) = value.location {
            if slot >= record.inputs.len() {
                return Err(Error::ProgramParse(format!(
                    "method {}: input slot {} out of range ({} declared)",
                    record.name,
                    slot,
                    record.inputs.len()
                )));
            }
        }
    }
    Ok(())
}

/// Deep cross-checks run only at `Verification::InternalConsistency`.
fn validate_method(record: &MethodRecord, offset_constants: usize, file_size: usize) -> Result<()> {
    for (slot, &id) in record.inputs.iter().enumerate() {
        if record.values[id].location != ValueLocation::Input(slot) {
            return Err(Error::ProgramParse(format!(
                "method {}: input slot {} does not map to an input value",
                record.name, slot
            )));
        }
    }
    for value in &record.values {
        match value.location {
            ValueLocation::Input(_) => {}
            ValueLocation::Constant { offset, nbytes } => {
                if nbytes != value.nbytes() {
                    return Err(Error::ProgramParse(format!(
                        "method {}: constant byte length {} does not match {:?}{:?}",
                        record.name, nbytes, value.dtype, value.shape
                    )));
                }
                let in_bounds = offset >= offset_constants
                    && offset
                        .checked_add(nbytes)
                        .map(|end| end <= file_size)
                        .unwrap_or(false);
                if !in_bounds {
                    return Err(Error::ProgramParse(format!(
                        "method {}: constant range {}+{} out of bounds",
                        record.name, offset, nbytes
                    )));
                }
            }
            ValueLocation::Planned { buffer, offset } => {
                let size = record.buffer_sizes.get(buffer).copied().ok_or_else(|| {
                    Error::ProgramParse(format!(
                        "method {}: planned buffer {} out of range ({} planned)",
                        record.name,
                        buffer,
                        record.buffer_sizes.len()
                    ))
                })?;
                let fits = offset
                    .checked_add(value.nbytes())
                    .map(|end| end <= size)
                    .unwrap_or(false);
                if !fits {
                    return Err(Error::ProgramParse(format!(
                        "method {}: planned region {}+{} exceeds buffer {} of {} bytes",
                        record.name,
                        offset,
                        value.nbytes(),
                        buffer,
                        size
                    )));
                }
            }
        }
    }
    Ok(())
}

fn check_count(count: usize, min_size: usize, remaining: usize, what: &str) -> Result<()> {
    if count
        .checked_mul(min_size)
        .map(|need| need > remaining)
        .unwrap_or(true)
    {
        return Err(Error::ProgramParse(format!(
            "{} count {} cannot fit in {} remaining bytes",
            what, count, remaining
        )));
    }
    Ok(())
}

fn read_id_list(data: &[u8], cursor: &mut usize, count: usize) -> Result<Vec<usize>> {
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(read_u32(data, cursor)? as usize);
    }
    if count % 2 == 1 {
        let _pad = read_u32(data, cursor)?;
    }
    Ok(ids)
}

fn read_bytes<'a>(data: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| Error::ProgramParse("unexpected EOF".to_string()))?;
    let out = &data[*cursor..end];
    *cursor = end;
    Ok(out)
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32> {
    let bytes = read_bytes(data, cursor, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u64_usize(data: &[u8], cursor: &mut usize) -> Result<usize> {
    let bytes = read_bytes(data, cursor, 8)?;
    let value = u64::from_le_bytes(bytes.try_into().unwrap());
    usize::try_from(value)
        .map_err(|_| Error::ProgramParse(format!("value {} does not fit in usize", value)))
}

fn read_string(data: &[u8], cursor: &mut usize) -> Result<String> {
    let len = read_u32(data, cursor)? as usize;
    let bytes = read_bytes(data, cursor, len)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| Error::ProgramParse("invalid UTF-8 string".to_string()))?
        .to_string();
    let padded = align_up(4 + len, 8);
    let consumed = 4 + len;
    if padded > consumed {
        read_bytes(data, cursor, padded - consumed)?;
    }
    Ok(s)
}

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) / alignment * alignment
}
