use crate::ops::OpCode;
use crate::program::{align_up, HEADER_SIZE, MAGIC, VERSION};
use crate::tensor::{DType, TensorElement};

#[derive(Debug, Clone)]
enum LocationDecl {
    Input(usize),
    Constant(Vec<u8>),
    Planned { buffer: usize, offset: usize },
}

#[derive(Debug, Clone)]
struct ValueDecl {
    dtype: DType,
    shape: Vec<usize>,
    location: LocationDecl,
}

impl ValueDecl {
    fn nbytes(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.size_of()
    }
}

#[derive(Debug, Clone)]
struct InstrDecl {
    opcode: OpCode,
    args: Vec<usize>,
    out: usize,
}

/// Declares one method of a program under construction.
#[derive(Debug)]
pub struct MethodBuilder {
    name: String,
    buffer_sizes: Vec<usize>,
    values: Vec<ValueDecl>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    instructions: Vec<InstrDecl>,
}

impl MethodBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            buffer_sizes: Vec::new(),
            values: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            instructions: Vec::new(),
        }
    }

    /// Declare the next ordinal input. Returns its value id.
    pub fn input(&mut self, dtype: DType, shape: &[usize]) -> usize {
        let slot = self.inputs.len();
        let id = self.push_value(dtype, shape, LocationDecl::Input(slot));
        self.inputs.push(id);
        id
    }

    /// Declare a constant value baked into the program. Returns its value id.
    pub fn constant<T: TensorElement>(&mut self, values: &[T], shape: &[usize]) -> usize {
        let bytes = bytemuck::cast_slice(values).to_vec();
        self.push_value(T::DTYPE, shape, LocationDecl::Constant(bytes))
    }

    /// Declare a value backed by a fresh planned buffer sized to fit it.
    pub fn planned(&mut self, dtype: DType, shape: &[usize]) -> usize {
        let nbytes = shape.iter().product::<usize>() * dtype.size_of();
        let buffer = self.buffer(nbytes);
        self.planned_in(dtype, shape, buffer, 0)
    }

    /// Declare a value at a fixed offset of an existing planned buffer.
    pub fn planned_in(
        &mut self,
        dtype: DType,
        shape: &[usize],
        buffer: usize,
        offset: usize,
    ) -> usize {
        self.push_value(dtype, shape, LocationDecl::Planned { buffer, offset })
    }

    /// Add a raw plan entry of `nbytes` bytes. Returns its plan id.
    pub fn buffer(&mut self, nbytes: usize) -> usize {
        let id = self.buffer_sizes.len();
        self.buffer_sizes.push(nbytes);
        id
    }

    /// Mark a value as the next ordinal output.
    pub fn output(&mut self, value: usize) {
        self.outputs.push(value);
    }

    /// Append an instruction writing to the `out` value.
    pub fn op(&mut self, opcode: OpCode, args: &[usize], out: usize) {
        self.instructions.push(InstrDecl {
            opcode,
            args: args.to_vec(),
            out,
        });
    }

    fn push_value(&mut self, dtype: DType, shape: &[usize], location: LocationDecl) -> usize {
        let id = self.values.len();
        self.values.push(ValueDecl {
            dtype,
            shape: shape.to_vec(),
            location,
        });
        id
    }
}

/// Serializes programs into the binary container consumed by
/// [`Program::load`](crate::Program::load).
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    methods: Vec<MethodBuilder>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new method declaration.
    pub fn method(&mut self, name: &str) -> &mut MethodBuilder {
        let index = self.methods.len();
        self.methods.push(MethodBuilder::new(name));
        &mut self.methods[index]
    }

    /// Serialize the container.
    pub fn build(&self) -> Vec<u8> {
        // constant offsets depend on the method section length, which does
        // not depend on the offset values; size with a dry run first
        let (dry, _) = self.serialize_methods(0);
        let offset_constants = HEADER_SIZE + dry.len();
        let (method_bytes, constants) = self.serialize_methods(offset_constants);
        let file_size = offset_constants + constants.len();

        let mut out = Vec::with_capacity(file_size);
        out.extend_from_slice(MAGIC);
        write_u32(&mut out, VERSION);
        write_u32(&mut out, self.methods.len() as u32);
        write_u32(&mut out, 0);
        write_u64(&mut out, HEADER_SIZE as u64);
        write_u64(&mut out, offset_constants as u64);
        write_u64(&mut out, file_size as u64);
        out.extend_from_slice(&method_bytes);
        out.extend_from_slice(&constants);
        out
    }

    fn serialize_methods(&self, const_base: usize) -> (Vec<u8>, Vec<u8>) {
        let mut out = Vec::new();
        let mut constants = Vec::new();
        for method in &self.methods {
            write_string(&mut out, &method.name);
            write_u32(&mut out, method.inputs.len() as u32);
            write_u32(&mut out, method.outputs.len() as u32);
            write_u32(&mut out, method.buffer_sizes.len() as u32);
            write_u32(&mut out, method.values.len() as u32);
            write_u32(&mut out, method.instructions.len() as u32);
            write_u32(&mut out, 0);

            for &size in &method.buffer_sizes {
                write_u64(&mut out, size as u64);
            }
            write_id_list(&mut out, &method.inputs);
            write_id_list(&mut out, &method.outputs);

            for value in &method.values {
                let (location_code, arg0, arg1) = match &value.location {
                    LocationDecl::Input(slot) => (0u32, *slot as u64, 0u64),
                    LocationDecl::Constant(bytes) => {
                        let offset = const_base + constants.len();
                        constants.extend_from_slice(bytes);
                        let padded = align_up(constants.len(), 8);
                        constants.resize(padded, 0);
                        (1u32, offset as u64, value.nbytes() as u64)
                    }
                    LocationDecl::Planned { buffer, offset } => {
                        (2u32, *buffer as u64, *offset as u64)
                    }
                };
                write_u32(&mut out, value.dtype.code());
                write_u32(&mut out, location_code);
                write_u64(&mut out, arg0);
                write_u64(&mut out, arg1);
                write_u32(&mut out, value.shape.len() as u32);
                write_u32(&mut out, 0);
                for &dim in &value.shape {
                    write_u64(&mut out, dim as u64);
                }
            }

            for instruction in &method.instructions {
                write_u32(&mut out, instruction.opcode.code());
                write_u32(&mut out, instruction.args.len() as u32);
                write_u32(&mut out, instruction.out as u32);
                for &arg in &instruction.args {
                    write_u32(&mut out, arg as u32);
                }
                if (3 + instruction.args.len()) % 2 == 1 {
                    write_u32(&mut out, 0);
                }
            }
        }
        (out, constants)
    }
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    write_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
    let padded = align_up(4 + value.len(), 8);
    for _ in 0..padded - (4 + value.len()) {
        out.push(0);
    }
}

fn write_id_list(out: &mut Vec<u8>, ids: &[usize]) {
    for &id in ids {
        write_u32(out, id as u32);
    }
    if ids.len() % 2 == 1 {
        write_u32(out, 0);
    }
}
