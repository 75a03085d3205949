use std::cell::RefCell;
use std::rc::Rc;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    U8,
    I32,
    I64,
    F32,
    F64,
    Bool,
}

impl DType {
    /// Size in bytes of one element.
    pub fn size_of(&self) -> usize {
        match self {
            DType::U8 | DType::Bool => 1,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    pub(crate) fn code(&self) -> u32 {
        match self {
            DType::U8 => 1,
            DType::I32 => 2,
            DType::I64 => 3,
            DType::F32 => 4,
            DType::F64 => 5,
            DType::Bool => 6,
        }
    }

    pub(crate) fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            1 => DType::U8,
            2 => DType::I32,
            3 => DType::I64,
            4 => DType::F32,
            5 => DType::F64,
            6 => DType::Bool,
            _ => return Err(Error::ProgramParse(format!("unknown dtype code {}", code))),
        })
    }
}

/// Rust element types that map onto a [`DType`].
pub trait TensorElement: Pod {
    const DTYPE: DType;
}

impl TensorElement for u8 {
    const DTYPE: DType = DType::U8;
}
impl TensorElement for i32 {
    const DTYPE: DType = DType::I32;
}
impl TensorElement for i64 {
    const DTYPE: DType = DType::I64;
}
impl TensorElement for f32 {
    const DTYPE: DType = DType::F32;
}
impl TensorElement for f64 {
    const DTYPE: DType = DType::F64;
}

/// A dense tensor with shared byte storage.
///
/// Cloning shares the underlying storage, which is what allows a method
/// output slot to be rebound to an externally held tensor and written in
/// place. The runtime is single-threaded, so storage is `Rc<RefCell<_>>`.
#[derive(Debug, Clone)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Rc<RefCell<Vec<u8>>>,
}

impl Tensor {
    /// Create a tensor from raw little-endian bytes.
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_of();
        if data.len() != expected {
            return Err(Error::Execution(format!(
                "tensor byte length mismatch: expected {} for {:?}{:?}, got {}",
                expected,
                dtype,
                shape,
                data.len()
            )));
        }
        Ok(Self {
            dtype,
            shape,
            data: Rc::new(RefCell::new(data)),
        })
    }

    /// Create a zero-filled tensor.
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        let nbytes = shape.iter().product::<usize>() * dtype.size_of();
        Self {
            dtype,
            shape: shape.to_vec(),
            data: Rc::new(RefCell::new(vec![0u8; nbytes])),
        }
    }

    /// Create a tensor from typed values.
    pub fn from_slice<T: TensorElement>(values: &[T], shape: &[usize]) -> Result<Self> {
        let numel = shape.iter().product::<usize>();
        if values.len() != numel {
            return Err(Error::Execution(format!(
                "tensor element count mismatch: shape {:?} needs {}, got {}",
                shape,
                numel,
                values.len()
            )));
        }
        Ok(Self {
            dtype: T::DTYPE,
            shape: shape.to_vec(),
            data: Rc::new(RefCell::new(bytemuck::cast_slice(values).to_vec())),
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.size_of()
    }

    /// Copy the elements out as a typed vector.
    pub fn to_vec<T: TensorElement>(&self) -> Result<Vec<T>> {
        if self.dtype != T::DTYPE {
            return Err(Error::Execution(format!(
                "tensor dtype mismatch: tensor is {:?}, requested {:?}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(&self.data.borrow()))
    }

    /// Overwrite the tensor's elements from typed values.
    pub fn copy_from<T: TensorElement>(&self, values: &[T]) -> Result<()> {
        if self.dtype != T::DTYPE {
            return Err(Error::Execution(format!(
                "tensor dtype mismatch: tensor is {:?}, supplied {:?}",
                self.dtype,
                T::DTYPE
            )));
        }
        self.copy_from_bytes(bytemuck::cast_slice(values))
    }

    pub(crate) fn raw_bytes(&self) -> Vec<u8> {
        self.data.borrow().clone()
    }

    pub(crate) fn copy_from_bytes(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.data.borrow_mut();
        if guard.len() != bytes.len() {
            return Err(Error::Execution(format!(
                "tensor byte length mismatch: storage holds {}, supplied {}",
                guard.len(),
                bytes.len()
            )));
        }
        guard.copy_from_slice(bytes);
        Ok(())
    }
}

/// A tagged runtime value used for method inputs and outputs.
#[derive(Debug, Clone)]
pub enum Value {
    Tensor(Tensor),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Value {
    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "tensor",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
        }
    }
}
