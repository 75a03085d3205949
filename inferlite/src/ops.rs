use crate::error::{Error, Result};
use crate::tensor::DType;

/// Compiled operator kinds understood by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Copy,
    Add,
    Mul,
    Relu,
    MatMul,
    Mean,
}

impl OpCode {
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::Copy => "copy",
            OpCode::Add => "add",
            OpCode::Mul => "mul",
            OpCode::Relu => "relu",
            OpCode::MatMul => "matmul",
            OpCode::Mean => "mean",
        }
    }

    pub(crate) fn code(&self) -> u32 {
        match self {
            OpCode::Copy => 0,
            OpCode::Add => 1,
            OpCode::Mul => 2,
            OpCode::Relu => 3,
            OpCode::MatMul => 4,
            OpCode::Mean => 5,
        }
    }

    pub(crate) fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            0 => OpCode::Copy,
            1 => OpCode::Add,
            2 => OpCode::Mul,
            3 => OpCode::Relu,
            4 => OpCode::MatMul,
            5 => OpCode::Mean,
            _ => return Err(Error::ProgramParse(format!("unknown opcode {}", code))),
        })
    }
}

/// One staged operand for a kernel invocation.
pub(crate) struct OpArg<'a> {
    pub dtype: DType,
    pub shape: &'a [usize],
    pub bytes: &'a [u8],
}

/// Run one instruction, writing the result bytes into `out`.
pub(crate) fn run_op(
    op: OpCode,
    args: &[OpArg<'_>],
    out_dtype: DType,
    out_shape: &[usize],
    out: &mut [u8],
) -> Result<()> {
    match op {
        OpCode::Copy => {
            let arg = expect_args::<1>(op, args)?;
            if arg[0].dtype != out_dtype || arg[0].bytes.len() != out.len() {
                return Err(Error::Execution(format!(
                    "copy source {:?} ({} bytes) does not match destination {:?} ({} bytes)",
                    arg[0].dtype,
                    arg[0].bytes.len(),
                    out_dtype,
                    out.len()
                )));
            }
            out.copy_from_slice(arg[0].bytes);
            Ok(())
        }
        OpCode::Add | OpCode::Mul => {
            let arg = expect_args::<2>(op, args)?;
            let a = as_f32(&arg[0])?;
            let b = as_f32(&arg[1])?;
            if arg[0].shape != out_shape || arg[1].shape != out_shape {
                return Err(Error::Execution(format!(
                    "{} shapes {:?}, {:?} do not match output {:?}",
                    op.name(),
                    arg[0].shape,
                    arg[1].shape,
                    out_shape
                )));
            }
            let result: Vec<f32> = match op {
                OpCode::Add => a.iter().zip(b.iter()).map(|(x, y)| x + y).collect(),
                _ => a.iter().zip(b.iter()).map(|(x, y)| x * y).collect(),
            };
            write_f32(op, out_dtype, &result, out)
        }
        OpCode::Relu => {
            let arg = expect_args::<1>(op, args)?;
            if arg[0].shape != out_shape {
                return Err(Error::Execution(format!(
                    "relu shape {:?} does not match output {:?}",
                    arg[0].shape, out_shape
                )));
            }
            let a = as_f32(&arg[0])?;
            let result: Vec<f32> = a.iter().map(|x| x.max(0.0)).collect();
            write_f32(op, out_dtype, &result, out)
        }
        OpCode::MatMul => {
            let arg = expect_args::<2>(op, args)?;
            let a = as_f32(&arg[0])?;
            let b = as_f32(&arg[1])?;
            let (m, k) = matrix_dims(op, arg[0].shape)?;
            let (k2, n) = matrix_dims(op, arg[1].shape)?;
            if k != k2 {
                return Err(Error::Execution(format!(
                    "matmul inner dimensions do not agree: {:?} x {:?}",
                    arg[0].shape, arg[1].shape
                )));
            }
            if out_shape != [m, n] {
                return Err(Error::Execution(format!(
                    "matmul output shape {:?} does not match [{}, {}]",
                    out_shape, m, n
                )));
            }
            let mut result = vec![0.0f32; m * n];
            for row in 0..m {
                for col in 0..n {
                    let mut acc = 0.0f32;
                    for inner in 0..k {
                        acc += a[row * k + inner] * b[inner * n + col];
                    }
                    result[row * n + col] = acc;
                }
            }
            write_f32(op, out_dtype, &result, out)
        }
        OpCode::Mean => {
            let arg = expect_args::<1>(op, args)?;
            let (last, outer) = match arg[0].shape.split_last() {
                Some((&last, outer)) if last > 0 => (last, outer),
                _ => {
                    return Err(Error::Execution(format!(
                        "mean needs a non-empty trailing axis, got {:?}",
                        arg[0].shape
                    )))
                }
            };
            if out_shape != outer {
                return Err(Error::Execution(format!(
                    "mean output shape {:?} does not match {:?}",
                    out_shape, outer
                )));
            }
            let a = as_f32(&arg[0])?;
            let mut result = Vec::with_capacity(a.len() / last);
            for row in a.chunks_exact(last) {
                result.push(row.iter().sum::<f32>() / last as f32);
            }
            write_f32(op, out_dtype, &result, out)
        }
    }
}

fn expect_args<'a, const N: usize>(
    op: OpCode,
    args: &'a [OpArg<'a>],
) -> Result<&'a [OpArg<'a>; N]> {
    args.try_into().map_err(|_| {
        Error::Execution(format!(
            "{} expects {} operands, got {}",
            op.name(),
            N,
            args.len()
        ))
    })
}

fn as_f32(arg: &OpArg<'_>) -> Result<Vec<f32>> {
    if arg.dtype != DType::F32 {
        return Err(Error::Execution(format!(
            "kernel supports f32 operands only, got {:?}",
            arg.dtype
        )));
    }
    Ok(bytemuck::pod_collect_to_vec(arg.bytes))
}

fn write_f32(op: OpCode, out_dtype: DType, values: &[f32], out: &mut [u8]) -> Result<()> {
    if out_dtype != DType::F32 {
        return Err(Error::Execution(format!(
            "{} produces f32, destination is {:?}",
            op.name(),
            out_dtype
        )));
    }
    let bytes: &[u8] = bytemuck::cast_slice(values);
    if bytes.len() != out.len() {
        return Err(Error::Execution(format!(
            "{} result is {} bytes, destination holds {}",
            op.name(),
            bytes.len(),
            out.len()
        )));
    }
    out.copy_from_slice(bytes);
    Ok(())
}

fn matrix_dims(op: OpCode, shape: &[usize]) -> Result<(usize, usize)> {
    match shape {
        [rows, cols] => Ok((*rows, *cols)),
        _ => Err(Error::Execution(format!(
            "{} operand must be rank 2, got {:?}",
            op.name(),
            shape
        ))),
    }
}
