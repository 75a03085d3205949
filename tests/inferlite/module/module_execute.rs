use std::sync::Arc;

use anyhow::Result;
use inferlite::{
    BufferDataLoader, DType, Error, HierarchicalAllocator, MallocAllocator, MemoryManager,
    Module, OpCode, Program, ProgramBuilder, Tensor, Value, Verification,
};

use crate::common;

#[test]
fn identity_method_returns_its_input() -> Result<()> {
    let loader = BufferDataLoader::new(common::identity_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let names = module.method_names()?;
    assert!(names.contains("identity"));

    let input = Tensor::from_slice(&[1.0f32, 2.0, 3.0], &[3])?;
    let outputs = module.execute("identity", &[Value::Tensor(input)])?;
    assert_eq!(outputs.len(), 1);
    let tensor = outputs[0].tensor().expect("tensor output");
    assert_eq!(tensor.shape(), &[3]);
    assert_eq!(tensor.to_vec::<f32>()?, vec![1.0, 2.0, 3.0]);
    Ok(())
}

#[test]
fn forward_adds_two_inputs() -> Result<()> {
    let loader = BufferDataLoader::new(common::forward_add_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let a = Tensor::from_slice(&[1.5f32, -2.0], &[2])?;
    let b = Tensor::from_slice(&[0.5f32, 2.0], &[2])?;
    let outputs = module.execute("forward", &[Value::Tensor(a), Value::Tensor(b)])?;
    let tensor = outputs[0].tensor().expect("tensor output");
    assert_eq!(tensor.to_vec::<f32>()?, vec![2.0, 0.0]);
    Ok(())
}

#[test]
fn input_arity_mismatch_is_a_binding_error() -> Result<()> {
    let loader = BufferDataLoader::new(common::forward_add_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);
    let a = Tensor::from_slice(&[1.0f32, 2.0], &[2])?;

    let err = module
        .execute("forward", &[Value::Tensor(a.clone())])
        .unwrap_err();
    assert!(matches!(err, Error::InputBinding(_)), "got {err}");

    let err = module
        .execute(
            "forward",
            &[
                Value::Tensor(a.clone()),
                Value::Tensor(a.clone()),
                Value::Tensor(a),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, Error::InputBinding(_)), "got {err}");
    Ok(())
}

#[test]
fn input_type_mismatches_are_binding_errors() -> Result<()> {
    let loader = BufferDataLoader::new(common::identity_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let wrong_dtype = Tensor::from_slice(&[1i32, 2, 3], &[3])?;
    let err = module
        .execute("identity", &[Value::Tensor(wrong_dtype)])
        .unwrap_err();
    assert!(matches!(err, Error::InputBinding(_)), "got {err}");

    let wrong_shape = Tensor::from_slice(&[1.0f32, 2.0], &[2])?;
    let err = module
        .execute("identity", &[Value::Tensor(wrong_shape)])
        .unwrap_err();
    assert!(matches!(err, Error::InputBinding(_)), "got {err}");

    let err = module.execute("identity", &[Value::Int(7)]).unwrap_err();
    assert!(matches!(err, Error::InputBinding(_)), "got {err}");
    Ok(())
}

#[test]
fn outputs_are_fresh_per_call() -> Result<()> {
    let loader = BufferDataLoader::new(common::identity_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let input = Tensor::from_slice(&[1.0f32, 2.0, 3.0], &[3])?;
    let first = module.execute("identity", &[Value::Tensor(input.clone())])?;
    let first_tensor = first[0].tensor().expect("tensor output");
    first_tensor.copy_from(&[0.0f32, 0.0, 0.0])?;

    let second = module.execute("identity", &[Value::Tensor(input)])?;
    let second_tensor = second[0].tensor().expect("tensor output");
    assert_eq!(second_tensor.to_vec::<f32>()?, vec![1.0, 2.0, 3.0]);
    Ok(())
}

#[test]
fn matmul_pipeline_runs_to_completion() -> Result<()> {
    let mut builder = ProgramBuilder::new();
    {
        let method = builder.method("project");
        let x = method.input(DType::F32, &[2, 3]);
        let w = method.constant(&[1.0f32, 1.0, 1.0], &[3, 1]);
        let y = method.planned(DType::F32, &[2, 1]);
        method.op(OpCode::MatMul, &[x, w], y);
        method.output(y);
    }
    let loader = BufferDataLoader::new(builder.build());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let input = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])?;
    let outputs = module.execute("project", &[Value::Tensor(input)])?;
    let tensor = outputs[0].tensor().expect("tensor output");
    assert_eq!(tensor.shape(), &[2, 1]);
    assert_eq!(tensor.to_vec::<f32>()?, vec![6.0, 15.0]);
    Ok(())
}

#[test]
fn mean_reduces_the_trailing_axis() -> Result<()> {
    let mut builder = ProgramBuilder::new();
    {
        let method = builder.method("stats");
        let x = method.input(DType::F32, &[2, 3]);
        let y = method.planned(DType::F32, &[2]);
        method.op(OpCode::Mean, &[x], y);
        method.output(y);
    }
    let loader = BufferDataLoader::new(builder.build());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let input = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])?;
    let outputs = module.execute("stats", &[Value::Tensor(input)])?;
    let tensor = outputs[0].tensor().expect("tensor output");
    assert_eq!(tensor.shape(), &[2]);
    assert_eq!(tensor.to_vec::<f32>()?, vec![2.0, 5.0]);
    Ok(())
}

#[test]
fn earlier_bindings_survive_a_mid_bind_failure() -> Result<()> {
    let program = Arc::new(Program::load(
        Box::new(BufferDataLoader::new(common::forward_add_program())),
        Verification::default(),
    )?);
    let meta = program.method_meta("forward")?;
    let buffers = meta
        .planned_buffer_sizes
        .iter()
        .map(|&size| vec![0u8; size])
        .collect();
    let memory = MemoryManager::new(
        MallocAllocator::shared(),
        HierarchicalAllocator::new(buffers),
        MallocAllocator::shared(),
    );
    let mut method = program.materialize("forward", memory, None)?;

    let a = Tensor::from_slice(&[1.0f32, 2.0], &[2])?;
    method.set_input(0, &Value::Tensor(a))?;
    let wrong = Tensor::from_slice(&[1i32, 2], &[2])?;
    let err = method.set_input(1, &Value::Tensor(wrong)).unwrap_err();
    assert!(matches!(err, Error::InputBinding(_)), "got {err}");

    // slot 0 stayed bound: rebinding only slot 1 completes the run
    let b = Tensor::from_slice(&[3.0f32, 4.0], &[2])?;
    method.set_input(1, &Value::Tensor(b))?;
    method.execute()?;
    let outputs = method.get_outputs()?;
    let tensor = outputs[0].tensor().expect("tensor output");
    assert_eq!(tensor.to_vec::<f32>()?, vec![4.0, 6.0]);
    Ok(())
}

#[test]
fn constants_feed_execution() -> Result<()> {
    let loader = BufferDataLoader::new(common::forward_scale_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let input = Tensor::from_slice(&[1.0f32, -2.0, 3.0, -4.0], &[4])?;
    let outputs = module.execute("forward", &[Value::Tensor(input)])?;
    let tensor = outputs[0].tensor().expect("tensor output");
    assert_eq!(tensor.to_vec::<f32>()?, vec![2.0, -4.0, 6.0, -8.0]);
    Ok(())
}
