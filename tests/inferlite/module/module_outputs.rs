use anyhow::Result;
use inferlite::{BufferDataLoader, DType, Error, Module, Tensor, Value};

use crate::common;

#[test]
fn rebound_output_writes_into_external_storage() -> Result<()> {
    let loader = BufferDataLoader::new(common::forward_add_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let sink = Tensor::zeros(DType::F32, &[2]);
    module.set_output_data_ptr(&sink, 0)?;

    let a = Tensor::from_slice(&[1.0f32, 2.0], &[2])?;
    let b = Tensor::from_slice(&[10.0f32, 20.0], &[2])?;
    module.execute("forward", &[Value::Tensor(a), Value::Tensor(b)])?;

    // the sink was filled in place, without going through get_outputs
    assert_eq!(sink.to_vec::<f32>()?, vec![11.0, 22.0]);
    Ok(())
}

#[test]
fn rebound_output_is_returned_by_execute() -> Result<()> {
    let loader = BufferDataLoader::new(common::forward_add_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let sink = Tensor::zeros(DType::F32, &[2]);
    module.set_output_data_ptr(&sink, 0)?;

    let a = Tensor::from_slice(&[1.0f32, 1.0], &[2])?;
    let b = Tensor::from_slice(&[2.0f32, 3.0], &[2])?;
    let outputs = module.execute("forward", &[Value::Tensor(a), Value::Tensor(b)])?;
    let tensor = outputs[0].tensor().expect("tensor output");

    // the returned tensor shares the sink's storage
    assert_eq!(tensor.to_vec::<f32>()?, vec![3.0, 4.0]);
    sink.copy_from(&[0.0f32, 0.0])?;
    assert_eq!(tensor.to_vec::<f32>()?, vec![0.0, 0.0]);
    Ok(())
}

#[test]
fn rebound_output_persists_across_runs() -> Result<()> {
    let loader = BufferDataLoader::new(common::forward_add_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let sink = Tensor::zeros(DType::F32, &[2]);
    module.set_output_data_ptr(&sink, 0)?;

    let a = Tensor::from_slice(&[1.0f32, 1.0], &[2])?;
    let b = Tensor::from_slice(&[1.0f32, 2.0], &[2])?;
    module.execute("forward", &[Value::Tensor(a.clone()), Value::Tensor(b)])?;
    assert_eq!(sink.to_vec::<f32>()?, vec![2.0, 3.0]);

    let c = Tensor::from_slice(&[5.0f32, 6.0], &[2])?;
    module.execute("forward", &[Value::Tensor(a), Value::Tensor(c)])?;
    assert_eq!(sink.to_vec::<f32>()?, vec![6.0, 7.0]);
    Ok(())
}

#[test]
fn rebinding_rejects_mismatched_tensors() -> Result<()> {
    let loader = BufferDataLoader::new(common::forward_add_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let out_of_range = Tensor::zeros(DType::F32, &[2]);
    let err = module.set_output_data_ptr(&out_of_range, 1).unwrap_err();
    assert!(matches!(err, Error::OutputRetrieval(_)), "got {err}");

    let wrong_dtype = Tensor::zeros(DType::I32, &[2]);
    let err = module.set_output_data_ptr(&wrong_dtype, 0).unwrap_err();
    assert!(matches!(err, Error::OutputRetrieval(_)), "got {err}");

    let wrong_size = Tensor::zeros(DType::F32, &[3]);
    let err = module.set_output_data_ptr(&wrong_size, 0).unwrap_err();
    assert!(matches!(err, Error::OutputRetrieval(_)), "got {err}");
    Ok(())
}

#[test]
fn rebinding_without_a_forward_method_fails() {
    let loader = BufferDataLoader::new(common::identity_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let sink = Tensor::zeros(DType::F32, &[3]);
    let err = module.set_output_data_ptr(&sink, 0).unwrap_err();
    assert!(matches!(err, Error::MethodNotFound(_)), "got {err}");
}
