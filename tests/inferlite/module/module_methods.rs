use anyhow::Result;
use inferlite::{
    BufferDataLoader, DType, Error, Module, OpCode, ProgramBuilder, Tensor, TraceEventKind, Value,
};

use crate::common;

#[test]
fn load_method_is_idempotent_per_name() -> Result<()> {
    let (tracer, events) = common::RecordingTracer::create();
    let loader = BufferDataLoader::new(common::identity_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, Some(tracer));

    module.load_method("identity")?;
    module.load_method("identity")?;
    module.load_method("identity")?;

    let events = events.borrow();
    assert_eq!(common::count_events(&events, TraceEventKind::MethodLoad), 1);
    Ok(())
}

#[test]
fn unknown_method_fails_without_creating_a_holder() -> Result<()> {
    let loader = BufferDataLoader::new(common::identity_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let err = module.execute("missing", &[]).unwrap_err();
    assert!(matches!(err, Error::MethodNotFound(_)), "got {err}");
    assert!(!module.is_method_loaded("missing"));

    let err = module.load_method("missing").unwrap_err();
    assert!(matches!(err, Error::MethodNotFound(_)), "got {err}");
    assert!(!module.is_method_loaded("missing"));
    Ok(())
}

#[test]
fn method_meta_forces_the_method_loaded() -> Result<()> {
    let loader = BufferDataLoader::new(common::forward_add_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);
    assert!(!module.is_method_loaded("forward"));

    let meta = module.method_meta("forward")?;
    assert!(module.is_method_loaded("forward"));
    assert_eq!(meta.name, "forward");
    assert_eq!(meta.num_inputs(), 2);
    assert_eq!(meta.num_outputs(), 1);
    assert_eq!(meta.inputs[0].dtype, DType::F32);
    assert_eq!(meta.inputs[0].shape, vec![2]);
    Ok(())
}

#[test]
fn failed_load_method_leaves_no_entry() -> Result<()> {
    let loader = BufferDataLoader::new(common::bad_plan_program());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let err = module.load_method("identity").unwrap_err();
    assert!(matches!(err, Error::MethodMaterialization(_)), "got {err}");
    assert!(!module.is_method_loaded("identity"));

    // with the plan defect fixed, the same name loads and runs
    let loader = BufferDataLoader::new(common::identity_program());
    let mut fixed = Module::from_loader(Box::new(loader), None, None, None);
    fixed.load_method("identity")?;
    assert!(fixed.is_method_loaded("identity"));

    let input = Tensor::from_slice(&[9.0f32, 8.0, 7.0], &[3])?;
    let outputs = fixed.execute("identity", &[Value::Tensor(input)])?;
    let tensor = outputs[0].tensor().expect("tensor output");
    assert_eq!(tensor.to_vec::<f32>()?, vec![9.0, 8.0, 7.0]);
    Ok(())
}

#[test]
fn method_names_lists_every_method() -> Result<()> {
    let mut builder = ProgramBuilder::new();
    {
        let method = builder.method("encode");
        let x = method.input(DType::F32, &[2]);
        let y = method.planned(DType::F32, &[2]);
        method.op(OpCode::Copy, &[x], y);
        method.output(y);
    }
    {
        let method = builder.method("decode");
        let x = method.input(DType::F32, &[2]);
        let y = method.planned(DType::F32, &[2]);
        method.op(OpCode::Relu, &[x], y);
        method.output(y);
    }
    let loader = BufferDataLoader::new(builder.build());
    let mut module = Module::from_loader(Box::new(loader), None, None, None);

    let names = module.method_names()?;
    assert_eq!(names.len(), 2);
    assert!(names.contains("encode"));
    assert!(names.contains("decode"));
    Ok(())
}
