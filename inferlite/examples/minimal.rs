use inferlite::{
    DType, LoadMode, MlockPolicy, Module, OpCode, ProgramBuilder, Tensor, Value,
};

fn main() -> anyhow::Result<()> {
    // compile stand-in: declare forward(x) = relu(x * w) and serialize it
    let mut builder = ProgramBuilder::new();
    {
        let method = builder.method("forward");
        let x = method.input(DType::F32, &[4]);
        let w = method.constant(&[2.0f32, 2.0, 2.0, 2.0], &[4]);
        let scaled = method.planned(DType::F32, &[4]);
        let y = method.planned(DType::F32, &[4]);
        method.op(OpCode::Mul, &[x, w], scaled);
        method.op(OpCode::Relu, &[scaled], y);
        method.output(y);
    }
    let path = std::env::temp_dir().join("inferlite-minimal.ilp");
    std::fs::write(&path, builder.build())?;

    let mut module = Module::from_file(
        &path,
        LoadMode::Mmap {
            mlock: MlockPolicy::None,
        },
        None,
    );
    println!("methods: {:?}", module.method_names()?);

    let input = Tensor::from_slice(&[-1.0f32, 0.5, 2.0, -3.0], &[4])?;
    let outputs = module.execute("forward", &[Value::Tensor(input)])?;
    for (index, output) in outputs.iter().enumerate() {
        if let Value::Tensor(tensor) = output {
            println!("output {}: {:?}", index, tensor.to_vec::<f32>()?);
        }
    }
    Ok(())
}
