// Demo: Z = X * W + B on a lattice graph
//
// Part 1 builds the graph once, binds four (x, w, b) triples one batch at a
// time through the same context, and prints Z. The hidden buffers are
// reused for every batch.
//
// Part 2 learns y = 2*x + 1 with a variable W and B:
//   1. init_forward / forward:  prediction and mean square error
//   2. backward:                gradients of W and B
//   3. update:                  params -= lr * grad, between passes

use lattice::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn dense(dims: &[usize], data: Vec<f32>) -> Result<TensorValue> {
    Ok(TensorValue::Dense(Tensor::from_vec(dims, data)?))
}

fn affine() -> Result<()> {
    let mut graph = Graph::new();
    let x = graph.instance("X", Shape::batch(&[1]), TensorKind::Dense)?;
    let w = graph.instance("W", Shape::batch(&[1]), TensorKind::Dense)?;
    let b = graph.instance("B", Shape::batch(&[1]), TensorKind::Dense)?;
    let xw = graph.op("XW", OpKind::Mul, &[x, w])?;
    let z = graph.op("Z", OpKind::Add, &[xw, b])?;
    graph.compile(&[z])?;

    let params = TensorMap::new();
    let mut ctx = OpContext::new(&graph)?;
    ctx.init_op(&[0], None)?;

    let triples = [
        (1.0, 2.0, 3.0),
        (2.0, 3.0, 4.0),
        (4.0, 5.0, 6.0),
        (10.0, 20.0, 30.0),
    ];
    for (xv, wv, bv) in triples {
        ctx.inst_mut().put("X", dense(&[1, 1], vec![xv])?);
        ctx.inst_mut().put("W", dense(&[1, 1], vec![wv])?);
        ctx.inst_mut().put("B", dense(&[1, 1], vec![bv])?);
        ctx.init_forward(&params)?;
        ctx.forward(&params)?;
        println!("{xv} * {wv} + {bv} = {}", ctx.output(0)?.data()[0]);
    }
    Ok(())
}

fn linear_regression() -> Result<()> {
    let mut graph = Graph::new();
    let x = graph.instance("X", Shape::batch(&[1]), TensorKind::Dense)?;
    let y = graph.instance("Y", Shape::batch(&[1]), TensorKind::Dense)?;
    let init = Initializer::RandNormal {
        mean: 0.0,
        std: 0.1,
    };
    let w = graph.variable("W", (1, 1), TensorKind::Dense, init)?;
    let b = graph.variable("B", (1, 1), TensorKind::Dense, Initializer::Zeros)?;
    let pred = graph.op("Pred", OpKind::FullyConnect, &[x, w, b])?;
    let err = graph.op("Err", OpKind::SquareError, &[pred, y])?;
    let mean = OpKind::ReduceMean {
        axis: None,
        keep_dim: false,
    };
    let loss = graph.op("Loss", mean, &[err])?;
    graph.compile(&[loss])?;

    let mut params = TensorMap::new();
    graph.init_params(&mut params, &mut StdRng::seed_from_u64(42))?;

    let xs: Vec<f32> = (0..10).map(|i| i as f32 / 10.0).collect();
    let ys: Vec<f32> = xs.iter().map(|&x| 2.0 * x + 1.0).collect();
    let lr = 0.5;

    // The context borrows only the graph, so params stay writable between
    // passes.
    let mut ctx = OpContext::new(&graph)?;
    ctx.init_op(&[0], Some(0))?;
    ctx.inst_mut().put("X", dense(&[10, 1], xs)?);
    ctx.inst_mut().put("Y", dense(&[10, 1], ys)?);
    for epoch in 0..200 {
        ctx.init_forward(&params)?;
        ctx.init_backward()?;
        ctx.forward(&params)?;
        ctx.backward(&params)?;
        if epoch % 40 == 0 {
            println!("epoch {epoch:3}: loss = {:.6}", ctx.output(0)?.data()[0]);
        }
        for name in ["W", "B"] {
            let grad = ctx.grad::<Tensor>(name)?.data()[0];
            params.get_mut::<Tensor>(name)?.data_mut()[0] -= lr * grad;
        }
    }

    println!(
        "learned w = {:.3}, b = {:.3} (true: 2, 1)",
        params.get::<Tensor>("W")?.data()[0],
        params.get::<Tensor>("B")?.data()[0]
    );
    Ok(())
}

fn main() -> Result<()> {
    println!(" lattice affine demo \n");
    affine()?;
    println!();
    linear_regression()
}
