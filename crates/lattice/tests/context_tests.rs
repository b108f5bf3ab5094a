// Context tests: binding, forward and backward passes end-to-end

use lattice::prelude::*;
use lattice_core::{make_feature_id_16, make_feature_id_18};
use rand::rngs::StdRng;
use rand::SeedableRng;

// Helpers

fn dense(dims: &[usize], data: Vec<f32>) -> TensorValue {
    TensorValue::Dense(Tensor::from_vec(dims, data).unwrap())
}

fn csr(rows: Vec<Vec<(u64, f32)>>) -> TensorValue {
    TensorValue::Csr(CsrMatrix::from_rows(rows))
}

fn reduce_sum() -> OpKind {
    OpKind::ReduceSum {
        axis: None,
        keep_dim: false,
    }
}

fn affine_graph() -> Graph {
    let mut g = Graph::new();
    let x = g.instance("X", Shape::batch(&[1]), TensorKind::Dense).unwrap();
    let w = g.instance("W", Shape::batch(&[1]), TensorKind::Dense).unwrap();
    let b = g.instance("B", Shape::batch(&[1]), TensorKind::Dense).unwrap();
    let xw = g.op("XW", OpKind::Mul, &[x, w]).unwrap();
    let z = g.op("Z", OpKind::Add, &[xw, b]).unwrap();
    g.compile(&[z]).unwrap();
    g
}

fn bind_affine(ctx: &mut OpContext<'_>, x: &[f32], w: &[f32], b: &[f32]) {
    let n = x.len();
    let inst = ctx.inst_mut();
    inst.put("X", dense(&[n, 1], x.to_vec()));
    inst.put("W", dense(&[n, 1], w.to_vec()));
    inst.put("B", dense(&[n, 1], b.to_vec()));
}

const TRIPLES: [(f32, f32, f32, f32); 4] = [
    (1.0, 2.0, 3.0, 5.0),
    (2.0, 3.0, 4.0, 10.0),
    (4.0, 5.0, 6.0, 26.0),
    (10.0, 20.0, 30.0, 230.0),
];

// Forward

#[test]
fn test_affine_forward_reuses_storage() {
    let g = affine_graph();
    let params = TensorMap::new();
    let mut ctx = OpContext::new(&g).unwrap();
    ctx.init_op(&[0], None).unwrap();

    let mut ptr = None;
    for (x, w, b, z) in TRIPLES {
        bind_affine(&mut ctx, &[x], &[w], &[b]);
        ctx.init_forward(&params).unwrap();
        ctx.forward(&params).unwrap();
        let out = ctx.output(0).unwrap();
        assert_eq!(out.data(), &[z]);
        let p = out.data().as_ptr();
        assert_eq!(*ptr.get_or_insert(p), p);
    }
    assert_eq!(ctx.batch_size(), Some(1));
}

#[test]
fn test_affine_forward_batched() {
    let g = affine_graph();
    let params = TensorMap::new();
    let mut ctx = OpContext::new(&g).unwrap();
    ctx.init_op(&[0], None).unwrap();

    let x: Vec<f32> = TRIPLES.iter().map(|t| t.0).collect();
    let w: Vec<f32> = TRIPLES.iter().map(|t| t.1).collect();
    let b: Vec<f32> = TRIPLES.iter().map(|t| t.2).collect();
    bind_affine(&mut ctx, &x, &w, &b);
    ctx.init_forward(&params).unwrap();
    ctx.forward(&params).unwrap();
    let big = ctx.output(0).unwrap().data().as_ptr();
    assert_eq!(ctx.output(0).unwrap().data(), &[5.0, 10.0, 26.0, 230.0]);
    assert_eq!(ctx.output(0).unwrap().dims(), &[4, 1]);

    // Shrinking and growing back within capacity keeps the allocation.
    bind_affine(&mut ctx, &[1.0], &[1.0], &[1.0]);
    ctx.init_forward(&params).unwrap();
    ctx.forward(&params).unwrap();
    assert_eq!(ctx.output(0).unwrap().data(), &[2.0]);

    bind_affine(&mut ctx, &x, &w, &b);
    ctx.init_forward(&params).unwrap();
    ctx.forward(&params).unwrap();
    assert_eq!(ctx.output(0).unwrap().data().as_ptr(), big);
    assert_eq!(ctx.batch_size(), Some(4));
}

// Backward

fn square_graph() -> Graph {
    let mut g = Graph::new();
    let w = g
        .variable("W", (1, 1), TensorKind::Dense, Initializer::Constant(3.0))
        .unwrap();
    let y = g.op("Y", OpKind::Mul, &[w, w]).unwrap();
    let l = g.op("L", reduce_sum(), &[y]).unwrap();
    g.compile(&[l]).unwrap();
    g
}

#[test]
fn test_gradients_zero_after_init_backward() {
    let g = square_graph();
    let mut params = TensorMap::new();
    g.init_params(&mut params, &mut StdRng::seed_from_u64(7))
        .unwrap();
    let mut ctx = OpContext::new(&g).unwrap();
    ctx.init_op(&[0], Some(0)).unwrap();
    ctx.init_forward(&params).unwrap();
    ctx.init_backward().unwrap();
    for name in ["W", "Y", "L"] {
        let grad = ctx.grad::<Tensor>(name).unwrap();
        assert!(grad.data().iter().all(|&v| v == 0.0), "{name}");
    }
}

#[test]
fn test_gradient_sums_over_paths() {
    let g = square_graph();
    let mut params = TensorMap::new();
    g.init_params(&mut params, &mut StdRng::seed_from_u64(7))
        .unwrap();
    let mut ctx = OpContext::new(&g).unwrap();
    ctx.init_op(&[0], Some(0)).unwrap();
    ctx.init_forward(&params).unwrap();
    ctx.init_backward().unwrap();
    ctx.forward(&params).unwrap();
    assert_eq!(ctx.output(0).unwrap().data(), &[9.0]);

    ctx.backward(&params).unwrap();
    assert_eq!(ctx.grad::<Tensor>("W").unwrap().data(), &[6.0]);
    assert_eq!(ctx.grad::<Tensor>("L").unwrap().data(), &[1.0]);

    // Each call starts from zero.
    ctx.backward(&params).unwrap();
    assert_eq!(ctx.grad::<Tensor>("W").unwrap().data(), &[6.0]);
}

#[test]
fn test_backward_requires_completed_forward() {
    let g = square_graph();
    let mut params = TensorMap::new();
    g.init_params(&mut params, &mut StdRng::seed_from_u64(7))
        .unwrap();
    let mut ctx = OpContext::new(&g).unwrap();
    ctx.init_op(&[0], Some(0)).unwrap();
    ctx.init_forward(&params).unwrap();
    ctx.init_backward().unwrap();
    assert!(matches!(ctx.backward(&params), Err(Error::Msg(_))));

    ctx.forward(&params).unwrap();
    ctx.backward(&params).unwrap();
    assert_eq!(ctx.grad::<Tensor>("W").unwrap().data(), &[6.0]);

    // A new batch needs its own forward.
    ctx.init_forward(&params).unwrap();
    assert!(matches!(ctx.backward(&params), Err(Error::Msg(_))));

    // So does a plan switch.
    ctx.forward(&params).unwrap();
    ctx.init_op(&[0], Some(0)).unwrap();
    assert!(matches!(ctx.backward(&params), Err(Error::Msg(_))));
}

#[test]
fn test_backward_prunes_and_accumulates() {
    let mut g = Graph::new();
    let x = g.instance("X", Shape::batch(&[2]), TensorKind::Dense).unwrap();
    let w = g
        .variable("W", (2, 1), TensorKind::Dense, Initializer::Ones)
        .unwrap();
    let v = g
        .variable("V", (2, 1), TensorKind::Dense, Initializer::Zeros)
        .unwrap();
    g.set_need_grad(v, false).unwrap();
    let yw = g.op("YW", OpKind::Matmul, &[x, w]).unwrap();
    let yv = g.op("YV", OpKind::Matmul, &[x, v]).unwrap();
    let s = g.op("S", OpKind::Add, &[yw, yv]).unwrap();
    let l = g.op("L", reduce_sum(), &[s]).unwrap();
    g.compile(&[l]).unwrap();

    let mut params = TensorMap::new();
    g.init_params(&mut params, &mut StdRng::seed_from_u64(0))
        .unwrap();
    let mut ctx = OpContext::new(&g).unwrap();
    ctx.init_op(&[0], Some(0)).unwrap();
    ctx.inst_mut()
        .put("X", dense(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]));
    ctx.init_forward(&params).unwrap();
    ctx.init_backward().unwrap();
    ctx.forward(&params).unwrap();
    ctx.backward(&params).unwrap();

    assert_eq!(ctx.output(0).unwrap().data(), &[10.0]);
    assert_eq!(ctx.grad::<Tensor>("W").unwrap().data(), &[4.0, 6.0]);
    assert!(matches!(ctx.grad::<Tensor>("V"), Err(Error::MissingKey(_))));
    assert!(matches!(ctx.grad::<Tensor>("YV"), Err(Error::MissingKey(_))));
    assert!(matches!(ctx.grad::<Tensor>("X"), Err(Error::MissingKey(_))));
}

#[test]
fn test_sigmoid_bce_training_step() {
    let mut g = Graph::new();
    let x = g.instance("X", Shape::batch(&[2]), TensorKind::Dense).unwrap();
    let y = g.instance("Y", Shape::batch(&[1]), TensorKind::Dense).unwrap();
    let w = g
        .variable("W", (2, 1), TensorKind::Dense, Initializer::Zeros)
        .unwrap();
    let b = g
        .variable("B", (1, 1), TensorKind::Dense, Initializer::Zeros)
        .unwrap();
    let z = g.op("Z", OpKind::FullyConnect, &[x, w, b]).unwrap();
    let e = g.op("E", OpKind::SigmoidBceLoss, &[z, y]).unwrap();
    let l = g
        .op(
            "L",
            OpKind::ReduceMean {
                axis: None,
                keep_dim: false,
            },
            &[e],
        )
        .unwrap();
    g.compile(&[l, z]).unwrap();

    let mut params = TensorMap::new();
    g.init_params(&mut params, &mut StdRng::seed_from_u64(0))
        .unwrap();
    let mut ctx = OpContext::new(&g).unwrap();
    ctx.init_op(&[0, 1], Some(0)).unwrap();
    ctx.inst_mut()
        .put("X", dense(&[2, 2], vec![1.0, 0.0, 0.0, 1.0]));
    ctx.inst_mut().put("Y", dense(&[2, 1], vec![1.0, 0.0]));
    ctx.init_forward(&params).unwrap();
    ctx.init_backward().unwrap();
    ctx.forward(&params).unwrap();
    ctx.backward(&params).unwrap();

    // z = 0 everywhere: loss ln 2, dL/dz = (sigmoid(0) - y) / 2.
    let loss = ctx.output(0).unwrap().data()[0];
    assert!((loss - std::f32::consts::LN_2).abs() < 1e-6);
    assert_eq!(ctx.output(1).unwrap().data(), &[0.0, 0.0]);
    let gw = ctx.grad::<Tensor>("W").unwrap().data();
    assert!((gw[0] + 0.25).abs() < 1e-6);
    assert!((gw[1] - 0.25).abs() < 1e-6);
    let gb = ctx.grad::<Tensor>("B").unwrap().data();
    assert!(gb[0].abs() < 1e-6);
}

// Binding

#[test]
fn test_binding_errors_leave_context_reusable() {
    let mut g = Graph::new();
    let x = g.instance("X", Shape::batch(&[2]), TensorKind::Dense).unwrap();
    let y = g.instance("Y", Shape::batch(&[2]), TensorKind::Dense).unwrap();
    let w = g
        .variable("W", (2, 2), TensorKind::Dense, Initializer::Ones)
        .unwrap();
    let p = g.op("P", OpKind::Matmul, &[x, w]).unwrap();
    let l = g.op("L", OpKind::SquareError, &[p, y]).unwrap();
    g.compile(&[l]).unwrap();
    let mut ctx = OpContext::new(&g).unwrap();

    let mut params = TensorMap::new();
    assert!(matches!(ctx.init_forward(&params), Err(Error::Msg(_))));
    ctx.init_op(&[0], None).unwrap();
    assert!(matches!(ctx.forward(&params), Err(Error::Msg(_))));
    assert!(matches!(ctx.init_backward(), Err(Error::Msg(_))));

    // missing instance
    assert!(matches!(
        ctx.init_forward(&params),
        Err(Error::MissingKey(name)) if name == "X"
    ));

    // wrong fixed dim
    ctx.inst_mut().put("X", dense(&[2, 3], vec![0.0; 6]));
    ctx.inst_mut().put("Y", dense(&[2, 2], vec![0.0; 4]));
    assert!(matches!(
        ctx.init_forward(&params),
        Err(Error::Binding { name, .. }) if name == "X"
    ));

    // inconsistent batch
    ctx.inst_mut().put("X", dense(&[3, 2], vec![0.0; 6]));
    assert!(matches!(
        ctx.init_forward(&params),
        Err(Error::Binding { name, .. }) if name == "Y"
    ));

    // wrong kind
    ctx.inst_mut().put("X", csr(vec![vec![], vec![]]));
    assert!(matches!(
        ctx.init_forward(&params),
        Err(Error::TensorKindMismatch { .. })
    ));

    // missing and misshapen parameter
    ctx.inst_mut().put("X", dense(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]));
    assert!(matches!(
        ctx.init_forward(&params),
        Err(Error::MissingKey(name)) if name == "W"
    ));
    params.put("W", dense(&[2, 1], vec![1.0, 1.0]));
    assert!(matches!(
        ctx.init_forward(&params),
        Err(Error::Binding { name, .. }) if name == "W"
    ));

    // fixed inputs, same context
    params.put("W", dense(&[2, 2], vec![1.0, 0.0, 0.0, 1.0]));
    ctx.init_forward(&params).unwrap();
    ctx.forward(&params).unwrap();
    assert_eq!(ctx.output(0).unwrap().data(), &[1.0, 4.0, 9.0, 16.0]);
    assert_eq!(ctx.hidden().get::<Tensor>("P").unwrap().data(), &[1.0, 2.0, 3.0, 4.0]);

    // a batch change between init_forward and forward is caught
    ctx.inst_mut().put("Y", dense(&[1, 2], vec![0.0; 2]));
    assert!(matches!(ctx.forward(&params), Err(Error::Binding { .. })));
}

// Group embedding lookup

fn f16(group: u16, sub: u64) -> u64 {
    make_feature_id_16(group, sub)
}

fn f18(group: u32, sub: u64) -> u64 {
    make_feature_id_18(group, sub)
}

#[test]
fn test_group_embedding_lookup_dense_tables() {
    let mut g = Graph::new();
    let x = g.instance("X", Shape::batch(&[1]), TensorKind::Csr).unwrap();
    let w1 = g
        .variable("W1", (4, 2), TensorKind::Dense, Initializer::Zeros)
        .unwrap();
    let w2 = g
        .variable("W2", (4, 1), TensorKind::Dense, Initializer::Zeros)
        .unwrap();
    let e = g
        .op(
            "E",
            OpKind::GroupEmbeddingLookup {
                group_ids: vec![1, 2],
            },
            &[x, w1, w2],
        )
        .unwrap();
    let l = g.op("L", reduce_sum(), &[e]).unwrap();
    g.compile(&[e, l]).unwrap();
    assert_eq!(g.shape_of(e).unwrap(), &Shape::batch(&[3]));

    let mut params = TensorMap::new();
    params.put(
        "W1",
        dense(&[4, 2], vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0]),
    );
    params.put("W2", dense(&[4, 1], vec![100.0, 200.0, 300.0, 400.0]));

    let mut ctx = OpContext::new(&g).unwrap();
    ctx.init_op(&[0], Some(1)).unwrap();
    // Dense tables read row id % rows; group bits vanish modulo 4.
    ctx.inst_mut().put(
        "X",
        csr(vec![
            vec![(f16(1, 2), 1.0), (f16(2, 1), 2.0), (f16(3, 0), 5.0)],
            vec![(f16(1, 0), 0.5), (f16(1, 3), 1.0)],
        ]),
    );
    ctx.init_forward(&params).unwrap();
    ctx.init_backward().unwrap();
    ctx.forward(&params).unwrap();
    assert_eq!(
        ctx.output(0).unwrap().data(),
        &[3.0, 30.0, 400.0, 4.5, 45.0, 0.0]
    );

    ctx.backward(&params).unwrap();
    assert_eq!(
        ctx.grad::<Tensor>("W1").unwrap().data(),
        &[0.5, 0.5, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]
    );
    assert_eq!(
        ctx.grad::<Tensor>("W2").unwrap().data(),
        &[0.0, 2.0, 0.0, 0.0]
    );
}

#[test]
fn test_group_embedding_lookup2_shared_dense_table() {
    let mut g = Graph::new();
    let x = g.instance("X", Shape::batch(&[1]), TensorKind::Csr).unwrap();
    let w = g
        .variable("W", (4, 2), TensorKind::Dense, Initializer::Zeros)
        .unwrap();
    let e = g
        .op(
            "E",
            OpKind::GroupEmbeddingLookup2 {
                group_ids: vec![1, 2],
            },
            &[x, w],
        )
        .unwrap();
    g.compile(&[e]).unwrap();

    let mut params = TensorMap::new();
    params.put(
        "W",
        dense(&[4, 2], vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0]),
    );
    let mut ctx = OpContext::new(&g).unwrap();
    ctx.init_op(&[0], None).unwrap();
    ctx.inst_mut()
        .put("X", csr(vec![vec![(f16(1, 1), 1.0), (f16(2, 3), 1.0)]]));
    ctx.init_forward(&params).unwrap();
    ctx.forward(&params).unwrap();
    assert_eq!(ctx.output(0).unwrap().data(), &[2.0, 2.0, 4.0, 4.0]);
}

#[test]
fn test_group18_embedding_lookup_sparse_tables() {
    let mut g = Graph::new();
    let x = g.instance("X", Shape::batch(&[1]), TensorKind::Csr).unwrap();
    let w1 = g
        .variable("W1", (10, 1), TensorKind::Srm, Initializer::Zeros)
        .unwrap();
    let w2 = g
        .variable("W2", (10, 2), TensorKind::Srm, Initializer::Zeros)
        .unwrap();
    let e = g
        .op(
            "E",
            OpKind::Group18EmbeddingLookup {
                group_ids: vec![1, 200_000],
            },
            &[x, w1, w2],
        )
        .unwrap();
    g.compile(&[e]).unwrap();

    let mut params = TensorMap::new();
    g.init_params(&mut params, &mut StdRng::seed_from_u64(0))
        .unwrap();
    params
        .get_mut::<SparseRowMatrix>("W1")
        .unwrap()
        .insert_row(f18(1, 5), vec![7.0])
        .unwrap();
    params
        .get_mut::<SparseRowMatrix>("W2")
        .unwrap()
        .insert_row(f18(200_000, 5), vec![1.0, 2.0])
        .unwrap();

    let mut ctx = OpContext::new(&g).unwrap();
    ctx.init_op(&[0], None).unwrap();
    ctx.inst_mut().put(
        "X",
        csr(vec![vec![(f18(1, 5), 1.0), (f18(200_000, 5), 1.0)]]),
    );
    ctx.init_forward(&params).unwrap();
    ctx.forward(&params).unwrap();
    assert_eq!(ctx.output(0).unwrap().data(), &[7.0, 1.0, 2.0]);
}

#[test]
fn test_group18_embedding_lookup2_shared_sparse_table() {
    let mut g = Graph::new();
    let x = g.instance("X", Shape::batch(&[1]), TensorKind::Csr).unwrap();
    let w = g
        .variable("W", (1000, 2), TensorKind::Srm, Initializer::Zeros)
        .unwrap();
    let e = g
        .op(
            "E",
            OpKind::Group18EmbeddingLookup2 {
                group_ids: vec![5, 7],
            },
            &[x, w],
        )
        .unwrap();
    let l = g.op("L", reduce_sum(), &[e]).unwrap();
    g.compile(&[e, l]).unwrap();

    let mut table = SparseRowMatrix::new(2);
    table.insert_row(f18(5, 9), vec![1.0, 2.0]).unwrap();
    table.insert_row(f18(7, 9), vec![3.0, 4.0]).unwrap();
    let mut params = TensorMap::new();
    params.put("W", TensorValue::Srm(table));

    let mut ctx = OpContext::new(&g).unwrap();
    ctx.init_op(&[0], Some(1)).unwrap();
    ctx.inst_mut().put(
        "X",
        csr(vec![
            vec![(f18(5, 9), 2.0), (f18(7, 9), 1.0)],
            vec![(f18(7, 4), 1.0)],
        ]),
    );
    ctx.init_forward(&params).unwrap();
    ctx.init_backward().unwrap();
    ctx.forward(&params).unwrap();
    // the second example's row is absent from the table and reads as zero
    assert_eq!(
        ctx.output(0).unwrap().data(),
        &[2.0, 4.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0]
    );

    ctx.backward(&params).unwrap();
    let grad = ctx.grad::<SparseRowMatrix>("W").unwrap();
    assert_eq!(grad.col(), 2);
    assert_eq!(grad.len(), 3);
    assert_eq!(grad.row(f18(5, 9)), Some(&[2.0, 2.0][..]));
    assert_eq!(grad.row(f18(7, 9)), Some(&[1.0, 1.0][..]));
    assert_eq!(grad.row(f18(7, 4)), Some(&[1.0, 1.0][..]));
}

#[test]
fn test_group_config_declares_tables() {
    let config = GroupConfig::parse("1:100:4,2:50:4").unwrap();
    let mut g = Graph::new();
    let x = g.instance("X", Shape::batch(&[1]), TensorKind::Csr).unwrap();
    let mut inputs = vec![x];
    for item in config.items() {
        let w = g
            .variable(
                &format!("W{}", item.group_id),
                (item.embedding_row, item.embedding_col),
                TensorKind::Dense,
                Initializer::RandNormal {
                    mean: 0.0,
                    std: 1e-3,
                },
            )
            .unwrap();
        inputs.push(w);
    }
    let e = g
        .op(
            "E",
            OpKind::GroupEmbeddingLookup {
                group_ids: config.group_ids(),
            },
            &inputs,
        )
        .unwrap();
    g.compile(&[e]).unwrap();
    assert_eq!(
        g.shape_of(e).unwrap(),
        &Shape::batch(&[config.total_embedding_col()])
    );

    let mut params = TensorMap::new();
    g.init_params(&mut params, &mut StdRng::seed_from_u64(42))
        .unwrap();
    assert_eq!(params.get::<Tensor>("W1").unwrap().dims(), &[100, 4]);
    assert_eq!(params.get::<Tensor>("W2").unwrap().dims(), &[50, 4]);
    assert!(params
        .get::<Tensor>("W1")
        .unwrap()
        .data()
        .iter()
        .all(|v| v.abs() < 1e-2));
}

// Concurrency

#[test]
fn test_contexts_share_graph_across_threads() {
    let g = affine_graph();
    let params = TensorMap::new();
    let results: Vec<f32> = std::thread::scope(|scope| {
        let handles: Vec<_> = TRIPLES
            .iter()
            .map(|&(x, w, b, _)| {
                let (g, params) = (&g, &params);
                scope.spawn(move || {
                    let mut ctx = OpContext::new(g).unwrap();
                    ctx.init_op(&[0], None).unwrap();
                    bind_affine(&mut ctx, &[x], &[w], &[b]);
                    ctx.init_forward(params).unwrap();
                    ctx.forward(params).unwrap();
                    ctx.output(0).unwrap().data()[0]
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results, vec![5.0, 10.0, 26.0, 230.0]);
}
