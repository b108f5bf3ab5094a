// Operators: the closed set of computations a graph node can perform
//
// OpKind names an operator and carries its parameters. The Operator trait is
// the seam between the graph engine and the kernels:
//
//   name / arity / input_kind   - checked when a node is added and compiled
//   infer_shape                 - output shape from input shapes (compile)
//   forward                     - write the output buffer
//   backward                    - accumulate one input's gradient
//
// Shapes use Dim::Batch for the per-batch leading axis. Inference keeps the
// placeholder wherever the output row count follows the batch, and rejects
// anything that would need to know its value.
//
// Kernels live in lattice-nn. Runtime tensors arrive as TensorRef (read) and
// GradMut (accumulate) so one dispatch covers dense, sparse-row and CSR
// storage.

use std::fmt;

use lattice_core::shape::{checked_total, MAX_TOTAL_DIM};
use lattice_core::{
    CsrMatrix, Dim, Error, Result, Shape, SparseRowMatrix, Tensor, TensorKind, TensorValue,
};
use lattice_nn::activation::{activation_backward, activation_forward};
use lattice_nn::elementwise::{
    binary_backward, binary_forward, broadcast_backward, broadcast_forward,
};
use lattice_nn::embedding::{group_lookup_backward, group_lookup_forward};
use lattice_nn::linalg::{
    fully_connect_backward, fully_connect_forward, matmul_backward, matmul_forward,
};
use lattice_nn::loss::{loss_backward, loss_forward};
use lattice_nn::reduce::{reduce_backward, reduce_forward};
use lattice_nn::shape_ops::{concat_backward, concat_forward, reshape_backward, reshape_forward};
use lattice_nn::{
    Activation, BinaryOp, GroupBits, GroupLayout, Loss, Reduction, TableGradMut, TableRef,
};

/// Built-in operators.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
    BroadcastAdd,
    BroadcastMul,
    Sigmoid,
    Tanh,
    Relu,
    Matmul,
    FullyConnect,
    /// `axis: None` reduces everything to a `[1]` tensor. Negative axes
    /// count from the end.
    ReduceSum {
        axis: Option<isize>,
        keep_dim: bool,
    },
    ReduceMean {
        axis: Option<isize>,
        keep_dim: bool,
    },
    SigmoidBceLoss,
    SquareError,
    AbsoluteError,
    /// The target may start with `Dim::Batch` when the input is batched.
    Reshape {
        shape: Shape,
    },
    Concat {
        axis: isize,
    },
    /// One table per group, 16-bit group ids.
    GroupEmbeddingLookup {
        group_ids: Vec<u32>,
    },
    /// One table shared by every group, 16-bit group ids.
    GroupEmbeddingLookup2 {
        group_ids: Vec<u32>,
    },
    /// One table per group, 18-bit group ids.
    Group18EmbeddingLookup {
        group_ids: Vec<u32>,
    },
    /// One table shared by every group, 18-bit group ids.
    Group18EmbeddingLookup2 {
        group_ids: Vec<u32>,
    },
}

/// Number of inputs an operator accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::Exact(k) => n == k,
            Arity::AtLeast(k) => n >= k,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(k) => write!(f, "{k}"),
            Arity::AtLeast(k) => write!(f, "at least {k}"),
        }
    }
}

/// Storage an operator input slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Dense,
    Csr,
    /// An embedding table: dense or sparse-row.
    Table,
}

impl InputKind {
    pub fn accepts(&self, kind: TensorKind) -> bool {
        match self {
            InputKind::Dense => kind == TensorKind::Dense,
            InputKind::Csr => kind == TensorKind::Csr,
            InputKind::Table => matches!(kind, TensorKind::Dense | TensorKind::Srm),
        }
    }

    pub(crate) fn expected(&self) -> TensorKind {
        match self {
            InputKind::Csr => TensorKind::Csr,
            InputKind::Dense | InputKind::Table => TensorKind::Dense,
        }
    }
}

/// Read access to a runtime input.
#[derive(Debug, Clone, Copy)]
pub enum TensorRef<'a> {
    Dense(&'a Tensor),
    Srm(&'a SparseRowMatrix),
    Csr(&'a CsrMatrix),
}

impl<'a> TensorRef<'a> {
    pub fn from_value(value: &'a TensorValue) -> Self {
        match value {
            TensorValue::Dense(t) => TensorRef::Dense(t),
            TensorValue::Srm(m) => TensorRef::Srm(m),
            TensorValue::Csr(m) => TensorRef::Csr(m),
        }
    }

    pub fn kind(&self) -> TensorKind {
        match self {
            TensorRef::Dense(_) => TensorKind::Dense,
            TensorRef::Srm(_) => TensorKind::Srm,
            TensorRef::Csr(_) => TensorKind::Csr,
        }
    }

    pub fn dense(&self) -> Result<&'a Tensor> {
        match *self {
            TensorRef::Dense(t) => Ok(t),
            _ => Err(kind_error("operand", TensorKind::Dense, self.kind())),
        }
    }

    pub fn csr(&self) -> Result<&'a CsrMatrix> {
        match *self {
            TensorRef::Csr(m) => Ok(m),
            _ => Err(kind_error("operand", TensorKind::Csr, self.kind())),
        }
    }

    fn table(&self) -> Result<TableRef<'a>> {
        match *self {
            TensorRef::Dense(t) => Ok(TableRef::Dense(t)),
            TensorRef::Srm(m) => Ok(TableRef::Srm(m)),
            TensorRef::Csr(_) => Err(kind_error("table", TensorKind::Dense, TensorKind::Csr)),
        }
    }
}

/// Write access to a gradient buffer.
#[derive(Debug)]
pub enum GradMut<'a> {
    Dense(&'a mut Tensor),
    Srm(&'a mut SparseRowMatrix),
}

impl<'a> GradMut<'a> {
    pub fn from_value(value: &'a mut TensorValue) -> Result<Self> {
        match value {
            TensorValue::Dense(t) => Ok(GradMut::Dense(t)),
            TensorValue::Srm(m) => Ok(GradMut::Srm(m)),
            TensorValue::Csr(_) => Err(kind_error("gradient", TensorKind::Dense, TensorKind::Csr)),
        }
    }

    fn dense(self) -> Result<&'a mut Tensor> {
        match self {
            GradMut::Dense(t) => Ok(t),
            GradMut::Srm(_) => Err(kind_error("gradient", TensorKind::Dense, TensorKind::Srm)),
        }
    }

    fn table(self) -> TableGradMut<'a> {
        match self {
            GradMut::Dense(t) => TableGradMut::Dense(t),
            GradMut::Srm(m) => TableGradMut::Srm(m),
        }
    }
}

fn kind_error(what: &str, expected: TensorKind, got: TensorKind) -> Error {
    Error::TensorKindMismatch {
        name: what.to_string(),
        expected,
        got,
    }
}

/// The interface every operator implements.
pub trait Operator {
    /// Operator type name; also the registry key.
    fn name(&self) -> &'static str;

    fn arity(&self) -> Arity;

    /// Storage accepted by input `slot`.
    fn input_kind(&self, slot: usize) -> InputKind;

    /// Output shape for the given input shapes. `node` names the node in
    /// errors.
    fn infer_shape(&self, node: &str, inputs: &[&Shape]) -> Result<Shape>;

    /// Compute the output, overwriting `out`.
    fn forward(&self, inputs: &[TensorRef<'_>], out: &mut Tensor) -> Result<()>;

    /// Accumulate the gradient of input `slot` into `gx`, given the forward
    /// output `y` and its gradient `gy`.
    fn backward(
        &self,
        slot: usize,
        inputs: &[TensorRef<'_>],
        y: &Tensor,
        gy: &Tensor,
        gx: GradMut<'_>,
    ) -> Result<()>;
}

impl OpKind {
    /// Reject parameters that no input could make valid.
    pub fn validate(&self, node: &str) -> Result<()> {
        let invalid = |reason: String| Error::InvalidOp {
            name: node.to_string(),
            op: self.name(),
            reason,
        };
        match self {
            OpKind::Reshape { shape } => {
                if shape.rank() == 0 {
                    return Err(invalid("empty target shape".to_string()));
                }
                if !shape.has_valid_batch_axis() {
                    return Err(invalid(format!(
                        "batch placeholder only allowed at axis 0, got {shape}"
                    )));
                }
                if shape.dims().iter().any(|d| d.fixed() == Some(0)) {
                    return Err(invalid(format!("zero-sized dimension in {shape}")));
                }
            }
            _ => {
                if let Some((bits, _, group_ids)) = self.group_lookup() {
                    GroupLayout::shared(bits, group_ids, 1).map_err(|e| invalid(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    fn binary(&self) -> Option<BinaryOp> {
        match self {
            OpKind::Add | OpKind::BroadcastAdd => Some(BinaryOp::Add),
            OpKind::Sub => Some(BinaryOp::Sub),
            OpKind::Mul | OpKind::BroadcastMul => Some(BinaryOp::Mul),
            OpKind::Div => Some(BinaryOp::Div),
            _ => None,
        }
    }

    fn activation(&self) -> Option<Activation> {
        match self {
            OpKind::Sigmoid => Some(Activation::Sigmoid),
            OpKind::Tanh => Some(Activation::Tanh),
            OpKind::Relu => Some(Activation::Relu),
            _ => None,
        }
    }

    fn loss(&self) -> Option<Loss> {
        match self {
            OpKind::SigmoidBceLoss => Some(Loss::SigmoidBce),
            OpKind::SquareError => Some(Loss::SquareError),
            OpKind::AbsoluteError => Some(Loss::AbsoluteError),
            _ => None,
        }
    }

    fn reduction(&self) -> Option<(Reduction, Option<isize>, bool)> {
        match *self {
            OpKind::ReduceSum { axis, keep_dim } => Some((Reduction::Sum, axis, keep_dim)),
            OpKind::ReduceMean { axis, keep_dim } => Some((Reduction::Mean, axis, keep_dim)),
            _ => None,
        }
    }

    /// `(bits, shared, group_ids)` for the embedding lookups.
    fn group_lookup(&self) -> Option<(GroupBits, bool, &[u32])> {
        match self {
            OpKind::GroupEmbeddingLookup { group_ids } => {
                Some((GroupBits::Bits16, false, group_ids.as_slice()))
            }
            OpKind::GroupEmbeddingLookup2 { group_ids } => {
                Some((GroupBits::Bits16, true, group_ids.as_slice()))
            }
            OpKind::Group18EmbeddingLookup { group_ids } => {
                Some((GroupBits::Bits18, false, group_ids.as_slice()))
            }
            OpKind::Group18EmbeddingLookup2 { group_ids } => {
                Some((GroupBits::Bits18, true, group_ids.as_slice()))
            }
            _ => None,
        }
    }

    fn group_layout(&self, tables: &[TableRef<'_>]) -> Result<GroupLayout> {
        let (bits, shared, group_ids) = self
            .group_lookup()
            .ok_or_else(|| Error::msg(format!("{} is not a group lookup", self.name())))?;
        if shared {
            let col = tables.first().map(TableRef::col).unwrap_or(0);
            GroupLayout::shared(bits, group_ids, col)
        } else {
            let cols: Vec<usize> = tables.iter().map(TableRef::col).collect();
            GroupLayout::per_group(bits, group_ids, &cols)
        }
    }

    fn tables<'a>(inputs: &[TensorRef<'a>]) -> Result<Vec<TableRef<'a>>> {
        inputs.iter().skip(1).map(TensorRef::table).collect()
    }
}

fn mismatch(node: &str, op: &'static str, message: String) -> Error {
    Error::ShapeMismatch {
        name: node.to_string(),
        op,
        message,
    }
}

fn checked_sum(a: usize, b: usize) -> Option<usize> {
    a.checked_add(b).filter(|&t| t <= MAX_TOTAL_DIM)
}

/// Normalize a possibly negative axis against `rank`.
fn real_axis(axis: isize, rank: usize) -> Option<usize> {
    let rank = rank as isize;
    let real = if axis < 0 { axis + rank } else { axis };
    (0..rank).contains(&real).then_some(real as usize)
}

/// Right-aligned broadcast of two declared shapes.
fn broadcast_shape(node: &str, op: &'static str, a: &Shape, b: &Shape) -> Result<Shape> {
    let rank = a.rank().max(b.rank());
    let pad = |s: &Shape, i: usize| -> Dim {
        let offset = rank - s.rank();
        if i < offset {
            Dim::Fixed(1)
        } else {
            s.dims()[i - offset]
        }
    };
    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let d = match (pad(a, i), pad(b, i)) {
            (x, y) if x == y => x,
            (Dim::Fixed(1), y) => y,
            (x, Dim::Fixed(1)) => x,
            (x, y) => {
                return Err(mismatch(
                    node,
                    op,
                    format!("cannot broadcast {a} with {b}: axis {i} is {x} vs {y}"),
                ))
            }
        };
        dims.push(d);
    }
    let shape = Shape::new(dims);
    if !shape.has_valid_batch_axis() {
        return Err(mismatch(
            node,
            op,
            format!("broadcast of {a} with {b} moves the batch axis"),
        ));
    }
    Ok(shape)
}

fn require_rank(node: &str, op: &'static str, what: &str, s: &Shape, rank: usize) -> Result<()> {
    if !s.is_rank(rank) {
        return Err(mismatch(
            node,
            op,
            format!("{what} must be rank {rank}, got {s}"),
        ));
    }
    Ok(())
}

impl Operator for OpKind {
    fn name(&self) -> &'static str {
        match self {
            OpKind::Add => "Add",
            OpKind::Sub => "Sub",
            OpKind::Mul => "Mul",
            OpKind::Div => "Div",
            OpKind::BroadcastAdd => "BroadcastAdd",
            OpKind::BroadcastMul => "BroadcastMul",
            OpKind::Sigmoid => "Sigmoid",
            OpKind::Tanh => "Tanh",
            OpKind::Relu => "Relu",
            OpKind::Matmul => "Matmul",
            OpKind::FullyConnect => "FullyConnect",
            OpKind::ReduceSum { .. } => "ReduceSum",
            OpKind::ReduceMean { .. } => "ReduceMean",
            OpKind::SigmoidBceLoss => "SigmoidBCELoss",
            OpKind::SquareError => "SquareError",
            OpKind::AbsoluteError => "AbsoluteError",
            OpKind::Reshape { .. } => "Reshape",
            OpKind::Concat { .. } => "Concat",
            OpKind::GroupEmbeddingLookup { .. } => "GroupEmbeddingLookup",
            OpKind::GroupEmbeddingLookup2 { .. } => "GroupEmbeddingLookup2",
            OpKind::Group18EmbeddingLookup { .. } => "Group18EmbeddingLookup",
            OpKind::Group18EmbeddingLookup2 { .. } => "Group18EmbeddingLookup2",
        }
    }

    fn arity(&self) -> Arity {
        match self {
            OpKind::Sigmoid
            | OpKind::Tanh
            | OpKind::Relu
            | OpKind::ReduceSum { .. }
            | OpKind::ReduceMean { .. }
            | OpKind::Reshape { .. } => Arity::Exact(1),
            OpKind::FullyConnect => Arity::Exact(3),
            OpKind::Concat { .. } => Arity::AtLeast(1),
            OpKind::GroupEmbeddingLookup { group_ids }
            | OpKind::Group18EmbeddingLookup { group_ids } => Arity::Exact(1 + group_ids.len()),
            OpKind::GroupEmbeddingLookup2 { .. } | OpKind::Group18EmbeddingLookup2 { .. } => {
                Arity::Exact(2)
            }
            _ => Arity::Exact(2),
        }
    }

    fn input_kind(&self, slot: usize) -> InputKind {
        match (self.group_lookup(), slot) {
            (Some(_), 0) => InputKind::Csr,
            (Some(_), _) => InputKind::Table,
            (None, _) => InputKind::Dense,
        }
    }

    fn infer_shape(&self, node: &str, inputs: &[&Shape]) -> Result<Shape> {
        let op = self.name();
        if !self.arity().accepts(inputs.len()) {
            return Err(Error::Arity {
                name: node.to_string(),
                op,
                expected: self.arity().to_string(),
                got: inputs.len(),
            });
        }
        match self {
            OpKind::Add
            | OpKind::Sub
            | OpKind::Mul
            | OpKind::Div
            | OpKind::SigmoidBceLoss
            | OpKind::SquareError
            | OpKind::AbsoluteError => {
                let (a, b) = (inputs[0], inputs[1]);
                if a != b {
                    return Err(mismatch(node, op, format!("operand shapes differ: {a} vs {b}")));
                }
                Ok(a.clone())
            }
            OpKind::BroadcastAdd | OpKind::BroadcastMul => {
                broadcast_shape(node, op, inputs[0], inputs[1])
            }
            OpKind::Sigmoid | OpKind::Tanh | OpKind::Relu => Ok(inputs[0].clone()),
            OpKind::Matmul => {
                let (a, b) = (inputs[0], inputs[1]);
                require_rank(node, op, "lhs", a, 2)?;
                require_rank(node, op, "rhs", b, 2)?;
                if b.dims()[0].is_batch() || a.dims()[1] != b.dims()[0] {
                    return Err(mismatch(node, op, format!("inner dims differ: {a} · {b}")));
                }
                Ok(Shape::new(vec![a.dims()[0], b.dims()[1]]))
            }
            OpKind::FullyConnect => {
                let (x, w, bias) = (inputs[0], inputs[1], inputs[2]);
                require_rank(node, op, "input", x, 2)?;
                require_rank(node, op, "weight", w, 2)?;
                let (k, n) = match (w.fixed_dim(0), w.fixed_dim(1)) {
                    (Some(k), Some(n)) => (k, n),
                    _ => return Err(mismatch(node, op, format!("weight must be concrete, got {w}"))),
                };
                if x.fixed_dim(1) != Some(k) {
                    return Err(mismatch(node, op, format!("input {x} does not match weight {w}")));
                }
                let bias_ok = bias.is_concrete()
                    && bias.fixed_total().ok() == Some(n)
                    && bias.fixed_dim(bias.rank().saturating_sub(1)) == Some(n);
                if !bias_ok {
                    return Err(mismatch(node, op, format!("bias {bias} must be (1, {n})")));
                }
                Ok(Shape::new(vec![x.dims()[0], Dim::Fixed(n)]))
            }
            OpKind::ReduceSum { axis, keep_dim } | OpKind::ReduceMean { axis, keep_dim } => {
                let x = inputs[0];
                match axis {
                    None => Ok(Shape::from(1)),
                    Some(a) => {
                        let real = real_axis(*a, x.rank()).ok_or_else(|| {
                            mismatch(node, op, format!("axis {a} out of range for {x}"))
                        })?;
                        let mut dims = x.dims().to_vec();
                        if *keep_dim {
                            dims[real] = Dim::Fixed(1);
                        } else {
                            dims.remove(real);
                        }
                        let shape = Shape::new(dims);
                        if !shape.has_valid_batch_axis() {
                            return Err(mismatch(
                                node,
                                op,
                                format!("reducing axis {a} of {x} moves the batch axis"),
                            ));
                        }
                        Ok(shape)
                    }
                }
            }
            OpKind::Reshape { shape } => {
                let x = inputs[0];
                if x.has_batch() != shape.has_batch() {
                    return Err(mismatch(
                        node,
                        op,
                        format!("cannot reshape {x} to {shape}: batch axis must be kept"),
                    ));
                }
                let (from, to) = (x.fixed_total()?, shape.fixed_total()?);
                if from != to {
                    return Err(mismatch(
                        node,
                        op,
                        format!("cannot reshape {x} ({from} per row) to {shape} ({to} per row)"),
                    ));
                }
                Ok(shape.clone())
            }
            OpKind::Concat { axis } => {
                let first = inputs[0];
                let real = real_axis(*axis, first.rank()).ok_or_else(|| {
                    mismatch(node, op, format!("axis {axis} out of range for {first}"))
                })?;
                let mut dims = first.dims().to_vec();
                let mut total = 0usize;
                for s in inputs {
                    let compatible = s.rank() == first.rank()
                        && s.dims()
                            .iter()
                            .zip(first.dims())
                            .enumerate()
                            .all(|(d, (a, b))| d == real || a == b);
                    if !compatible {
                        return Err(mismatch(
                            node,
                            op,
                            format!("cannot concat {s} with {first} along axis {axis}"),
                        ));
                    }
                    let n = s.fixed_dim(real).ok_or_else(|| {
                        mismatch(node, op, format!("cannot concat along the batch axis of {s}"))
                    })?;
                    total = checked_sum(total, n)
                        .ok_or_else(|| mismatch(node, op, "concatenated axis too large".into()))?;
                }
                dims[real] = Dim::Fixed(total);
                Ok(Shape::new(dims))
            }
            _ => {
                let (_, shared, group_ids) = self
                    .group_lookup()
                    .ok_or_else(|| Error::msg(format!("unhandled operator {op}")))?;
                require_rank(node, op, "input", inputs[0], 2)?;
                let mut cols = Vec::with_capacity(inputs.len() - 1);
                for w in &inputs[1..] {
                    require_rank(node, op, "table", w, 2)?;
                    let col = w.fixed_dim(1).filter(|_| w.is_concrete()).ok_or_else(|| {
                        mismatch(node, op, format!("table must be concrete, got {w}"))
                    })?;
                    cols.push(col);
                }
                let total = if shared {
                    checked_total(&[cols[0], group_ids.len()]).ok()
                } else {
                    cols.iter().try_fold(0usize, |acc, &c| checked_sum(acc, c))
                }
                .ok_or_else(|| mismatch(node, op, "output width too large".into()))?;
                Ok(Shape::new(vec![inputs[0].dims()[0], Dim::Fixed(total)]))
            }
        }
    }

    fn forward(&self, inputs: &[TensorRef<'_>], out: &mut Tensor) -> Result<()> {
        if let Some(op) = self.binary() {
            let (a, b) = (inputs[0].dense()?, inputs[1].dense()?);
            return match self {
                OpKind::BroadcastAdd | OpKind::BroadcastMul => broadcast_forward(op, a, b, out),
                _ => binary_forward(op, a, b, out),
            };
        }
        if let Some(act) = self.activation() {
            return activation_forward(act, inputs[0].dense()?, out);
        }
        if let Some(loss) = self.loss() {
            return loss_forward(loss, inputs[0].dense()?, inputs[1].dense()?, out);
        }
        if let Some((red, axis, keep_dim)) = self.reduction() {
            let x = inputs[0].dense()?;
            let axis = runtime_axis(axis, x)?;
            return reduce_forward(red, axis, keep_dim, x, out);
        }
        match self {
            OpKind::Matmul => matmul_forward(inputs[0].dense()?, inputs[1].dense()?, out),
            OpKind::FullyConnect => fully_connect_forward(
                inputs[0].dense()?,
                inputs[1].dense()?,
                inputs[2].dense()?,
                out,
            ),
            OpKind::Reshape { shape } => {
                let x = inputs[0].dense()?;
                let dims = reshape_dims(shape, x)?;
                reshape_forward(x, &dims, out)
            }
            OpKind::Concat { axis } => {
                let tensors = inputs
                    .iter()
                    .map(TensorRef::dense)
                    .collect::<Result<Vec<_>>>()?;
                let real = real_axis(*axis, tensors[0].rank())
                    .ok_or_else(|| Error::msg(format!("concat axis {axis} out of range")))?;
                concat_forward(&tensors, real, out)
            }
            _ => {
                let x = inputs[0].csr()?;
                let tables = OpKind::tables(inputs)?;
                let layout = self.group_layout(&tables)?;
                group_lookup_forward(&layout, x, &tables, out)
            }
        }
    }

    fn backward(
        &self,
        slot: usize,
        inputs: &[TensorRef<'_>],
        y: &Tensor,
        gy: &Tensor,
        gx: GradMut<'_>,
    ) -> Result<()> {
        if let Some(op) = self.binary() {
            let (a, b) = (inputs[0].dense()?, inputs[1].dense()?);
            let gx = gx.dense()?;
            return match self {
                OpKind::BroadcastAdd | OpKind::BroadcastMul => {
                    broadcast_backward(op, slot, a, b, gy, gx)
                }
                _ => binary_backward(op, slot, a, b, gy, gx),
            };
        }
        if let Some(act) = self.activation() {
            return activation_backward(act, y, gy, gx.dense()?);
        }
        if let Some(loss) = self.loss() {
            let (x, t) = (inputs[0].dense()?, inputs[1].dense()?);
            return loss_backward(loss, slot, x, t, gy, gx.dense()?);
        }
        if let Some((red, axis, _)) = self.reduction() {
            let x = inputs[0].dense()?;
            let axis = runtime_axis(axis, x)?;
            return reduce_backward(red, axis, x, gy, gx.dense()?);
        }
        match self {
            OpKind::Matmul => {
                matmul_backward(slot, inputs[0].dense()?, inputs[1].dense()?, gy, gx.dense()?)
            }
            OpKind::FullyConnect => fully_connect_backward(
                slot,
                inputs[0].dense()?,
                inputs[1].dense()?,
                gy,
                gx.dense()?,
            ),
            OpKind::Reshape { .. } => reshape_backward(gy, gx.dense()?),
            OpKind::Concat { axis } => {
                let tensors = inputs
                    .iter()
                    .map(TensorRef::dense)
                    .collect::<Result<Vec<_>>>()?;
                let real = real_axis(*axis, tensors[0].rank())
                    .ok_or_else(|| Error::msg(format!("concat axis {axis} out of range")))?;
                concat_backward(&tensors, real, slot, gy, gx.dense()?)
            }
            _ => {
                if slot == 0 {
                    return Err(Error::msg(format!(
                        "{}: no gradient flows into the sparse input",
                        self.name()
                    )));
                }
                let x = inputs[0].csr()?;
                let tables = OpKind::tables(inputs)?;
                let layout = self.group_layout(&tables)?;
                group_lookup_backward(&layout, x, slot - 1, gy, gx.table())
            }
        }
    }
}

fn runtime_axis(axis: Option<isize>, x: &Tensor) -> Result<Option<usize>> {
    match axis {
        None => Ok(None),
        Some(a) => real_axis(a, x.rank())
            .map(Some)
            .ok_or_else(|| Error::msg(format!("axis {a} out of range for dims {:?}", x.dims()))),
    }
}

/// Concrete reshape target for input `x`, deriving the batch from its size.
fn reshape_dims(shape: &Shape, x: &Tensor) -> Result<Vec<usize>> {
    let per_row = shape.fixed_total()?;
    if per_row == 0 || x.len() % per_row != 0 {
        return Err(Error::msg(format!(
            "cannot reshape {:?} to {shape}",
            x.dims()
        )));
    }
    shape.resolve(x.len() / per_row)
}
