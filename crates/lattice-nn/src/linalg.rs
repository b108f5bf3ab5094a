// Linear algebra kernels: matmul and fully connected layers
//
//   Matmul:         Z = A · B            A: (m, k)  B: (k, n)  Z: (m, n)
//   FullyConnect:   Z = X · W + b        X: (m, k)  W: (k, n)  b: (1, n)
//
// GRADIENTS:
//
//   ∂L/∂A += ∂L/∂Z · Bᵀ
//   ∂L/∂B += Aᵀ · ∂L/∂Z
//   ∂L/∂b += Σ_rows ∂L/∂Z
//
// Every kernel writes one output row at a time, so large problems split the
// rows across the rayon pool. Small ones stay on the calling thread.

use rayon::prelude::*;

use lattice_core::{Error, Result, Tensor};

/// Multiply-adds below which a kernel runs sequentially.
const PARALLEL_MIN_WORK: usize = 1 << 16;

fn for_each_row<F>(out: &mut [f32], width: usize, work: usize, f: F)
where
    F: Fn(usize, &mut [f32]) + Sync,
{
    if width == 0 {
        return;
    }
    if work >= PARALLEL_MIN_WORK {
        out.par_chunks_mut(width)
            .enumerate()
            .for_each(|(i, row)| f(i, row));
    } else {
        out.chunks_mut(width)
            .enumerate()
            .for_each(|(i, row)| f(i, row));
    }
}

fn matrix_dims(t: &Tensor, what: &str) -> Result<(usize, usize)> {
    match t.dims() {
        &[r, c] => Ok((r, c)),
        dims => Err(Error::msg(format!("{what} must be rank 2, got {dims:?}"))),
    }
}

fn check_len(t: &Tensor, expected: usize, what: &str) -> Result<()> {
    if t.len() != expected {
        return Err(Error::msg(format!(
            "{what} has {} elements, expected {expected}",
            t.len()
        )));
    }
    Ok(())
}

/// `out = a · b`.
pub fn matmul_forward(a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
    let (m, k) = matrix_dims(a, "matmul lhs")?;
    let (k2, n) = matrix_dims(b, "matmul rhs")?;
    if k != k2 {
        return Err(Error::msg(format!(
            "matmul inner dims differ: ({m}, {k}) · ({k2}, {n})"
        )));
    }
    out.resize(&[m, n])?;
    let (ad, bd) = (a.data(), b.data());
    for_each_row(out.data_mut(), n, m * k * n, |i, row| {
        row.fill(0.0);
        for p in 0..k {
            let x = ad[i * k + p];
            let b_row = &bd[p * n..(p + 1) * n];
            for (z, &w) in row.iter_mut().zip(b_row) {
                *z += x * w;
            }
        }
    });
    Ok(())
}

/// Accumulate the gradient of matmul input `input` (0 = lhs, 1 = rhs).
pub fn matmul_backward(
    input: usize,
    a: &Tensor,
    b: &Tensor,
    gy: &Tensor,
    gx: &mut Tensor,
) -> Result<()> {
    let (m, k) = matrix_dims(a, "matmul lhs")?;
    let (_, n) = matrix_dims(b, "matmul rhs")?;
    check_len(gy, m * n, "matmul output gradient")?;
    let (ad, bd, g) = (a.data(), b.data(), gy.data());
    if input == 0 {
        check_len(gx, m * k, "matmul lhs gradient")?;
        for_each_row(gx.data_mut(), k, m * k * n, |i, row| {
            let g_row = &g[i * n..(i + 1) * n];
            for (p, dx) in row.iter_mut().enumerate() {
                let b_row = &bd[p * n..(p + 1) * n];
                *dx += g_row.iter().zip(b_row).map(|(&u, &v)| u * v).sum::<f32>();
            }
        });
    } else {
        check_len(gx, k * n, "matmul rhs gradient")?;
        for_each_row(gx.data_mut(), n, m * k * n, |p, row| {
            for i in 0..m {
                let x = ad[i * k + p];
                let g_row = &g[i * n..(i + 1) * n];
                for (dw, &u) in row.iter_mut().zip(g_row) {
                    *dw += x * u;
                }
            }
        });
    }
    Ok(())
}

/// `out = x · w + bias`, the bias row broadcast over every output row.
pub fn fully_connect_forward(x: &Tensor, w: &Tensor, bias: &Tensor, out: &mut Tensor) -> Result<()> {
    matmul_forward(x, w, out)?;
    let n = out.dim(1);
    check_len(bias, n, "fully connect bias")?;
    let bd = bias.data();
    for row in out.data_mut().chunks_mut(n.max(1)) {
        for (z, &c) in row.iter_mut().zip(bd) {
            *z += c;
        }
    }
    Ok(())
}

/// Accumulate the gradient of fully connect input `input` (x, w, bias).
pub fn fully_connect_backward(
    input: usize,
    x: &Tensor,
    w: &Tensor,
    gy: &Tensor,
    gx: &mut Tensor,
) -> Result<()> {
    match input {
        0 | 1 => matmul_backward(input, x, w, gy, gx),
        _ => {
            let n = w.dim(1);
            check_len(gx, n, "fully connect bias gradient")?;
            let db = gx.data_mut();
            for row in gy.data().chunks(n.max(1)) {
                for (d, &u) in db.iter_mut().zip(row) {
                    *d += u;
                }
            }
            Ok(())
        }
    }
}
