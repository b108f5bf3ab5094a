// Shape kernels: reshape and concat
//
// Reshape copies the input buffer into the output with new dims; the
// element order is unchanged, so the gradient is the output gradient read
// back with the input's dims.
//
// Concat joins inputs along `axis`. Each tensor is viewed as
// (outer, width) with width = dims[axis] · inner, and output row o is the
// concatenation of row o of every input:
//
//   a: [2, 1]  b: [2, 3]   axis 1   →   out: [2, 4]
//   out[o] = a[o] ++ b[o]

use lattice_core::{Error, Result, Tensor};

/// Copy `x` into `out` with `dims`; element counts must agree.
pub fn reshape_forward(x: &Tensor, dims: &[usize], out: &mut Tensor) -> Result<()> {
    out.copy_from(x)?;
    out.reshape(dims)
}

pub fn reshape_backward(gy: &Tensor, gx: &mut Tensor) -> Result<()> {
    if gy.len() != gx.len() {
        return Err(Error::msg(format!(
            "reshape gradient has {} elements, input has {}",
            gy.len(),
            gx.len()
        )));
    }
    for (d, &g) in gx.data_mut().iter_mut().zip(gy.data()) {
        *d += g;
    }
    Ok(())
}

/// Output dims of a concat along `axis`.
pub fn concat_dims(inputs: &[&[usize]], axis: usize) -> Result<Vec<usize>> {
    let first = inputs
        .first()
        .ok_or_else(|| Error::msg("concat needs at least one input"))?;
    if axis >= first.len() {
        return Err(Error::msg(format!(
            "concat axis {axis} out of range for dims {first:?}"
        )));
    }
    let mut out = first.to_vec();
    for dims in &inputs[1..] {
        let compatible = dims.len() == first.len()
            && dims
                .iter()
                .zip(first.iter())
                .enumerate()
                .all(|(d, (a, b))| d == axis || a == b);
        if !compatible {
            return Err(Error::msg(format!(
                "cannot concat {dims:?} with {first:?} along axis {axis}"
            )));
        }
        out[axis] += dims[axis];
    }
    Ok(out)
}

fn outer(dims: &[usize], axis: usize) -> usize {
    dims[..axis].iter().product()
}

fn width(dims: &[usize], axis: usize) -> usize {
    dims[axis..].iter().product()
}

pub fn concat_forward(inputs: &[&Tensor], axis: usize, out: &mut Tensor) -> Result<()> {
    let all_dims: Vec<&[usize]> = inputs.iter().map(|t| t.dims()).collect();
    let dims = concat_dims(&all_dims, axis)?;
    out.resize(&dims)?;
    let rows = outer(&dims, axis);
    let out_width = width(&dims, axis);
    let z = out.data_mut();
    let mut offset = 0;
    for t in inputs {
        let w = width(t.dims(), axis);
        for o in 0..rows {
            let dst = o * out_width + offset;
            z[dst..dst + w].copy_from_slice(&t.data()[o * w..(o + 1) * w]);
        }
        offset += w;
    }
    Ok(())
}

/// Accumulate the slice of `gy` belonging to input `input`.
pub fn concat_backward(
    inputs: &[&Tensor],
    axis: usize,
    input: usize,
    gy: &Tensor,
    gx: &mut Tensor,
) -> Result<()> {
    let target = inputs
        .get(input)
        .ok_or_else(|| Error::msg(format!("concat has no input {input}")))?;
    if gx.len() != target.len() {
        return Err(Error::msg(format!(
            "concat input gradient has {} elements, expected {}",
            gx.len(),
            target.len()
        )));
    }
    let offset: usize = inputs[..input]
        .iter()
        .map(|t| width(t.dims(), axis))
        .sum();
    let w = width(target.dims(), axis);
    let rows = outer(target.dims(), axis);
    let out_width = gy.len() / rows.max(1);
    let (g, dx) = (gy.data(), gx.data_mut());
    for o in 0..rows {
        let src = &g[o * out_width + offset..o * out_width + offset + w];
        for (d, &s) in dx[o * w..(o + 1) * w].iter_mut().zip(src) {
            *d += s;
        }
    }
    Ok(())
}
