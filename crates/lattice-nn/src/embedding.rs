// Group embedding lookup: pooled per-group embeddings of sparse features
//
// Each example is a CSR row of (feature_id, value) pairs. The top bits of a
// feature id name its group (16 or 18 bits, see lattice_core::sparse). A
// lookup lists the groups it handles; group j owns a column slice of the
// output starting at offset_j:
//
//   out[i, offset_j .. offset_j + col_j] += value · W_j[r]
//
// for every feature (id, value) of example i whose group is j. Features of
// unlisted groups are ignored. The row r is the feature id itself for a
// sparse-row table and `id % rows` for a dense table.
//
// Two table layouts exist:
//
//   per group:  one table W_j per listed group, widths may differ
//   shared:     every group reads the same table W, so all slices have W's
//               width and the output is (B, n · col)
//
// Backward scatters `value · ∂L/∂out[i, slice_j]` into the row of W_j that
// the forward read. Sparse-row gradient tables only get rows that were
// actually touched.

use std::collections::HashMap;

use lattice_core::{
    group_id_16, group_id_18, CsrMatrix, Error, Result, SparseRowMatrix, Tensor,
};

/// Where the group id lives in a feature id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupBits {
    /// Bits 48..64.
    Bits16,
    /// Bits 46..64.
    Bits18,
}

impl GroupBits {
    #[inline]
    pub fn group_id(self, feature_id: u64) -> u32 {
        match self {
            GroupBits::Bits16 => group_id_16(feature_id),
            GroupBits::Bits18 => group_id_18(feature_id),
        }
    }

    /// Largest group id representable in this layout.
    pub fn max_group_id(self) -> u32 {
        match self {
            GroupBits::Bits16 => u16::MAX as u32,
            GroupBits::Bits18 => (1 << 18) - 1,
        }
    }
}

/// Read access to one embedding table.
#[derive(Debug, Clone, Copy)]
pub enum TableRef<'a> {
    Dense(&'a Tensor),
    Srm(&'a SparseRowMatrix),
}

impl<'a> TableRef<'a> {
    pub fn col(&self) -> usize {
        match self {
            TableRef::Dense(t) => t.dim(1),
            TableRef::Srm(m) => m.col(),
        }
    }

    /// The row read for `feature_id`, or `None` for an absent sparse row.
    fn row(&self, feature_id: u64) -> Option<&'a [f32]> {
        match *self {
            TableRef::Dense(t) => {
                let rows = t.dim(0) as u64;
                let col = t.dim(1);
                if rows == 0 {
                    return None;
                }
                let r = (feature_id % rows) as usize;
                Some(&t.data()[r * col..(r + 1) * col])
            }
            TableRef::Srm(m) => m.row(feature_id),
        }
    }
}

/// Write access to one embedding table gradient.
#[derive(Debug)]
pub enum TableGradMut<'a> {
    Dense(&'a mut Tensor),
    Srm(&'a mut SparseRowMatrix),
}

impl TableGradMut<'_> {
    fn row_mut(&mut self, feature_id: u64) -> Option<&mut [f32]> {
        match self {
            TableGradMut::Dense(t) => {
                let rows = t.dim(0) as u64;
                let col = t.dim(1);
                if rows == 0 {
                    return None;
                }
                let r = (feature_id % rows) as usize;
                Some(&mut t.data_mut()[r * col..(r + 1) * col])
            }
            TableGradMut::Srm(m) => Some(m.row_mut(feature_id)),
        }
    }
}

/// Column layout of a group lookup's output.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupLayout {
    bits: GroupBits,
    shared: bool,
    slots: HashMap<u32, usize>,
    offsets: Vec<usize>,
    cols: Vec<usize>,
    total_col: usize,
}

impl GroupLayout {
    /// One table per group; `cols[j]` is the width of group `group_ids[j]`.
    pub fn per_group(bits: GroupBits, group_ids: &[u32], cols: &[usize]) -> Result<Self> {
        if group_ids.len() != cols.len() {
            return Err(Error::msg(format!(
                "{} group ids but {} table widths",
                group_ids.len(),
                cols.len()
            )));
        }
        Self::build(bits, false, group_ids, cols)
    }

    /// One table of width `col` shared by every group.
    pub fn shared(bits: GroupBits, group_ids: &[u32], col: usize) -> Result<Self> {
        let cols = vec![col; group_ids.len()];
        Self::build(bits, true, group_ids, &cols)
    }

    fn build(bits: GroupBits, shared: bool, group_ids: &[u32], cols: &[usize]) -> Result<Self> {
        if group_ids.is_empty() {
            return Err(Error::msg("group lookup needs at least one group"));
        }
        let mut slots = HashMap::with_capacity(group_ids.len());
        let mut offsets = Vec::with_capacity(group_ids.len());
        let mut total_col = 0usize;
        for (j, (&gid, &col)) in group_ids.iter().zip(cols).enumerate() {
            if gid > bits.max_group_id() {
                return Err(Error::msg(format!(
                    "group id {gid} exceeds {} for {bits:?} feature ids",
                    bits.max_group_id()
                )));
            }
            if slots.insert(gid, j).is_some() {
                return Err(Error::msg(format!("duplicate group id {gid}")));
            }
            offsets.push(total_col);
            total_col += col;
        }
        Ok(GroupLayout {
            bits,
            shared,
            slots,
            offsets,
            cols: cols.to_vec(),
            total_col,
        })
    }

    pub fn bits(&self) -> GroupBits {
        self.bits
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Number of listed groups.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Width of one output row.
    pub fn total_col(&self) -> usize {
        self.total_col
    }

    /// Number of tables the lookup reads.
    pub fn table_count(&self) -> usize {
        if self.shared {
            1
        } else {
            self.len()
        }
    }

    #[inline]
    fn slot(&self, feature_id: u64) -> Option<usize> {
        self.slots.get(&self.bits.group_id(feature_id)).copied()
    }

    #[inline]
    fn table_of(&self, slot: usize) -> usize {
        if self.shared {
            0
        } else {
            slot
        }
    }

    fn check_tables(&self, tables: &[TableRef<'_>]) -> Result<()> {
        if tables.len() != self.table_count() {
            return Err(Error::msg(format!(
                "group lookup expects {} tables, got {}",
                self.table_count(),
                tables.len()
            )));
        }
        for (j, &col) in self.cols.iter().enumerate() {
            let got = tables[self.table_of(j)].col();
            if got != col {
                return Err(Error::msg(format!(
                    "group lookup table for slot {j} has width {got}, expected {col}"
                )));
            }
        }
        Ok(())
    }
}

/// Pool the embeddings of every listed group into `out` (B, total_col).
pub fn group_lookup_forward(
    layout: &GroupLayout,
    x: &CsrMatrix,
    tables: &[TableRef<'_>],
    out: &mut Tensor,
) -> Result<()> {
    layout.check_tables(tables)?;
    let total = layout.total_col;
    out.resize(&[x.rows(), total])?;
    out.zero();
    let z = out.data_mut();
    for i in 0..x.rows() {
        let out_row = &mut z[i * total..(i + 1) * total];
        for (id, value) in x.row(i) {
            let Some(j) = layout.slot(id) else { continue };
            let Some(w) = tables[layout.table_of(j)].row(id) else {
                continue;
            };
            let off = layout.offsets[j];
            for (d, &e) in out_row[off..off + layout.cols[j]].iter_mut().zip(w) {
                *d += value * e;
            }
        }
    }
    Ok(())
}

/// Accumulate the gradient of table `table` from the output gradient `gy`.
pub fn group_lookup_backward(
    layout: &GroupLayout,
    x: &CsrMatrix,
    table: usize,
    gy: &Tensor,
    mut grad: TableGradMut<'_>,
) -> Result<()> {
    let total = layout.total_col;
    if gy.len() != x.rows() * total {
        return Err(Error::msg(format!(
            "group lookup gradient has {} elements, expected {}",
            gy.len(),
            x.rows() * total
        )));
    }
    if table >= layout.table_count() {
        return Err(Error::msg(format!("group lookup has no table {table}")));
    }
    let g = gy.data();
    for i in 0..x.rows() {
        let g_row = &g[i * total..(i + 1) * total];
        for (id, value) in x.row(i) {
            let Some(j) = layout.slot(id) else { continue };
            if layout.table_of(j) != table {
                continue;
            }
            let Some(dw) = grad.row_mut(id) else { continue };
            let off = layout.offsets[j];
            for (d, &u) in dw.iter_mut().zip(&g_row[off..off + layout.cols[j]]) {
                *d += value * u;
            }
        }
    }
    Ok(())
}
