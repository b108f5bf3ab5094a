// Sparse storage: id-addressed tables and per-example feature lists
//
// SparseRowMatrix: an embedding table addressed by entity id. Only rows that
// were touched exist, so a vocabulary of 2^64 ids costs nothing until used.
// Missing rows read as zeros.
//
// CsrMatrix: compressed sparse rows for raw categorical inputs. Row i holds
// the (feature_id, value) pairs of example i:
//
//   row_offset: [0, 2, 3]
//   ids:        [f0, f1, f2]
//   values:     [v0, v1, v2]
//
//   example 0 → (f0, v0), (f1, v1)
//   example 1 → (f2, v2)
//
// Feature ids carry their group id in the top bits. Two layouts exist: a
// 16-bit group id in bits 48..64 and an 18-bit group id in bits 46..64.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Group id of a feature under the 16-bit layout.
pub fn group_id_16(feature_id: u64) -> u32 {
    (feature_id >> 48) as u32
}

/// Group id of a feature under the 18-bit layout.
pub fn group_id_18(feature_id: u64) -> u32 {
    (feature_id >> 46) as u32
}

/// Compose a feature id under the 16-bit group layout.
pub fn make_feature_id_16(group_id: u16, sub_id: u64) -> u64 {
    ((group_id as u64) << 48) | (sub_id & ((1u64 << 48) - 1))
}

/// Compose a feature id under the 18-bit group layout.
pub fn make_feature_id_18(group_id: u32, sub_id: u64) -> u64 {
    (((group_id as u64) & ((1u64 << 18) - 1)) << 46) | (sub_id & ((1u64 << 46) - 1))
}

/// Rows of width `col` addressed by `u64` id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseRowMatrix {
    col: usize,
    rows: HashMap<u64, Vec<f32>>,
}

impl SparseRowMatrix {
    pub fn new(col: usize) -> Self {
        SparseRowMatrix {
            col,
            rows: HashMap::new(),
        }
    }

    /// Row width.
    pub fn col(&self) -> usize {
        self.col
    }

    /// Change the row width; only legal while the table is empty.
    pub fn set_col(&mut self, col: usize) -> Result<()> {
        if !self.rows.is_empty() && col != self.col {
            return Err(Error::msg(format!(
                "cannot change width of a non-empty sparse table from {} to {col}",
                self.col
            )));
        }
        self.col = col;
        Ok(())
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.rows.contains_key(&id)
    }

    pub fn row(&self, id: u64) -> Option<&[f32]> {
        self.rows.get(&id).map(Vec::as_slice)
    }

    /// Mutable row, inserting a zero row when missing.
    pub fn row_mut(&mut self, id: u64) -> &mut [f32] {
        let col = self.col;
        self.rows.entry(id).or_insert_with(|| vec![0.0; col])
    }

    /// Store a full row.
    pub fn insert_row(&mut self, id: u64, row: Vec<f32>) -> Result<()> {
        if row.len() != self.col {
            return Err(Error::msg(format!(
                "row {id} has width {}, table width is {}",
                row.len(),
                self.col
            )));
        }
        self.rows.insert(id, row);
        Ok(())
    }

    /// Rows sorted by id.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[f32])> {
        let mut ids: Vec<u64> = self.rows.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().map(move |id| (id, self.rows[&id].as_slice()))
    }

    /// Drop all rows, keeping the width.
    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

/// Compressed sparse rows of `(feature_id, value)` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    row_offset: Vec<usize>,
    ids: Vec<u64>,
    values: Vec<f32>,
}

impl Default for CsrMatrix {
    fn default() -> Self {
        Self::new()
    }
}

impl CsrMatrix {
    pub fn new() -> Self {
        CsrMatrix {
            row_offset: vec![0],
            ids: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Build from per-example feature lists.
    pub fn from_rows<R>(rows: impl IntoIterator<Item = R>) -> Self
    where
        R: IntoIterator<Item = (u64, f32)>,
    {
        let mut csr = CsrMatrix::new();
        for row in rows {
            for (id, value) in row {
                csr.add(id, value);
            }
            csr.add_row();
        }
        csr
    }

    /// Append a feature to the row under construction.
    pub fn add(&mut self, feature_id: u64, value: f32) {
        self.ids.push(feature_id);
        self.values.push(value);
    }

    /// Close the row under construction.
    pub fn add_row(&mut self) {
        self.row_offset.push(self.ids.len());
    }

    /// Number of completed rows.
    pub fn rows(&self) -> usize {
        self.row_offset.len() - 1
    }

    /// Number of stored features.
    pub fn nnz(&self) -> usize {
        self.ids.len()
    }

    /// Features of example `i`; empty when out of range.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (u64, f32)> + '_ {
        let (begin, end) = match (self.row_offset.get(i), self.row_offset.get(i + 1)) {
            (Some(&b), Some(&e)) => (b, e),
            _ => (0, 0),
        };
        self.ids[begin..end]
            .iter()
            .copied()
            .zip(self.values[begin..end].iter().copied())
    }

    pub fn clear(&mut self) {
        self.row_offset.clear();
        self.row_offset.push(0);
        self.ids.clear();
        self.values.clear();
    }
}
