// TensorMap: named tensor storage
//
// Every runtime tensor in the engine lives in a TensorMap under the name of
// the graph node that owns it:
//
//   params  - persistent variables, shared across contexts and batches
//   inst    - one batch's instance inputs, owned by an OpContext
//   hidden  - operator outputs and gradient buffers, owned by an OpContext
//
// A value has one of three physical representations. They are never
// converted into each other: asking for a dense tensor under a name that
// holds a CSR matrix is a TensorKindMismatch error.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::sparse::{CsrMatrix, SparseRowMatrix};
use crate::tensor::Tensor;

/// Physical representation of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorKind {
    /// Dense row-major tensor.
    Dense,
    /// Sparse row matrix (id-addressed embedding table).
    Srm,
    /// Compressed sparse rows (per-example feature lists).
    Csr,
}

impl fmt::Display for TensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TensorKind::Dense => "dense",
            TensorKind::Srm => "srm",
            TensorKind::Csr => "csr",
        };
        f.write_str(s)
    }
}

/// A stored tensor of any representation.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorValue {
    Dense(Tensor),
    Srm(SparseRowMatrix),
    Csr(CsrMatrix),
}

impl TensorValue {
    pub fn kind(&self) -> TensorKind {
        match self {
            TensorValue::Dense(_) => TensorKind::Dense,
            TensorValue::Srm(_) => TensorKind::Srm,
            TensorValue::Csr(_) => TensorKind::Csr,
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for crate::tensor::Tensor {}
    impl Sealed for crate::sparse::SparseRowMatrix {}
    impl Sealed for crate::sparse::CsrMatrix {}
}

/// The storage types a [`TensorMap`] can hold.
pub trait TensorStorage: sealed::Sealed + Default + Sized {
    const KIND: TensorKind;
    fn from_value(value: &TensorValue) -> Option<&Self>;
    fn from_value_mut(value: &mut TensorValue) -> Option<&mut Self>;
    fn into_value(self) -> TensorValue;
}

macro_rules! impl_storage {
    ($ty:ty, $variant:ident) => {
        impl TensorStorage for $ty {
            const KIND: TensorKind = TensorKind::$variant;

            fn from_value(value: &TensorValue) -> Option<&Self> {
                match value {
                    TensorValue::$variant(t) => Some(t),
                    _ => None,
                }
            }

            fn from_value_mut(value: &mut TensorValue) -> Option<&mut Self> {
                match value {
                    TensorValue::$variant(t) => Some(t),
                    _ => None,
                }
            }

            fn into_value(self) -> TensorValue {
                TensorValue::$variant(self)
            }
        }
    };
}

impl_storage!(Tensor, Dense);
impl_storage!(SparseRowMatrix, Srm);
impl_storage!(CsrMatrix, Csr);

/// Mapping from name to tensor storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorMap {
    map: HashMap<String, TensorValue>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create default storage of kind `K` under `name`.
    pub fn insert<K: TensorStorage>(&mut self, name: &str) -> Result<&mut K> {
        if self.map.contains_key(name) {
            return Err(Error::DuplicateKey(name.to_string()));
        }
        let slot = self
            .map
            .entry(name.to_string())
            .or_insert_with(|| K::default().into_value());
        K::from_value_mut(slot).ok_or_else(|| Error::MissingKey(name.to_string()))
    }

    /// Store an existing value under a new name.
    pub fn insert_value(&mut self, name: &str, value: TensorValue) -> Result<()> {
        if self.map.contains_key(name) {
            return Err(Error::DuplicateKey(name.to_string()));
        }
        self.map.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get<K: TensorStorage>(&self, name: &str) -> Result<&K> {
        let value = self.value(name)?;
        K::from_value(value).ok_or_else(|| Error::TensorKindMismatch {
            name: name.to_string(),
            expected: K::KIND,
            got: value.kind(),
        })
    }

    pub fn get_mut<K: TensorStorage>(&mut self, name: &str) -> Result<&mut K> {
        let value = self
            .map
            .get_mut(name)
            .ok_or_else(|| Error::MissingKey(name.to_string()))?;
        let got = value.kind();
        K::from_value_mut(value).ok_or_else(|| Error::TensorKindMismatch {
            name: name.to_string(),
            expected: K::KIND,
            got,
        })
    }

    /// Existing storage of kind `K`, or fresh default storage.
    ///
    /// A value of another kind under the same name is replaced.
    pub fn get_or_insert<K: TensorStorage>(&mut self, name: &str) -> &mut K {
        match self.map.get(name) {
            Some(v) if v.kind() == K::KIND => {}
            _ => {
                self.map.insert(name.to_string(), K::default().into_value());
            }
        }
        match self.map.get_mut(name).and_then(K::from_value_mut) {
            Some(t) => t,
            None => unreachable!("storage of kind {} was just inserted", K::KIND),
        }
    }

    pub fn value(&self, name: &str) -> Result<&TensorValue> {
        self.map
            .get(name)
            .ok_or_else(|| Error::MissingKey(name.to_string()))
    }

    pub fn value_mut(&mut self, name: &str) -> Result<&mut TensorValue> {
        self.map
            .get_mut(name)
            .ok_or_else(|| Error::MissingKey(name.to_string()))
    }

    pub fn remove(&mut self, name: &str) -> Option<TensorValue> {
        self.map.remove(name)
    }

    /// Move a value out so it can be written while other entries are read.
    /// Pair with [`TensorMap::put`].
    pub fn take(&mut self, name: &str) -> Result<TensorValue> {
        self.map
            .remove(name)
            .ok_or_else(|| Error::MissingKey(name.to_string()))
    }

    /// Store a value, replacing any previous one.
    pub fn put(&mut self, name: &str, value: TensorValue) {
        match self.map.get_mut(name) {
            Some(slot) => *slot = value,
            None => {
                self.map.insert(name.to_string(), value);
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<TensorKind> {
        self.map.get(name).map(TensorValue::kind)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// All names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.map.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorValue)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() -> Result<()> {
        let mut m = TensorMap::new();
        m.insert::<Tensor>("x")?.resize(&[2])?;
        assert_eq!(m.get::<Tensor>("x")?.dims(), &[2]);
        assert!(matches!(
            m.insert::<Tensor>("x"),
            Err(Error::DuplicateKey(_))
        ));
        Ok(())
    }

    #[test]
    fn test_kind_mismatch() -> Result<()> {
        let mut m = TensorMap::new();
        m.insert::<CsrMatrix>("x")?;
        match m.get::<Tensor>("x") {
            Err(Error::TensorKindMismatch { expected, got, .. }) => {
                assert_eq!(expected, TensorKind::Dense);
                assert_eq!(got, TensorKind::Csr);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(m.get::<Tensor>("y"), Err(Error::MissingKey(_))));
        Ok(())
    }

    #[test]
    fn test_get_or_insert_replaces_kind() {
        let mut m = TensorMap::new();
        m.get_or_insert::<SparseRowMatrix>("w").set_col(4).unwrap();
        assert_eq!(m.kind_of("w"), Some(TensorKind::Srm));
        m.get_or_insert::<Tensor>("w");
        assert_eq!(m.kind_of("w"), Some(TensorKind::Dense));
    }

    #[test]
    fn test_take_put() -> Result<()> {
        let mut m = TensorMap::new();
        m.insert::<Tensor>("a")?;
        let v = m.take("a")?;
        assert!(!m.contains("a"));
        m.put("a", v);
        assert_eq!(m.names(), vec!["a"]);
        Ok(())
    }
}
