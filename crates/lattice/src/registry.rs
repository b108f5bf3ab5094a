// Operator registry: build operators by type name
//
// Graph definitions that arrive as text (a model description, a test
// fixture) name operators by string and carry their parameters in an
// attribute bag. The registry maps each name to a builder:
//
//   "ReduceMean" + { axis: 1, keep_dim: 1 }  ->  OpKind::ReduceMean { .. }
//
// The built-in table is static. `global()` indexes it once per process;
// `OpRegistry::with_builtins()` gives an owned copy that callers may extend
// with aliases.
//
// ATTRIBUTES:
//
//   axis       Int      ReduceSum / ReduceMean (optional), Concat (default -1)
//   keep_dim   Int      ReduceSum / ReduceMean, 0 or 1 (default 0)
//   shape      Shape    Reshape
//   group_ids  Ints     the four group embedding lookups

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use once_cell::sync::Lazy;

use lattice_core::{Error, Result, Shape};

use crate::graph::OpKind;

/// Signature of an operator builder.
pub type BuildFn = fn(&Attrs) -> Result<OpKind>;

#[derive(Clone, Copy)]
pub struct OpFactory {
    pub name: &'static str,
    pub build: BuildFn,
}

impl fmt::Debug for OpFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpFactory").field("name", &self.name).finish()
    }
}

static BUILTINS: &[OpFactory] = &[
    OpFactory { name: "Add", build: build_add },
    OpFactory { name: "Sub", build: build_sub },
    OpFactory { name: "Mul", build: build_mul },
    OpFactory { name: "Div", build: build_div },
    OpFactory { name: "BroadcastAdd", build: build_broadcast_add },
    OpFactory { name: "BroadcastMul", build: build_broadcast_mul },
    OpFactory { name: "Sigmoid", build: build_sigmoid },
    OpFactory { name: "Tanh", build: build_tanh },
    OpFactory { name: "Relu", build: build_relu },
    OpFactory { name: "Matmul", build: build_matmul },
    OpFactory { name: "FullyConnect", build: build_fully_connect },
    OpFactory { name: "ReduceSum", build: build_reduce_sum },
    OpFactory { name: "ReduceMean", build: build_reduce_mean },
    OpFactory { name: "SigmoidBCELoss", build: build_sigmoid_bce_loss },
    OpFactory { name: "SquareError", build: build_square_error },
    OpFactory { name: "AbsoluteError", build: build_absolute_error },
    OpFactory { name: "Reshape", build: build_reshape },
    OpFactory { name: "Concat", build: build_concat },
    OpFactory { name: "GroupEmbeddingLookup", build: build_group_embedding_lookup },
    OpFactory { name: "GroupEmbeddingLookup2", build: build_group_embedding_lookup2 },
    OpFactory { name: "Group18EmbeddingLookup", build: build_group18_embedding_lookup },
    OpFactory { name: "Group18EmbeddingLookup2", build: build_group18_embedding_lookup2 },
];

/// The built-in operator factories.
pub fn builtins() -> &'static [OpFactory] {
    BUILTINS
}

static GLOBAL: Lazy<OpRegistry> = Lazy::new(OpRegistry::with_builtins);

/// The process-wide registry of built-in operators.
pub fn global() -> &'static OpRegistry {
    &GLOBAL
}

/// Name to builder map.
#[derive(Debug, Clone, Default)]
pub struct OpRegistry {
    builders: HashMap<String, BuildFn>,
}

impl OpRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut builders = HashMap::with_capacity(BUILTINS.len());
        for entry in BUILTINS {
            builders.insert(entry.name.to_string(), entry.build);
        }
        OpRegistry { builders }
    }

    /// Add a builder. Names are unique.
    pub fn register(&mut self, name: impl Into<String>, build: BuildFn) -> Result<()> {
        let name = name.into();
        if self.builders.contains_key(&name) {
            return Err(Error::Registry(format!("operator '{name}' already registered")));
        }
        self.builders.insert(name, build);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    pub fn build(&self, name: &str, attrs: &Attrs) -> Result<OpKind> {
        let build = self
            .builders
            .get(name)
            .ok_or_else(|| Error::Registry(format!("unknown operator '{name}'")))?;
        build(attrs)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

// Attributes

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Ints(Vec<i64>),
    Shape(Shape),
}

impl AttrValue {
    fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::Ints(_) => "ints",
            AttrValue::Shape(_) => "shape",
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Int(i64::from(v))
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<Vec<i64>> for AttrValue {
    fn from(v: Vec<i64>) -> Self {
        AttrValue::Ints(v)
    }
}

impl From<Shape> for AttrValue {
    fn from(v: Shape) -> Self {
        AttrValue::Shape(v)
    }
}

/// Typed attribute bag passed to operator builders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attrs {
    values: BTreeMap<String, AttrValue>,
}

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Attrs::set`].
    pub fn with(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<AttrValue>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.values.get(key)
    }

    pub fn int(&self, key: &str) -> Result<i64> {
        match self.require(key)? {
            AttrValue::Int(v) => Ok(*v),
            other => Err(ill_typed(key, "int", other)),
        }
    }

    pub fn float(&self, key: &str) -> Result<f64> {
        match self.require(key)? {
            AttrValue::Float(v) => Ok(*v),
            AttrValue::Int(v) => Ok(*v as f64),
            other => Err(ill_typed(key, "float", other)),
        }
    }

    pub fn ints(&self, key: &str) -> Result<&[i64]> {
        match self.require(key)? {
            AttrValue::Ints(v) => Ok(v),
            other => Err(ill_typed(key, "ints", other)),
        }
    }

    pub fn shape(&self, key: &str) -> Result<&Shape> {
        match self.require(key)? {
            AttrValue::Shape(v) => Ok(v),
            other => Err(ill_typed(key, "shape", other)),
        }
    }

    /// Optional int.
    pub fn int_opt(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(_) => self.int(key).map(Some),
        }
    }

    /// An int restricted to 0 or 1, `default` when absent.
    pub fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.int_opt(key)? {
            None => Ok(default),
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            Some(v) => Err(Error::Registry(format!(
                "attribute '{key}' must be 0 or 1, got {v}"
            ))),
        }
    }

    fn require(&self, key: &str) -> Result<&AttrValue> {
        self.values
            .get(key)
            .ok_or_else(|| Error::Registry(format!("missing attribute '{key}'")))
    }
}

fn ill_typed(key: &str, expected: &str, got: &AttrValue) -> Error {
    Error::Registry(format!(
        "attribute '{key}' must be {expected}, got {}",
        got.type_name()
    ))
}

// Built-in builders

fn build_add(_: &Attrs) -> Result<OpKind> {
    Ok(OpKind::Add)
}

fn build_sub(_: &Attrs) -> Result<OpKind> {
    Ok(OpKind::Sub)
}

fn build_mul(_: &Attrs) -> Result<OpKind> {
    Ok(OpKind::Mul)
}

fn build_div(_: &Attrs) -> Result<OpKind> {
    Ok(OpKind::Div)
}

fn build_broadcast_add(_: &Attrs) -> Result<OpKind> {
    Ok(OpKind::BroadcastAdd)
}

fn build_broadcast_mul(_: &Attrs) -> Result<OpKind> {
    Ok(OpKind::BroadcastMul)
}

fn build_sigmoid(_: &Attrs) -> Result<OpKind> {
    Ok(OpKind::Sigmoid)
}

fn build_tanh(_: &Attrs) -> Result<OpKind> {
    Ok(OpKind::Tanh)
}

fn build_relu(_: &Attrs) -> Result<OpKind> {
    Ok(OpKind::Relu)
}

fn build_matmul(_: &Attrs) -> Result<OpKind> {
    Ok(OpKind::Matmul)
}

fn build_fully_connect(_: &Attrs) -> Result<OpKind> {
    Ok(OpKind::FullyConnect)
}

fn reduce_attrs(attrs: &Attrs) -> Result<(Option<isize>, bool)> {
    let axis = attrs.int_opt("axis")?.map(to_axis).transpose()?;
    Ok((axis, attrs.flag("keep_dim", false)?))
}

fn build_reduce_sum(attrs: &Attrs) -> Result<OpKind> {
    let (axis, keep_dim) = reduce_attrs(attrs)?;
    Ok(OpKind::ReduceSum { axis, keep_dim })
}

fn build_reduce_mean(attrs: &Attrs) -> Result<OpKind> {
    let (axis, keep_dim) = reduce_attrs(attrs)?;
    Ok(OpKind::ReduceMean { axis, keep_dim })
}

fn build_sigmoid_bce_loss(_: &Attrs) -> Result<OpKind> {
    Ok(OpKind::SigmoidBceLoss)
}

fn build_square_error(_: &Attrs) -> Result<OpKind> {
    Ok(OpKind::SquareError)
}

fn build_absolute_error(_: &Attrs) -> Result<OpKind> {
    Ok(OpKind::AbsoluteError)
}

fn build_reshape(attrs: &Attrs) -> Result<OpKind> {
    Ok(OpKind::Reshape {
        shape: attrs.shape("shape")?.clone(),
    })
}

fn build_concat(attrs: &Attrs) -> Result<OpKind> {
    let axis = to_axis(attrs.int_opt("axis")?.unwrap_or(-1))?;
    Ok(OpKind::Concat { axis })
}

fn build_group_embedding_lookup(attrs: &Attrs) -> Result<OpKind> {
    Ok(OpKind::GroupEmbeddingLookup {
        group_ids: group_ids(attrs)?,
    })
}

fn build_group_embedding_lookup2(attrs: &Attrs) -> Result<OpKind> {
    Ok(OpKind::GroupEmbeddingLookup2 {
        group_ids: group_ids(attrs)?,
    })
}

fn build_group18_embedding_lookup(attrs: &Attrs) -> Result<OpKind> {
    Ok(OpKind::Group18EmbeddingLookup {
        group_ids: group_ids(attrs)?,
    })
}

fn build_group18_embedding_lookup2(attrs: &Attrs) -> Result<OpKind> {
    Ok(OpKind::Group18EmbeddingLookup2 {
        group_ids: group_ids(attrs)?,
    })
}

fn to_axis(v: i64) -> Result<isize> {
    isize::try_from(v).map_err(|_| Error::Registry(format!("axis {v} out of range")))
}

fn group_ids(attrs: &Attrs) -> Result<Vec<u32>> {
    attrs
        .ints("group_ids")?
        .iter()
        .map(|&id| {
            u32::try_from(id).map_err(|_| Error::Registry(format!("invalid group id: {id}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Operator;

    #[test]
    fn test_builtin_names_match_operators() -> Result<()> {
        let attrs = Attrs::new()
            .with("shape", Shape::batch(&[2]))
            .with("group_ids", vec![1i64, 2]);
        for entry in builtins() {
            let op = (entry.build)(&attrs)?;
            assert_eq!(op.name(), entry.name);
        }
        Ok(())
    }

    #[test]
    fn test_global_lookup() -> Result<()> {
        let reg = global();
        assert_eq!(reg.len(), builtins().len());
        let op = reg.build(
            "ReduceMean",
            &Attrs::new().with("axis", 1i64).with("keep_dim", true),
        )?;
        assert_eq!(
            op,
            OpKind::ReduceMean {
                axis: Some(1),
                keep_dim: true
            }
        );
        assert!(matches!(
            reg.build("Softmax", &Attrs::new()),
            Err(Error::Registry(_))
        ));
        Ok(())
    }

    #[test]
    fn test_register_alias() -> Result<()> {
        let mut reg = OpRegistry::with_builtins();
        reg.register("Dense", build_fully_connect)?;
        assert_eq!(reg.build("Dense", &Attrs::new())?, OpKind::FullyConnect);
        assert!(reg.register("Add", build_add).is_err());
        let names = reg.names();
        assert!(names.windows(2).all(|w| w[0] < w[1]));
        assert!(!global().contains("Dense"));
        Ok(())
    }

    #[test]
    fn test_attr_errors() {
        let attrs = Attrs::new().with("axis", 1.5).with("keep_dim", 2i64);
        assert!(attrs.int("axis").is_err());
        assert!(attrs.flag("keep_dim", false).is_err());
        assert!(attrs.shape("shape").is_err());
        assert!(global().build("Reshape", &attrs).is_err());
        let attrs = Attrs::new().with("group_ids", vec![-1i64]);
        assert!(global().build("GroupEmbeddingLookup", &attrs).is_err());
    }

    #[test]
    fn test_concat_default_axis() -> Result<()> {
        assert_eq!(
            global().build("Concat", &Attrs::new())?,
            OpKind::Concat { axis: -1 }
        );
        Ok(())
    }
}
