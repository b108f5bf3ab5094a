use crate::shape::Shape;
use crate::tensor_map::TensorKind;

/// All errors that can occur within lattice.
///
/// One enum covers graph definition, compilation, runtime binding, tensor map
/// access and group-config parsing. [`Error::category`] recovers the coarse
/// class of a failure when a caller needs to decide whether the graph, the
/// batch, or the configuration is at fault.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A node was declared with a shape it cannot have.
    #[error("invalid shape {shape} for node '{name}': {reason}")]
    InvalidShape {
        name: String,
        shape: Shape,
        reason: String,
    },

    /// A node id does not belong to the graph it was used with.
    #[error("unknown node {0}")]
    UnknownNode(String),

    /// A node name that collides with a reserved buffer name.
    #[error("invalid node name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// An operator received the wrong number of inputs.
    #[error("operator {op} on '{name}' expects {expected} inputs, got {got}")]
    Arity {
        name: String,
        op: &'static str,
        expected: String,
        got: usize,
    },

    /// Operator parameters that can never be valid.
    #[error("invalid {op} operator '{name}': {reason}")]
    InvalidOp {
        name: String,
        op: &'static str,
        reason: String,
    },

    /// Operator registry lookup or registration failure.
    #[error("registry: {0}")]
    Registry(String),

    /// The predecessor edges of the graph contain a cycle.
    #[error("cyclic graph: node '{name}' depends on itself")]
    CyclicGraph { name: String },

    /// Two nodes in one graph share a name.
    #[error("duplicate node name '{name}'")]
    DuplicateName { name: String },

    /// An operator's shape inference rejected its operand shapes.
    #[error("shape mismatch at '{name}' ({op}): {message}")]
    ShapeMismatch {
        name: String,
        op: &'static str,
        message: String,
    },

    /// A compile or plan target is not a node of this graph.
    #[error("unknown target {0}")]
    UnknownTarget(String),

    /// The graph must be compiled before it can be planned or executed.
    #[error("graph is not compiled")]
    NotCompiled,

    /// Runtime data does not match the compiled plan.
    #[error("binding '{name}': expected {expected}, got {got}")]
    Binding {
        name: String,
        expected: String,
        got: String,
    },

    /// A tensor was stored or declared with a different representation.
    #[error("tensor kind mismatch for '{name}': expected {expected}, got {got}")]
    TensorKindMismatch {
        name: String,
        expected: TensorKind,
        got: TensorKind,
    },

    /// No tensor is stored under the requested key.
    #[error("missing tensor '{0}'")]
    MissingKey(String),

    /// A tensor is already stored under the key.
    #[error("duplicate tensor '{0}'")]
    DuplicateKey(String),

    /// Malformed or inconsistent group config.
    #[error("group config{}: {message}", line.map(|l| format!(" line {l}")).unwrap_or_default())]
    Config {
        line: Option<usize>,
        message: String,
    },

    /// Reading a group config file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid node or operator declarations.
    Definition,
    /// Cycles, duplicate names, shape inference and target failures.
    Compile,
    /// Instance or parameter data that does not fit the compiled plan.
    RuntimeBinding,
    /// Missing or duplicate tensor map entries.
    Key,
    /// Group-config input errors.
    Config,
    Other,
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Create a config error, optionally tied to a 1-based line number.
    pub fn config(line: Option<usize>, message: impl Into<String>) -> Self {
        Error::Config {
            line,
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidShape { .. }
            | Error::InvalidName { .. }
            | Error::UnknownNode(_)
            | Error::Arity { .. }
            | Error::InvalidOp { .. }
            | Error::Registry(_) => ErrorCategory::Definition,
            Error::CyclicGraph { .. }
            | Error::DuplicateName { .. }
            | Error::ShapeMismatch { .. }
            | Error::UnknownTarget(_)
            | Error::NotCompiled => ErrorCategory::Compile,
            Error::Binding { .. } | Error::TensorKindMismatch { .. } => {
                ErrorCategory::RuntimeBinding
            }
            Error::MissingKey(_) | Error::DuplicateKey(_) => ErrorCategory::Key,
            Error::Config { .. } | Error::Io(_) => ErrorCategory::Config,
            Error::Msg(_) => ErrorCategory::Other,
        }
    }
}

/// Convenience Result type used throughout lattice.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
