//! Process-wide op registry: op kind -> (arity, forward kernel, gradient rule).
//!
//! The registry is built once, before the first graph touches it, and is
//! read-only afterwards. [`global`] lazily installs the built-in ops; callers
//! with custom ops build an [`OpRegistry`], register their descriptors (each
//! one carries both capabilities at once), and [`install`] it before any
//! other graph use.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use crate::backward::{GradientContext, GradientInput};
use crate::cmd::{Command, OpKind};
use crate::error::{CoreError, KernelError};
use crate::id::TensorSymbol;
use crate::ops;
use crate::tensor::{TensorView, TensorViewMut};

/// Reference forward implementation of an op, run by CPU backends.
pub type ForwardKernel =
    fn(&Command, &[TensorView<'_>], &mut [TensorViewMut<'_>]) -> Result<(), KernelError>;

/// Gradient rule: given the forward exec and the gradients of its outputs,
/// emits backward execs and returns one optional gradient per input.
pub type GradientRule = fn(
    &mut GradientContext<'_>,
    &GradientInput<'_>,
) -> Result<Vec<Option<TensorSymbol>>, CoreError>;

/// Accepted number of inputs or outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Any,
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == n,
            Arity::AtLeast(n) => count >= n,
            Arity::Any => true,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
            Arity::Any => write!(f, "any number of"),
        }
    }
}

/// Everything the system knows about one op kind.
#[derive(Debug, Clone, Copy)]
pub struct OpDescriptor {
    pub kind: OpKind,
    pub name: &'static str,
    pub inputs: Arity,
    pub outputs: Arity,
    pub forward: Option<ForwardKernel>,
    pub gradient: Option<GradientRule>,
}

impl OpDescriptor {
    /// Checks an exec's input and output counts against this op.
    pub fn check_arity(&self, inputs: usize, outputs: usize) -> Result<(), CoreError> {
        if !self.inputs.accepts(inputs) {
            return Err(CoreError::ArityMismatch {
                kind: self.kind,
                what: "inputs",
                expected: self.inputs.to_string(),
                found: inputs,
            });
        }
        if !self.outputs.accepts(outputs) {
            return Err(CoreError::ArityMismatch {
                kind: self.kind,
                what: "outputs",
                expected: self.outputs.to_string(),
                found: outputs,
            });
        }
        Ok(())
    }
}

/// Dispatch table keyed by [`OpKind`].
#[derive(Debug, Clone, Default)]
pub struct OpRegistry {
    ops: HashMap<OpKind, OpDescriptor>,
}

impl OpRegistry {
    /// An empty registry, without even the built-in ops.
    pub fn empty() -> Self {
        OpRegistry::default()
    }

    /// A registry holding every built-in op.
    pub fn with_builtins() -> Self {
        let mut registry = OpRegistry::empty();
        for descriptor in ops::builtins() {
            registry.ops.insert(descriptor.kind, descriptor);
        }
        registry
    }

    /// Adds an op. Fails if the kind is already present.
    pub fn register(&mut self, descriptor: OpDescriptor) -> Result<(), CoreError> {
        if self.ops.contains_key(&descriptor.kind) {
            return Err(CoreError::DuplicateOp {
                kind: descriptor.kind,
            });
        }
        self.ops.insert(descriptor.kind, descriptor);
        Ok(())
    }

    pub fn get(&self, kind: OpKind) -> Option<&OpDescriptor> {
        self.ops.get(&kind)
    }

    pub fn forward(&self, kind: OpKind) -> Option<ForwardKernel> {
        self.get(kind).and_then(|d| d.forward)
    }

    pub fn gradient(&self, kind: OpKind) -> Option<GradientRule> {
        self.get(kind).and_then(|d| d.gradient)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

static GLOBAL: OnceLock<OpRegistry> = OnceLock::new();

/// The process-wide registry, initialized with the built-ins on first use.
pub fn global() -> &'static OpRegistry {
    GLOBAL.get_or_init(OpRegistry::with_builtins)
}

/// Installs `registry` as the process-wide registry.
///
/// Must run before anything calls [`global`]; otherwise the registry is
/// handed back unchanged.
pub fn install(registry: OpRegistry) -> Result<(), OpRegistry> {
    GLOBAL.set(registry)
}
