pub mod autogen;
pub mod backward;
pub mod case_of;
pub mod cmd;
pub mod error;
pub mod export;
pub mod graph;
pub mod id;
pub mod registry;
pub mod symbol;
pub mod tensor;

mod ops;

// Re-export commonly used types
pub use autogen::AutogenFlags;
pub use backward::{backward, BackwardOptions, GradientContext, GradientInput, Gradients};
pub use case_of::{BackwardBranch, CaseOf, CaseOfBackward, CaseOfBranch, CaseOfPredicate, PASS_THROUGH};
pub use cmd::{BackendId, Command, OpKind};
pub use error::{CoreError, KernelError, ScopeFault};
pub use graph::SymbolicGraph;
pub use id::{ExecSymbol, ScopeId, TensorSymbol};
pub use registry::{Arity, OpDescriptor, OpRegistry};
pub use symbol::{ExecKind, ExecSymbolInfo, Pass, SymbolTable, TensorSymbolInfo};
pub use tensor::{DataType, TensorParams, TensorView, TensorViewMut};
