#![forbid(unsafe_code)]

//! A register-based interpreter for backtracking programs.
//!
//! The VM runs [`rill_bytecode::ExecutableModule`]s. Beyond ordinary calls it provides
//! cooperative coroutines, overloaded dispatch over scoped candidate sets, and backtracking
//! regions whose binding mutations can be rolled back.

mod cache;
mod condition;
mod config;
mod coroutine;
pub mod dispatch;
mod error;
mod frame;
mod intern;
mod metrics;
mod scope;
mod value;
mod vm;

pub use cache::{BindingKey, Cache};
pub use condition::{Condition, ConditionKind, StackTrace, StackTraceEntry};
pub use config::VmConfig;
pub use coroutine::{Coroutine, CoroutineId, CoroutineState};
pub use dispatch::CandidateSet;
pub use error::{InternalError, VmError};
pub use frame::{CallerLink, Frame, FrameId, FrameInfo, FrameRef};
pub use intern::NodeInterner;
pub use metrics::VmMetrics;
pub use scope::{Scope, ScopeId, Scopes};
pub use value::{Node, Value};
pub use vm::{StepResult, Vm, vm_step};
