#![forbid(unsafe_code)]

//! `rill`: a backtracking bytecode VM for a term-rewriting language.
//!
//! The workspace is split into the bytecode data model ([`bytecode`]) and the interpreter
//! ([`vm`]). This crate re-exports both and adds a label-based [`FunctionBuilder`] for
//! assembling functions by hand.

pub use rill_bytecode as bytecode;
pub use rill_vm as vm;

pub mod builder;

pub use builder::{BuildError, FunctionBuilder, Label};

use rill_bytecode::ExecutableModule;
use rill_vm::{StepResult, Vm, VmError, vm_step};

/// Runs `module` to completion with the default configuration.
pub fn run(module: ExecutableModule) -> Result<StepResult, VmError> {
    let mut vm = Vm::new(module)?;
    Ok(vm_step(&mut vm, None))
}
