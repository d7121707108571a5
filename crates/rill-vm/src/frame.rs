use rill_bytecode::{FunctionId, Reg};

use crate::{CoroutineId, InternalError, ScopeId, Value};

/// A VM-unique identity for one activation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u64);

/// The position of a frame: a coroutine and a depth within its frame stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameRef {
    pub coroutine: CoroutineId,
    pub depth: usize,
}

/// Where a coroutine hands control back when it yields or finishes.
///
/// Present on a coroutine's entry frame only while the coroutine is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallerLink {
    pub frame: FrameRef,
    /// Receives `true` on yield and `false` once the coroutine is exhausted.
    pub ok_dst: Option<Reg>,
    /// Receives the yielded value.
    pub out_dst: Option<Reg>,
}

/// One activation of a code unit.
///
/// Frames are stored in their coroutine's frame stack; the caller of the frame at depth `i` is
/// the frame at depth `i - 1`.
#[derive(Clone, Debug)]
pub struct Frame {
    pub(crate) id: FrameId,
    pub(crate) func: FunctionId,
    pub(crate) pc: usize,
    pub(crate) regs: Vec<Option<Value>>,
    pub(crate) return_dst: Option<Reg>,
    /// Innermost binding container of this activation.
    pub(crate) scope: ScopeId,
    /// The container allocated for this activation; `scope` never pops past it.
    pub(crate) base_scope: ScopeId,
    pub(crate) is_entry: bool,
    pub(crate) caller: Option<CallerLink>,
}

impl Frame {
    pub(crate) fn new(
        id: FrameId,
        func: FunctionId,
        reg_count: usize,
        scope: ScopeId,
        is_entry: bool,
    ) -> Self {
        Self {
            id,
            func,
            pc: 0,
            regs: vec![None; reg_count],
            return_dst: None,
            scope,
            base_scope: scope,
            is_entry,
            caller: None,
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn function(&self) -> FunctionId {
        self.func
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn is_entry(&self) -> bool {
        self.is_entry
    }

    pub fn caller(&self) -> Option<&CallerLink> {
        self.caller.as_ref()
    }

    pub(crate) fn read(&self, reg: Reg) -> Result<&Value, InternalError> {
        let slot = self
            .regs
            .get(reg as usize)
            .ok_or(InternalError::InvalidRegister { reg })?;
        slot.as_ref()
            .ok_or(InternalError::UninitializedRegister { reg })
    }

    pub(crate) fn read_int(&self, reg: Reg) -> Result<i64, InternalError> {
        match self.read(reg)? {
            Value::Int(n) => Ok(*n),
            other => Err(InternalError::TypeMismatch {
                expected: "int",
                found: other.kind(),
            }),
        }
    }

    pub(crate) fn read_bool(&self, reg: Reg) -> Result<bool, InternalError> {
        match self.read(reg)? {
            Value::Bool(b) => Ok(*b),
            other => Err(InternalError::TypeMismatch {
                expected: "bool",
                found: other.kind(),
            }),
        }
    }

    pub(crate) fn read_coroutine(&self, reg: Reg) -> Result<CoroutineId, InternalError> {
        match self.read(reg)? {
            Value::Coroutine(id) => Ok(*id),
            other => Err(InternalError::TypeMismatch {
                expected: "coroutine",
                found: other.kind(),
            }),
        }
    }

    pub(crate) fn read_args(&self, regs: &[Reg]) -> Result<Vec<Value>, InternalError> {
        regs.iter().map(|&r| self.read(r).cloned()).collect()
    }

    pub(crate) fn take(&mut self, reg: Reg) -> Result<Value, InternalError> {
        let slot = self
            .regs
            .get_mut(reg as usize)
            .ok_or(InternalError::InvalidRegister { reg })?;
        slot.take()
            .ok_or(InternalError::UninitializedRegister { reg })
    }

    pub(crate) fn write(&mut self, reg: Reg, value: Value) -> Result<(), InternalError> {
        let slot = self
            .regs
            .get_mut(reg as usize)
            .ok_or(InternalError::InvalidRegister { reg })?;
        *slot = Some(value);
        Ok(())
    }
}

/// A read-only snapshot of an activation, for hosts and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub id: FrameId,
    pub function: FunctionId,
    pub pc: usize,
    pub coroutine: CoroutineId,
    pub depth: usize,
    pub is_entry: bool,
}
