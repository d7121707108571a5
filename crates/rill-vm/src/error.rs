use rill_bytecode::{Reg, VerifyError};

/// Public errors returned by the VM API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// The VM is in an invalid state for the requested operation.
    #[error("invalid vm state: {message}")]
    InvalidState { message: String },
    /// The module failed verification before execution started.
    #[error("invalid module: {0}")]
    InvalidModule(#[from] VerifyError),
}

/// A fatal runtime error.
///
/// Internal errors indicate corrupted interpreter state or a broken bytecode invariant. They are
/// never observable by the running program: the VM stops and reports them as
/// [`crate::StepResult::Trap`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InternalError {
    #[error("cannot copy a coroutine that has already started")]
    CopyStartedCoroutine,
    #[error("cannot {op} a rollback log that is no longer enabled")]
    CacheInert { op: &'static str },
    #[error("function `{function}` ran past the end of its code")]
    FellOffEnd { function: String },
    #[error("coroutine {coroutine} is already running")]
    ReenteredCoroutine { coroutine: u32 },
    #[error("coroutine {coroutine} is exhausted")]
    ExhaustedCoroutine { coroutine: u32 },
    #[error("yield outside of a coroutine")]
    YieldOutsideCoroutine,
    #[error("coroutine {coroutine} yielded while owning {count} open region(s)")]
    YieldInsideRegion { coroutine: u32, count: usize },
    #[error("coroutine {coroutine} has no caller to return to")]
    MissingCaller { coroutine: u32 },
    #[error("caller link of coroutine {coroutine} does not name an active frame")]
    StaleCallerLink { coroutine: u32 },
    #[error("no open backtracking region")]
    NoOpenRegion,
    #[error("innermost backtracking region belongs to another frame")]
    RegionMismatch,
    #[error("function `{function}` returned while owning {count} open region(s)")]
    UnbalancedRegion { function: String, count: usize },
    #[error("pop_catch without a handler owned by the current frame")]
    NoCatchHandler,
    #[error("pop_scope at the base scope of the frame")]
    ScopeUnderflow,
    #[error("binding container no longer exists")]
    DanglingScope,
    #[error("frame limit of {limit} exceeded")]
    FrameLimit { limit: usize },
    #[error("coroutine limit of {limit} exceeded")]
    CoroutineLimit { limit: usize },
    #[error("open region limit of {limit} exceeded")]
    RegionLimit { limit: usize },
    #[error("reg {reg} out of range")]
    InvalidRegister { reg: Reg },
    #[error("read from uninitialized reg {reg}")]
    UninitializedRegister { reg: Reg },
    #[error("expected {expected}, got {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid {kind} id {id}")]
    InvalidId { kind: &'static str, id: u32 },
    #[error("`{function}` expects {expected} argument(s), got {got}")]
    ArityMismatch {
        function: String,
        expected: usize,
        got: usize,
    },
    #[error("field {idx} out of range for node of arity {arity}")]
    FieldOutOfRange { idx: u32, arity: usize },
    #[error("no active frame")]
    NoActiveFrame,
    #[error("trap: {message}")]
    Trap { message: String },
}
