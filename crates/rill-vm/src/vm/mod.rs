use std::rc::Rc;

use rill_bytecode::{ExecutableModule, FunctionId, verify_module};
use tracing::debug;

use crate::{
    Cache, Condition, Coroutine, CoroutineId, CoroutineState, Frame, FrameId, FrameInfo,
    InternalError, NodeInterner, ScopeId, Scopes, Value, VmConfig, VmError, VmMetrics,
};

mod control;
mod step;

pub use step::vm_step;

/// Result of a single VM stepping operation.
#[derive(Clone, Debug, PartialEq)]
pub enum StepResult {
    /// The root coroutine's entry function returned.
    Done { value: Value },
    /// The VM ran out of fuel; step again to continue.
    Yield { remaining_fuel: u64 },
    /// A recoverable condition reached the root without meeting a catch handler.
    Uncaught { condition: Condition },
    /// A fatal internal error stopped the VM.
    Trap { error: InternalError },
}

#[derive(Debug)]
enum VmState {
    Running,
    Done { value: Value },
    Uncaught { condition: Condition },
    Trapped { error: InternalError },
}

/// What the loop does after one instruction.
#[derive(Debug)]
enum Flow {
    Continue,
    Done(Value),
    Uncaught(Condition),
}

/// A backtracking region: a rollback log tagged with the frame that opened it.
#[derive(Debug)]
struct OpenRegion {
    /// Increases with every region opened by this VM.
    serial: u64,
    owner: FrameId,
    cache: Cache,
}

/// A bytecode interpreter instance.
///
/// All execution state lives here: the coroutine arena (coroutine 0 runs the entry function),
/// the binding containers, the stack of open backtracking regions and the node interner.
pub struct Vm {
    module: Rc<ExecutableModule>,
    config: VmConfig,
    state: VmState,
    coroutines: Vec<Coroutine>,
    current: CoroutineId,
    scopes: Scopes,
    globals: ScopeId,
    regions: Vec<OpenRegion>,
    next_region_serial: u64,
    nodes: NodeInterner,
    next_frame_id: u64,

    metrics: VmMetrics,
    collect_metrics: bool,
}

impl Vm {
    /// Creates a VM for `module` with the default configuration.
    ///
    /// The entry function must take 0 parameters.
    pub fn new(module: ExecutableModule) -> Result<Self, VmError> {
        Self::with_config(module, VmConfig::default())
    }

    pub fn with_config(module: ExecutableModule, config: VmConfig) -> Result<Self, VmError> {
        Self::with_args(module, Vec::new(), config)
    }

    /// Creates a VM and passes `args` to the entry function.
    pub fn with_args(
        module: ExecutableModule,
        args: Vec<Value>,
        config: VmConfig,
    ) -> Result<Self, VmError> {
        if config.verify {
            verify_module(&module)?;
        }

        let Some(entry) = module.function(module.entry) else {
            return Err(VmError::InvalidState {
                message: format!("invalid entry function id {}", module.entry.0),
            });
        };
        if entry.param_count as usize != args.len() {
            return Err(VmError::InvalidState {
                message: format!(
                    "entry function `{}` expects {} argument(s), got {}",
                    entry.name,
                    entry.param_count,
                    args.len()
                ),
            });
        }

        let mut scopes = Scopes::new();
        let globals = scopes.alloc(None).map_err(|e| VmError::InvalidState {
            message: e.to_string(),
        })?;

        // The entry function runs directly in the global container.
        let mut frame = Frame::new(
            FrameId(0),
            module.entry,
            entry.reg_count as usize,
            globals,
            true,
        );
        for (reg, value) in args.into_iter().enumerate() {
            frame
                .write(reg as u32, value)
                .map_err(|e| VmError::InvalidState {
                    message: format!("entry argument: {e}"),
                })?;
        }
        debug!(entry = %entry.name, "vm initialized");

        let collect_metrics = config.collect_metrics;
        Ok(Self {
            module: Rc::new(module),
            config,
            state: VmState::Running,
            coroutines: vec![Coroutine::root(frame)],
            current: CoroutineId::ROOT,
            scopes,
            globals,
            regions: Vec::new(),
            next_region_serial: 0,
            nodes: NodeInterner::new(),
            next_frame_id: 1,
            metrics: VmMetrics::default(),
            collect_metrics,
        })
    }

    pub fn module(&self) -> &ExecutableModule {
        &self.module
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Enables or disables metrics collection.
    pub fn enable_metrics(&mut self, enabled: bool) {
        self.collect_metrics = enabled;
    }

    /// Resets all collected [`VmMetrics`] counters to zero.
    pub fn reset_metrics(&mut self) {
        self.metrics = VmMetrics::default();
    }

    /// Takes the current [`VmMetrics`] and resets metrics to zero.
    pub fn take_metrics(&mut self) -> VmMetrics {
        std::mem::take(&mut self.metrics)
    }

    pub fn metrics(&self) -> &VmMetrics {
        &self.metrics
    }

    pub fn current_coroutine(&self) -> CoroutineId {
        self.current
    }

    pub fn coroutine_state(&self, id: CoroutineId) -> Option<CoroutineState> {
        self.coroutines.get(id.0 as usize).map(Coroutine::state)
    }

    pub fn coroutine(&self, id: CoroutineId) -> Option<&Coroutine> {
        self.coroutines.get(id.0 as usize)
    }

    pub fn coroutine_count(&self) -> usize {
        self.coroutines.len()
    }

    /// Number of frames in the current coroutine.
    pub fn frame_depth(&self) -> usize {
        self.coroutines
            .get(self.current.0 as usize)
            .map_or(0, Coroutine::depth)
    }

    /// Describes the frame that executes the next instruction.
    pub fn active_frame(&self) -> Option<FrameInfo> {
        let co = self.coroutines.get(self.current.0 as usize)?;
        let frame = co.active()?;
        Some(FrameInfo {
            id: frame.id,
            function: frame.func,
            pc: frame.pc,
            coroutine: self.current,
            depth: co.depth() - 1,
            is_entry: frame.is_entry,
        })
    }

    /// Reads a variable bound directly in the global container.
    pub fn global(&self, name: &str) -> Option<&Value> {
        let name = self.module.symbol_id(name)?;
        self.scopes.get(self.globals)?.var(name)
    }

    /// The global candidate list for an overloaded name, in dispatch order.
    pub fn global_function_candidates(&self, name: &str) -> Option<&[FunctionId]> {
        let name = self.module.symbol_id(name)?;
        self.scopes
            .get(self.globals)?
            .functions(name)
            .map(|set| set.candidates())
    }

    /// Reads `name` as the active frame sees it, following the container chain.
    pub fn visible_var(&self, name: &str) -> Option<&Value> {
        let name = self.module.symbol_id(name)?;
        let frame = self.coroutines.get(self.current.0 as usize)?.active()?;
        self.scopes.lookup_var(frame.scope, name)
    }

    pub fn open_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn scopes(&self) -> &Scopes {
        &self.scopes
    }

    /// Number of distinct constructed nodes built so far.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn co(&self, id: CoroutineId) -> Result<&Coroutine, InternalError> {
        self.coroutines
            .get(id.0 as usize)
            .ok_or(InternalError::InvalidId {
                kind: "coroutine",
                id: id.0,
            })
    }

    fn co_mut(&mut self, id: CoroutineId) -> Result<&mut Coroutine, InternalError> {
        self.coroutines
            .get_mut(id.0 as usize)
            .ok_or(InternalError::InvalidId {
                kind: "coroutine",
                id: id.0,
            })
    }

    fn frame(&self) -> Result<&Frame, InternalError> {
        self.co(self.current)?
            .active()
            .ok_or(InternalError::NoActiveFrame)
    }

    fn frame_mut(&mut self) -> Result<&mut Frame, InternalError> {
        self.co_mut(self.current)?
            .active_mut()
            .ok_or(InternalError::NoActiveFrame)
    }

    fn alloc_frame_id(&mut self) -> FrameId {
        let id = FrameId(self.next_frame_id);
        self.next_frame_id += 1;
        id
    }
}
