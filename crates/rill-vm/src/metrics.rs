use rill_bytecode::{CallTarget, Instruction};

/// Execution counters for the VM loop.
///
/// Collection is best-effort and meant for profiling; the VM runs with metrics disabled unless
/// [`crate::VmConfig::collect_metrics`] or [`crate::Vm::enable_metrics`] turns them on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmMetrics {
    /// Total number of executed bytecode instructions.
    pub executed_instructions: u64,

    pub call_instructions: u64,
    /// Calls resolved through a candidate set.
    pub dispatched_calls: u64,
    /// Candidates examined by overload selection, including the selected one.
    pub dispatch_candidates_tried: u64,
    pub return_instructions: u64,

    pub coroutines_created: u64,
    pub coroutine_enters: u64,
    pub coroutine_yields: u64,

    pub regions_opened: u64,
    pub regions_committed: u64,
    /// Regions undone, whether by `RegionRollback` or by unwinding a condition.
    pub regions_rolled_back: u64,
    /// Bindings restored by rollbacks.
    pub bindings_restored: u64,

    pub conditions_raised: u64,
    pub conditions_caught: u64,

    pub jump_instructions: u64,
    pub other_instructions: u64,

    /// Deepest frame stack observed in any coroutine.
    pub max_frames_len: u64,
}

impl VmMetrics {
    pub(crate) fn record(&mut self, instr: &Instruction) {
        use Instruction as I;

        self.executed_instructions = self.executed_instructions.saturating_add(1);

        match instr {
            I::Call { func, .. } => {
                self.call_instructions += 1;
                if matches!(func, CallTarget::Overloaded(_)) {
                    self.dispatched_calls += 1;
                }
            }
            I::Return { .. } => self.return_instructions += 1,

            I::CoCreate { .. } | I::CoCopy { .. } => self.coroutines_created += 1,
            I::CoNext { .. } => self.coroutine_enters += 1,
            I::Yield { .. } => self.coroutine_yields += 1,

            I::Jump { .. } | I::JumpIf { .. } => self.jump_instructions += 1,

            _ => self.other_instructions += 1,
        }
    }

    /// Adds all counters from `other` into `self`.
    pub fn add_from(&mut self, other: &Self) {
        let pairs = [
            (&mut self.executed_instructions, other.executed_instructions),
            (&mut self.call_instructions, other.call_instructions),
            (&mut self.dispatched_calls, other.dispatched_calls),
            (
                &mut self.dispatch_candidates_tried,
                other.dispatch_candidates_tried,
            ),
            (&mut self.return_instructions, other.return_instructions),
            (&mut self.coroutines_created, other.coroutines_created),
            (&mut self.coroutine_enters, other.coroutine_enters),
            (&mut self.coroutine_yields, other.coroutine_yields),
            (&mut self.regions_opened, other.regions_opened),
            (&mut self.regions_committed, other.regions_committed),
            (&mut self.regions_rolled_back, other.regions_rolled_back),
            (&mut self.bindings_restored, other.bindings_restored),
            (&mut self.conditions_raised, other.conditions_raised),
            (&mut self.conditions_caught, other.conditions_caught),
            (&mut self.jump_instructions, other.jump_instructions),
            (&mut self.other_instructions, other.other_instructions),
        ];
        for (mine, theirs) in pairs {
            *mine = mine.saturating_add(theirs);
        }
        self.max_frames_len = self.max_frames_len.max(other.max_frames_len);
    }
}
