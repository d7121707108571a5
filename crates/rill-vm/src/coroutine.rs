use rill_bytecode::Reg;

use crate::{CallerLink, Frame, FrameId, InternalError, ScopeId};

/// Index of a coroutine in the VM's coroutine arena. `CoroutineId(0)` is the root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoroutineId(pub u32);

impl CoroutineId {
    pub const ROOT: CoroutineId = CoroutineId(0);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoroutineState {
    /// Created but never entered.
    Fresh,
    /// Entered and not suspended. This includes coroutines waiting on a coroutine they entered.
    Running,
    Suspended,
    /// No frames left to run.
    Exhausted,
}

/// An installed catch handler. Handlers are owned by the frame at `depth`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CatchHandler {
    pub(crate) depth: usize,
    pub(crate) target_pc: u32,
    pub(crate) dst: Option<Reg>,
    /// Serial of the next region opened after installation. A catch rolls back regions with a
    /// serial at or above this one that belong to frames it unwinds to.
    pub(crate) region_serial: u64,
    pub(crate) scope: ScopeId,
}

/// A suspendable stack of frames.
///
/// Frame `0` is the entry frame; the last frame is the active one.
#[derive(Clone, Debug)]
pub struct Coroutine {
    pub(crate) frames: Vec<Frame>,
    pub(crate) handlers: Vec<CatchHandler>,
    suspended: bool,
    initialized: bool,
}

impl Coroutine {
    pub(crate) fn new(entry: Frame) -> Self {
        Self {
            frames: vec![entry],
            handlers: Vec::new(),
            suspended: false,
            initialized: false,
        }
    }

    /// The root coroutine starts running immediately.
    pub(crate) fn root(entry: Frame) -> Self {
        Self {
            initialized: true,
            ..Self::new(entry)
        }
    }

    pub fn state(&self) -> CoroutineState {
        if !self.initialized {
            CoroutineState::Fresh
        } else if self.frames.is_empty() {
            CoroutineState::Exhausted
        } else if self.suspended {
            CoroutineState::Suspended
        } else {
            CoroutineState::Running
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// True iff the coroutine is parked at a suspend point.
    pub fn has_next(&self) -> bool {
        self.suspended
    }

    pub fn entry(&self) -> Option<&Frame> {
        self.frames.first()
    }

    pub fn active(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub(crate) fn active_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Transfers control into this coroutine, recording where to return.
    pub(crate) fn enter(&mut self, id: CoroutineId, link: CallerLink) -> Result<(), InternalError> {
        match self.state() {
            CoroutineState::Fresh | CoroutineState::Suspended => {}
            CoroutineState::Running => {
                return Err(InternalError::ReenteredCoroutine { coroutine: id.0 });
            }
            CoroutineState::Exhausted => {
                return Err(InternalError::ExhaustedCoroutine { coroutine: id.0 });
            }
        }
        let entry = self
            .frames
            .first_mut()
            .ok_or(InternalError::NoActiveFrame)?;
        entry.caller = Some(link);
        self.suspended = false;
        self.initialized = true;
        Ok(())
    }

    /// Parks the coroutine and returns the link of the context that entered it.
    pub(crate) fn suspend(&mut self, id: CoroutineId) -> Result<CallerLink, InternalError> {
        if self.state() != CoroutineState::Running {
            return Err(InternalError::Trap {
                message: format!("suspend of coroutine {} while not running", id.0),
            });
        }
        let link = self
            .frames
            .first_mut()
            .and_then(|entry| entry.caller.take())
            .ok_or(InternalError::MissingCaller { coroutine: id.0 })?;
        self.suspended = true;
        Ok(link)
    }

    /// Drops every frame, leaving the coroutine exhausted. Returns the frames and caller link.
    pub(crate) fn discard(&mut self) -> (Vec<Frame>, Option<CallerLink>) {
        let link = self.frames.first_mut().and_then(|entry| entry.caller.take());
        self.handlers.clear();
        self.suspended = false;
        self.initialized = true;
        (std::mem::take(&mut self.frames), link)
    }

    /// Duplicates a coroutine that has not started yet.
    ///
    /// The copy gets a fresh frame identity and its own binding container, so the two
    /// coroutines run independently.
    pub(crate) fn copy(&self, frame_id: FrameId, scope: ScopeId) -> Result<Coroutine, InternalError> {
        let Some(entry) = self.entry() else {
            return Err(InternalError::CopyStartedCoroutine);
        };
        if self.suspended || entry.pc != 0 || self.frames.len() != 1 {
            return Err(InternalError::CopyStartedCoroutine);
        }
        let mut frame = entry.clone();
        frame.id = frame_id;
        frame.scope = scope;
        frame.base_scope = scope;
        frame.caller = None;
        Ok(Coroutine::new(frame))
    }
}
