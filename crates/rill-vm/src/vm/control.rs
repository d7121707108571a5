//! Control transfer: calls and returns, coroutine hand-off, condition unwinding, backtracking
//! regions and binding mutations.

use rill_bytecode::{CallTarget, ExecutableModule, FunctionId, Reg, SymbolId};
use tracing::{debug, trace, warn};

use super::{Flow, OpenRegion, Vm};
use crate::coroutine::CatchHandler;
use crate::dispatch::{resolve, select};
use crate::{
    Cache, CallerLink, CandidateSet, Condition, ConditionKind, Coroutine, CoroutineId,
    CoroutineState, Frame, FrameId, FrameRef, InternalError, ScopeId, StackTrace, Value,
};

impl Vm {
    fn new_frame(
        &mut self,
        module: &ExecutableModule,
        func_id: FunctionId,
        args: Vec<Value>,
        is_entry: bool,
    ) -> Result<Frame, InternalError> {
        let func = module.function(func_id).ok_or(InternalError::InvalidId {
            kind: "function",
            id: func_id.0,
        })?;
        if func.param_count as usize != args.len() {
            return Err(InternalError::ArityMismatch {
                function: func.name.clone(),
                expected: func.param_count as usize,
                got: args.len(),
            });
        }
        let scope = self.scopes.alloc(Some(self.globals))?;
        let mut frame = Frame::new(
            self.alloc_frame_id(),
            func_id,
            func.reg_count as usize,
            scope,
            is_entry,
        );
        for (reg, value) in args.into_iter().enumerate() {
            frame.write(reg as Reg, value)?;
        }
        Ok(frame)
    }

    /// Frees the containers of a finished activation, innermost first.
    fn release_scopes(&mut self, frame: &Frame) {
        let mut cursor = Some(frame.scope);
        while let Some(id) = cursor {
            if id == self.globals {
                break;
            }
            cursor = self.scopes.parent(id);
            self.scopes.free(id);
            if id == frame.base_scope {
                break;
            }
        }
    }

    fn push_call(
        &mut self,
        module: &ExecutableModule,
        func_id: FunctionId,
        args: Vec<Value>,
        dst: Option<Reg>,
    ) -> Result<(), InternalError> {
        let limit = self.config.max_frames;
        if self.co(self.current)?.depth() >= limit {
            return Err(InternalError::FrameLimit { limit });
        }
        let mut frame = self.new_frame(module, func_id, args, false)?;
        frame.return_dst = dst;
        trace!(function = %module.function_name(func_id), "call");
        let current = self.current;
        self.co_mut(current)?.frames.push(frame);
        Ok(())
    }

    pub(super) fn call(
        &mut self,
        module: &ExecutableModule,
        dst: Option<Reg>,
        target: CallTarget,
        args: &[Reg],
    ) -> Result<Flow, InternalError> {
        let frame = self.frame()?;
        let values = frame.read_args(args)?;
        let func_id = match target {
            CallTarget::Direct(id) => id,
            CallTarget::Overloaded(name) => {
                let set = resolve(&self.scopes, frame.scope, name)
                    .unwrap_or_else(|| CandidateSet::new(name));
                match select(module, &set, &values) {
                    Ok(id) => {
                        if self.collect_metrics {
                            let tried = set
                                .candidates()
                                .iter()
                                .position(|c| *c == id)
                                .map_or(set.len(), |i| i + 1);
                            self.metrics.dispatch_candidates_tried += tried as u64;
                        }
                        debug!(
                            name = %module.symbol_name(name),
                            function = %module.function_name(id),
                            "dispatch selected"
                        );
                        id
                    }
                    Err(condition) => {
                        if self.collect_metrics {
                            self.metrics.dispatch_candidates_tried += set.len() as u64;
                        }
                        return self.raise(module, condition);
                    }
                }
            }
        };
        self.push_call(module, func_id, values, dst)?;
        Ok(Flow::Continue)
    }

    pub(super) fn do_return(
        &mut self,
        module: &ExecutableModule,
        value: Value,
    ) -> Result<Flow, InternalError> {
        let current = self.current;
        let co = self.co_mut(current)?;
        let frame = co.frames.pop().ok_or(InternalError::NoActiveFrame)?;
        let depth = co.frames.len();
        co.handlers.retain(|h| h.depth < depth);

        let owned = self.regions.iter().filter(|r| r.owner == frame.id).count();
        if owned > 0 {
            return Err(InternalError::UnbalancedRegion {
                function: module.function_name(frame.func),
                count: owned,
            });
        }
        self.release_scopes(&frame);
        trace!(function = %module.function_name(frame.func), "return");

        if !frame.is_entry {
            let caller = self
                .co_mut(current)?
                .active_mut()
                .ok_or(InternalError::NoActiveFrame)?;
            if let Some(dst) = frame.return_dst {
                caller.write(dst, value)?;
            }
            return Ok(Flow::Continue);
        }

        if current == CoroutineId::ROOT {
            return Ok(Flow::Done(value));
        }

        // A coroutine finishing discards its return value.
        let link = frame.caller.ok_or(InternalError::MissingCaller {
            coroutine: current.0,
        })?;
        debug!(coroutine = current.0, "coroutine exhausted");
        self.resume_caller(current, link, false, None)?;
        Ok(Flow::Continue)
    }

    /// Hands control back to the frame named by `link`.
    fn resume_caller(
        &mut self,
        from: CoroutineId,
        link: CallerLink,
        ok: bool,
        out: Option<Value>,
    ) -> Result<(), InternalError> {
        let caller = self.co_mut(link.frame.coroutine)?;
        if caller.depth() != link.frame.depth + 1 {
            return Err(InternalError::StaleCallerLink { coroutine: from.0 });
        }
        let frame = caller.active_mut().ok_or(InternalError::NoActiveFrame)?;
        if let Some(dst) = link.ok_dst {
            frame.write(dst, Value::Bool(ok))?;
        }
        if let (Some(dst), Some(value)) = (link.out_dst, out) {
            frame.write(dst, value)?;
        }
        self.current = link.frame.coroutine;
        Ok(())
    }

    pub(super) fn co_create(
        &mut self,
        module: &ExecutableModule,
        dst: Reg,
        func_id: FunctionId,
        args: &[Reg],
    ) -> Result<(), InternalError> {
        let id = self.reserve_coroutine_id()?;
        let values = self.frame()?.read_args(args)?;
        let entry = self.new_frame(module, func_id, values, true)?;
        self.coroutines.push(Coroutine::new(entry));
        debug!(
            coroutine = id.0,
            function = %module.function_name(func_id),
            "coroutine created"
        );
        self.frame_mut()?.write(dst, Value::Coroutine(id))
    }

    fn reserve_coroutine_id(&self) -> Result<CoroutineId, InternalError> {
        let limit = self.config.max_coroutines;
        let len = self.coroutines.len();
        if len >= limit {
            return Err(InternalError::CoroutineLimit { limit });
        }
        let index = u32::try_from(len).map_err(|_| InternalError::CoroutineLimit { limit })?;
        Ok(CoroutineId(index))
    }

    pub(super) fn co_copy(&mut self, dst: Reg, co: Reg) -> Result<(), InternalError> {
        let source = self.frame()?.read_coroutine(co)?;
        let id = self.reserve_coroutine_id()?;
        let scope = self.scopes.alloc(Some(self.globals))?;
        let frame_id = self.alloc_frame_id();
        let copy = match self.co(source)?.copy(frame_id, scope) {
            Ok(copy) => copy,
            Err(e) => {
                self.scopes.free(scope);
                return Err(e);
            }
        };
        self.coroutines.push(copy);
        debug!(source = source.0, coroutine = id.0, "coroutine copied");
        self.frame_mut()?.write(dst, Value::Coroutine(id))
    }

    pub(super) fn co_next(
        &mut self,
        dst: Option<Reg>,
        co: Reg,
        out: Option<Reg>,
    ) -> Result<(), InternalError> {
        let target = self.frame()?.read_coroutine(co)?;
        if self.co(target)?.state() == CoroutineState::Exhausted {
            if let Some(dst) = dst {
                self.frame_mut()?.write(dst, Value::Bool(false))?;
            }
            return Ok(());
        }
        let link = CallerLink {
            frame: FrameRef {
                coroutine: self.current,
                depth: self.frame_depth() - 1,
            },
            ok_dst: dst,
            out_dst: out,
        };
        self.co_mut(target)?.enter(target, link)?;
        debug!(coroutine = target.0, caller = self.current.0, "coroutine entered");
        self.current = target;
        Ok(())
    }

    pub(super) fn co_yield(&mut self, value: Option<Reg>) -> Result<(), InternalError> {
        let current = self.current;
        if current == CoroutineId::ROOT {
            return Err(InternalError::YieldOutsideCoroutine);
        }
        let value = match value {
            Some(reg) => self.frame()?.read(reg)?.clone(),
            None => Value::Unit,
        };
        let co = self.co(current)?;
        let owned = self
            .regions
            .iter()
            .filter(|r| co.frames.iter().any(|f| f.id == r.owner))
            .count();
        if owned > 0 {
            return Err(InternalError::YieldInsideRegion {
                coroutine: current.0,
                count: owned,
            });
        }
        let link = self.co_mut(current)?.suspend(current)?;
        debug!(coroutine = current.0, "coroutine suspended");
        self.resume_caller(current, link, true, Some(value))
    }

    /// Unwinds `condition` to the innermost catch handler, crossing coroutine boundaries.
    pub(super) fn raise(
        &mut self,
        module: &ExecutableModule,
        condition: Condition,
    ) -> Result<Flow, InternalError> {
        let condition = if condition.trace.is_empty() {
            let trace = self.capture_trace(module);
            condition.with_trace(trace)
        } else {
            condition
        };
        if self.collect_metrics {
            self.metrics.conditions_raised += 1;
        }

        loop {
            let current = self.current;
            if let Some(handler) = self.co_mut(current)?.handlers.pop() {
                return self.catch(handler, condition);
            }
            if current == CoroutineId::ROOT {
                self.rollback_regions_to(0)?;
                return Ok(Flow::Uncaught(condition));
            }

            let (frames, link) = self.co_mut(current)?.discard();
            let ids: Vec<FrameId> = frames.iter().map(Frame::id).collect();
            while self
                .regions
                .last()
                .is_some_and(|region| ids.contains(&region.owner))
            {
                self.rollback_innermost()?;
            }
            for frame in frames.iter().rev() {
                self.release_scopes(frame);
            }
            warn!(coroutine = current.0, condition = %condition.kind, "condition escaped coroutine");

            let link = link.ok_or(InternalError::MissingCaller {
                coroutine: current.0,
            })?;
            if self.co(link.frame.coroutine)?.depth() != link.frame.depth + 1 {
                return Err(InternalError::StaleCallerLink {
                    coroutine: current.0,
                });
            }
            self.current = link.frame.coroutine;
        }
    }

    fn catch(&mut self, handler: CatchHandler, condition: Condition) -> Result<Flow, InternalError> {
        let current = self.current;
        let co = self.co(current)?;
        let Some(target) = co.frames.get(handler.depth) else {
            return Err(InternalError::NoActiveFrame);
        };

        // Block containers between the target frame's scope and the handler's, innermost first.
        let mut blocks = Vec::new();
        let mut scope = target.scope;
        while scope != handler.scope {
            blocks.push(scope);
            scope = self.scopes.parent(scope).ok_or(InternalError::DanglingScope)?;
        }

        let owners: Vec<FrameId> = co.frames[handler.depth..].iter().map(Frame::id).collect();
        while self.regions.last().is_some_and(|region| {
            region.serial >= handler.region_serial && owners.contains(&region.owner)
        }) {
            self.rollback_innermost()?;
        }

        let unwound: Vec<Frame> = self
            .co_mut(current)?
            .frames
            .drain(handler.depth + 1..)
            .collect();
        for frame in unwound.iter().rev() {
            self.release_scopes(frame);
        }
        for block in blocks {
            self.scopes.free(block);
        }

        let frame = self.frame_mut()?;
        frame.scope = handler.scope;
        frame.pc = handler.target_pc as usize;
        if let Some(dst) = handler.dst {
            frame.write(dst, condition.value())?;
        }
        if self.collect_metrics {
            self.metrics.conditions_caught += 1;
        }
        debug!(condition = %condition.kind, "condition caught");
        Ok(Flow::Continue)
    }

    /// Activations at the raise point, innermost first, following coroutine caller links.
    pub(super) fn capture_trace(&self, module: &ExecutableModule) -> StackTrace {
        let mut trace = StackTrace::default();
        let mut cursor = Some((self.current, usize::MAX));
        while let Some((id, depth)) = cursor {
            let Some(co) = self.coroutines.get(id.0 as usize) else {
                break;
            };
            let end = co.frames.len().min(depth.saturating_add(1));
            for frame in co.frames[..end].iter().rev() {
                trace.push(module.function_name(frame.func), frame.pc.saturating_sub(1));
            }
            cursor = co
                .entry()
                .and_then(Frame::caller)
                .map(|link| (link.frame.coroutine, link.frame.depth));
        }
        trace
    }

    pub(super) fn push_catch(&mut self, target_pc: u32, dst: Option<Reg>) -> Result<(), InternalError> {
        let region_serial = self.next_region_serial;
        let scope = self.frame()?.scope;
        let current = self.current;
        let co = self.co_mut(current)?;
        let depth = co.depth() - 1;
        co.handlers.push(CatchHandler {
            depth,
            target_pc,
            dst,
            region_serial,
            scope,
        });
        Ok(())
    }

    pub(super) fn pop_catch(&mut self) -> Result<(), InternalError> {
        let current = self.current;
        let co = self.co_mut(current)?;
        let depth = co.depth() - 1;
        match co.handlers.last() {
            Some(handler) if handler.depth == depth => {
                co.handlers.pop();
                Ok(())
            }
            _ => Err(InternalError::NoCatchHandler),
        }
    }

    pub(super) fn region_open(&mut self) -> Result<(), InternalError> {
        let limit = self.config.max_open_regions;
        if self.regions.len() >= limit {
            return Err(InternalError::RegionLimit { limit });
        }
        let owner = self.frame()?.id;
        let serial = self.next_region_serial;
        self.next_region_serial += 1;
        self.regions.push(OpenRegion {
            serial,
            owner,
            cache: Cache::new(),
        });
        if self.collect_metrics {
            self.metrics.regions_opened += 1;
        }
        debug!(depth = self.regions.len(), "region opened");
        Ok(())
    }

    /// Finalizes the innermost region, which must belong to the active frame.
    pub(super) fn region_close(&mut self, commit: bool) -> Result<(), InternalError> {
        let owner = self.frame()?.id;
        let Some(region) = self.regions.last() else {
            return Err(InternalError::NoOpenRegion);
        };
        if region.owner != owner {
            return Err(InternalError::RegionMismatch);
        }
        if commit {
            let mut region = self.regions.pop().ok_or(InternalError::NoOpenRegion)?;
            region.cache.commit()?;
            if self.collect_metrics {
                self.metrics.regions_committed += 1;
            }
            debug!(depth = self.regions.len() + 1, "region committed");
            Ok(())
        } else {
            self.rollback_innermost()
        }
    }

    fn rollback_innermost(&mut self) -> Result<(), InternalError> {
        let mut region = self.regions.pop().ok_or(InternalError::NoOpenRegion)?;
        let restored = region.cache.rollback(&mut self.scopes)?;
        if self.collect_metrics {
            self.metrics.regions_rolled_back += 1;
            self.metrics.bindings_restored += restored as u64;
        }
        debug!(depth = self.regions.len() + 1, restored, "region rolled back");
        Ok(())
    }

    fn rollback_regions_to(&mut self, len: usize) -> Result<(), InternalError> {
        while self.regions.len() > len {
            self.rollback_innermost()?;
        }
        Ok(())
    }

    fn log_variable(&mut self, scope: ScopeId, name: SymbolId) {
        if self.regions.is_empty() {
            return;
        }
        let prior = self.scopes.get(scope).and_then(|s| s.var(name)).cloned();
        for region in &mut self.regions {
            region.cache.save_variable(scope, name, prior.clone());
        }
    }

    fn log_function(&mut self, scope: ScopeId, name: SymbolId, prior: Option<&CandidateSet>) {
        for region in &mut self.regions {
            region.cache.save_function(scope, name, prior.cloned());
        }
    }

    pub(super) fn load_var(
        &mut self,
        module: &ExecutableModule,
        dst: Reg,
        name: SymbolId,
    ) -> Result<Flow, InternalError> {
        let scope = self.frame()?.scope;
        let Some(value) = self.scopes.lookup_var(scope, name).cloned() else {
            let kind = ConditionKind::UndefinedVariable {
                name: module.symbol_name(name),
            };
            return self.raise(module, Condition::new(kind));
        };
        self.frame_mut()?.write(dst, value)?;
        Ok(Flow::Continue)
    }

    pub(super) fn store_var(&mut self, name: SymbolId, src: Reg) -> Result<(), InternalError> {
        let frame = self.frame()?;
        let value = frame.read(src)?.clone();
        let target = self
            .scopes
            .find_var(frame.scope, name)
            .unwrap_or(frame.scope);
        self.log_variable(target, name);
        self.scopes.set_var(target, name, value)
    }

    pub(super) fn declare_var(&mut self, name: SymbolId, src: Reg) -> Result<(), InternalError> {
        let frame = self.frame()?;
        let value = frame.read(src)?.clone();
        let target = frame.scope;
        self.log_variable(target, name);
        self.scopes.set_var(target, name, value)
    }

    pub(super) fn declare_function(
        &mut self,
        name: SymbolId,
        func: FunctionId,
    ) -> Result<(), InternalError> {
        let target = self.frame()?.scope;
        let prior = self
            .scopes
            .get(target)
            .ok_or(InternalError::DanglingScope)?
            .functions(name)
            .cloned();
        self.log_function(target, name, prior.as_ref());
        let mut set = prior.unwrap_or_else(|| CandidateSet::new(name));
        set.prepend(func);
        self.scopes.set_functions(target, name, set)
    }

    pub(super) fn push_scope(&mut self) -> Result<(), InternalError> {
        let parent = self.frame()?.scope;
        let scope = self.scopes.alloc(Some(parent))?;
        self.frame_mut()?.scope = scope;
        Ok(())
    }

    pub(super) fn pop_scope(&mut self) -> Result<(), InternalError> {
        let frame = self.frame()?;
        if frame.scope == frame.base_scope {
            return Err(InternalError::ScopeUnderflow);
        }
        let scope = frame.scope;
        let parent = self.scopes.parent(scope).ok_or(InternalError::DanglingScope)?;
        self.scopes.free(scope);
        self.frame_mut()?.scope = parent;
        Ok(())
    }
}
