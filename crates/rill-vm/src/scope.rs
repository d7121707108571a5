use std::collections::HashMap;

use rill_bytecode::SymbolId;

use crate::{CandidateSet, InternalError, Value};

/// A handle to a binding container.
///
/// Handles carry the generation of their slot: once a container is freed, every handle to it
/// stops resolving even if the slot is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScopeId {
    index: u32,
    generation: u32,
}

/// A binding container: named variables and overloaded function sets, with a parent link.
#[derive(Debug, Default)]
pub struct Scope {
    parent: Option<ScopeId>,
    vars: HashMap<SymbolId, Value>,
    functions: HashMap<SymbolId, CandidateSet>,
}

impl Scope {
    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    pub fn var(&self, name: SymbolId) -> Option<&Value> {
        self.vars.get(&name)
    }

    pub fn functions(&self, name: SymbolId) -> Option<&CandidateSet> {
        self.functions.get(&name)
    }
}

#[derive(Debug)]
struct ScopeSlot {
    generation: u32,
    scope: Option<Scope>,
}

/// Arena of binding containers with slot reuse.
#[derive(Debug, Default)]
pub struct Scopes {
    slots: Vec<ScopeSlot>,
    free: Vec<u32>,
}

impl Scopes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, parent: Option<ScopeId>) -> Result<ScopeId, InternalError> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index: u32 =
                    self.slots
                        .len()
                        .try_into()
                        .map_err(|_| InternalError::Trap {
                            message: "scope table overflow".to_string(),
                        })?;
                self.slots.push(ScopeSlot {
                    generation: 0,
                    scope: None,
                });
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.scope = Some(Scope {
            parent,
            ..Scope::default()
        });
        Ok(ScopeId {
            index,
            generation: slot.generation,
        })
    }

    /// Frees a container. Returns false if `id` was already stale.
    pub fn free(&mut self, id: ScopeId) -> bool {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return false;
        };
        if slot.generation != id.generation || slot.scope.is_none() {
            return false;
        }
        slot.scope = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        true
    }

    pub fn get(&self, id: ScopeId) -> Option<&Scope> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.scope.as_ref()
    }

    fn get_mut(&mut self, id: ScopeId) -> Option<&mut Scope> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.scope.as_mut()
    }

    pub fn is_live(&self, id: ScopeId) -> bool {
        self.get(id).is_some()
    }

    /// Number of live containers.
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn parent(&self, id: ScopeId) -> Option<ScopeId> {
        self.get(id).and_then(Scope::parent)
    }

    /// Finds the nearest container on the chain starting at `from` that binds variable `name`.
    pub fn find_var(&self, from: ScopeId, name: SymbolId) -> Option<ScopeId> {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            let scope = self.get(id)?;
            if scope.vars.contains_key(&name) {
                return Some(id);
            }
            cursor = scope.parent;
        }
        None
    }

    pub fn lookup_var(&self, from: ScopeId, name: SymbolId) -> Option<&Value> {
        let id = self.find_var(from, name)?;
        self.get(id)?.var(name)
    }

    pub fn set_var(
        &mut self,
        scope: ScopeId,
        name: SymbolId,
        value: Value,
    ) -> Result<(), InternalError> {
        let scope = self.get_mut(scope).ok_or(InternalError::DanglingScope)?;
        scope.vars.insert(name, value);
        Ok(())
    }

    pub fn remove_var(&mut self, scope: ScopeId, name: SymbolId) -> Option<Value> {
        self.get_mut(scope)?.vars.remove(&name)
    }

    pub fn set_functions(
        &mut self,
        scope: ScopeId,
        name: SymbolId,
        set: CandidateSet,
    ) -> Result<(), InternalError> {
        let scope = self.get_mut(scope).ok_or(InternalError::DanglingScope)?;
        scope.functions.insert(name, set);
        Ok(())
    }

    pub fn remove_functions(&mut self, scope: ScopeId, name: SymbolId) -> Option<CandidateSet> {
        self.get_mut(scope)?.functions.remove(&name)
    }
}
