//! Rollback log for one backtracking region.

use std::collections::HashMap;

use rill_bytecode::SymbolId;

use crate::{CandidateSet, InternalError, ScopeId, Scopes, Value};

/// A binding location: a name within a specific container.
pub type BindingKey = (ScopeId, SymbolId);

/// Records the prior state of every binding mutated while a region is open.
///
/// Only the first save per key is kept, so rollback restores the state from before the region
/// opened. `None` records that the binding did not exist. A log is finalized exactly once, by
/// [`Cache::commit`] or [`Cache::rollback`]; afterwards it is inert.
#[derive(Debug)]
pub struct Cache {
    variables: HashMap<BindingKey, Option<Value>>,
    functions: HashMap<BindingKey, Option<CandidateSet>>,
    enabled: bool,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            variables: HashMap::new(),
            functions: HashMap::new(),
            enabled: true,
        }
    }

    /// Records `prior` for a variable unless the key was already saved. Returns true if recorded.
    pub fn save_variable(&mut self, scope: ScopeId, name: SymbolId, prior: Option<Value>) -> bool {
        if !self.enabled || self.variables.contains_key(&(scope, name)) {
            return false;
        }
        self.variables.insert((scope, name), prior);
        true
    }

    /// Records `prior` for a function set unless the key was already saved.
    pub fn save_function(
        &mut self,
        scope: ScopeId,
        name: SymbolId,
        prior: Option<CandidateSet>,
    ) -> bool {
        if !self.enabled || self.functions.contains_key(&(scope, name)) {
            return false;
        }
        self.functions.insert((scope, name), prior);
        true
    }

    pub fn contains_variable(&self, scope: ScopeId, name: SymbolId) -> bool {
        self.variables.contains_key(&(scope, name))
    }

    pub fn contains_function(&self, scope: ScopeId, name: SymbolId) -> bool {
        self.functions.contains_key(&(scope, name))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.variables.len() + self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keeps every mutation and discards the log.
    pub fn commit(&mut self) -> Result<(), InternalError> {
        if !self.enabled {
            return Err(InternalError::CacheInert { op: "commit" });
        }
        self.enabled = false;
        self.variables.clear();
        self.functions.clear();
        Ok(())
    }

    /// Restores every logged binding to its saved state and discards the log.
    ///
    /// Entries whose container has been freed are skipped. Returns the number of restored
    /// bindings.
    pub fn rollback(&mut self, scopes: &mut Scopes) -> Result<usize, InternalError> {
        if !self.enabled {
            return Err(InternalError::CacheInert { op: "rollback" });
        }
        self.enabled = false;

        let mut restored = 0;
        for ((scope, name), prior) in self.variables.drain() {
            if !scopes.is_live(scope) {
                continue;
            }
            match prior {
                Some(value) => scopes.set_var(scope, name, value)?,
                None => {
                    scopes.remove_var(scope, name);
                }
            }
            restored += 1;
        }
        for ((scope, name), prior) in self.functions.drain() {
            if !scopes.is_live(scope) {
                continue;
            }
            match prior {
                Some(set) => scopes.set_functions(scope, name, set)?,
                None => {
                    scopes.remove_functions(scope, name);
                }
            }
            restored += 1;
        }
        Ok(restored)
    }
}
