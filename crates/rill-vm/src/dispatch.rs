//! Overloaded call resolution.
//!
//! Each binding container holds, per name, an ordered set of candidate functions. Resolving a
//! call collects the sets along the scope chain (inner containers first) and selects the first
//! candidate whose parameter shapes accept the actual arguments.

use rill_bytecode::{ExecutableModule, Function, FunctionId, Shape, SymbolId};

use crate::{Condition, ConditionKind, ScopeId, Scopes, Value};

/// An ordered, possibly empty list of alternatives for one overloaded name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateSet {
    name: SymbolId,
    candidates: Vec<FunctionId>,
}

impl CandidateSet {
    pub fn new(name: SymbolId) -> Self {
        Self {
            name,
            candidates: Vec::new(),
        }
    }

    pub fn from_candidates(name: SymbolId, candidates: Vec<FunctionId>) -> Self {
        Self { name, candidates }
    }

    pub fn name(&self) -> SymbolId {
        self.name
    }

    pub fn candidates(&self) -> &[FunctionId] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Adds `func` ahead of every existing candidate.
    pub fn prepend(&mut self, func: FunctionId) {
        self.candidates.insert(0, func);
    }

    /// Combines an inner set with the set of an enclosing container: every candidate of `self`
    /// is tried before any candidate of `outer`.
    pub fn join(&self, outer: &CandidateSet) -> CandidateSet {
        let mut candidates = Vec::with_capacity(self.len() + outer.len());
        candidates.extend_from_slice(&self.candidates);
        candidates.extend_from_slice(&outer.candidates);
        CandidateSet {
            name: self.name,
            candidates,
        }
    }
}

/// Collects the candidates for `name` visible from `scope`, innermost container first.
pub fn resolve(scopes: &Scopes, scope: ScopeId, name: SymbolId) -> Option<CandidateSet> {
    let mut joined: Option<CandidateSet> = None;
    let mut cursor = Some(scope);
    while let Some(id) = cursor {
        let Some(container) = scopes.get(id) else {
            break;
        };
        if let Some(set) = container.functions(name) {
            joined = Some(match joined {
                Some(inner) => inner.join(set),
                None => set.clone(),
            });
        }
        cursor = container.parent();
    }
    joined
}

/// Picks the first candidate that accepts `args`.
///
/// The returned condition carries an empty trace; the VM fills it in at the raise point.
pub fn select(
    module: &ExecutableModule,
    set: &CandidateSet,
    args: &[Value],
) -> Result<FunctionId, Condition> {
    for &id in set.candidates() {
        let Some(func) = module.function(id) else {
            continue;
        };
        if accepts(module, func, args) {
            return Ok(id);
        }
    }
    Err(Condition::new(ConditionKind::UnresolvedCall {
        name: module.symbol_name(set.name()),
        arity: args.len(),
    }))
}

/// Returns true if `func`'s parameter shapes accept `args` pointwise.
pub fn accepts(module: &ExecutableModule, func: &Function, args: &[Value]) -> bool {
    func.param_count as usize == args.len()
        && func.params.len() == args.len()
        && func
            .params
            .iter()
            .zip(args)
            .all(|(shape, arg)| shape_matches(module, shape, arg))
}

pub fn shape_matches(module: &ExecutableModule, shape: &Shape, value: &Value) -> bool {
    match (shape, value) {
        (Shape::Any, _) => true,
        (Shape::Unit, Value::Unit) => true,
        (Shape::Bool, Value::Bool(_)) => true,
        (Shape::Int, Value::Int(_)) => true,
        (Shape::Str, Value::Str(_)) => true,
        (Shape::Function, Value::Function(_)) => true,
        (Shape::Coroutine, Value::Coroutine(_)) => true,
        (Shape::Node, Value::Node(_)) => true,
        (Shape::Lit(c), v) => v.matches_const(c),
        (Shape::Cons { ctor, args }, Value::Node(node)) => {
            node.ctor == *ctor
                && node.args.len() == args.len()
                && args
                    .iter()
                    .zip(&node.args)
                    .all(|(shape, field)| shape_matches(module, shape, field))
        }
        _ => false,
    }
}
