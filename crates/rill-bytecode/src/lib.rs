#![forbid(unsafe_code)]

use std::collections::BTreeMap;

pub mod verify;

pub use verify::{VerifyError, verify_module};

/// A stable identifier for a code unit within an [`ExecutableModule`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionId(pub u32);

/// A stable identifier for a term constructor within an [`ExecutableModule`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConstructorId(pub u32);

/// A stable identifier for a [`Shape`] type descriptor within an [`ExecutableModule`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

/// A stable identifier for a binding name (variables and overloaded functions).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolId(pub u32);

/// A bytecode register index.
pub type Reg = u32;

/// A literal value embedded in bytecode.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConstValue {
    Unit,
    Bool(bool),
    Int(i64),
    Str(String),
    Function(FunctionId),
}

/// A term constructor declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constructor {
    pub name: String,
    pub arity: u32,
}

/// A structural descriptor matched against runtime values.
///
/// Shapes drive overload selection (a candidate's `params`) and the `IsShape` test.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Shape {
    Any,
    Unit,
    Bool,
    Int,
    Str,
    Function,
    Coroutine,
    /// Any constructed node, whatever its constructor.
    Node,
    /// Exactly this literal.
    Lit(ConstValue),
    /// A node built by `ctor` whose fields match `args` pointwise.
    Cons { ctor: ConstructorId, args: Vec<Shape> },
}

/// A call target: a fixed code unit, or an overloaded name resolved at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallTarget {
    Direct(FunctionId),
    Overloaded(SymbolId),
}

/// An in-memory bytecode instruction.
///
/// Registers are the frame's local storage. Named bindings live in binding containers
/// (scopes) so that backtracking regions can log and undo them.
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    Const { dst: Reg, value: ConstValue },
    Copy { dst: Reg, src: Reg },
    Move { dst: Reg, src: Reg },

    IntAdd { dst: Reg, a: Reg, b: Reg },
    IntSub { dst: Reg, a: Reg, b: Reg },
    IntMul { dst: Reg, a: Reg, b: Reg },
    IntLt { dst: Reg, a: Reg, b: Reg },
    IntLe { dst: Reg, a: Reg, b: Reg },
    IntEq { dst: Reg, a: Reg, b: Reg },
    IntNe { dst: Reg, a: Reg, b: Reg },
    BoolNot { dst: Reg, v: Reg },
    ValueEq { dst: Reg, a: Reg, b: Reg },

    MakeNode {
        dst: Reg,
        ctor: ConstructorId,
        args: Vec<Reg>,
    },
    NodeField { dst: Reg, node: Reg, idx: u32 },
    IsShape { dst: Reg, value: Reg, ty: TypeId },

    /// Reads the nearest binding of `name` along the scope chain.
    LoadVar { dst: Reg, name: SymbolId },
    /// Assigns the nearest existing binding of `name`, or binds it in the current scope.
    StoreVar { name: SymbolId, src: Reg },
    /// Binds `name` in the current scope, shadowing outer bindings.
    DeclareVar { name: SymbolId, src: Reg },
    /// Adds `func` in front of the current scope's candidates for `name`.
    DeclareFunction { name: SymbolId, func: FunctionId },
    PushScope,
    PopScope,

    Call {
        dst: Option<Reg>,
        func: CallTarget,
        args: Vec<Reg>,
    },
    Return { value: Reg },

    CoCreate {
        dst: Reg,
        func: FunctionId,
        args: Vec<Reg>,
    },
    /// Enters a coroutine. `dst` receives `true` when it yields and `false` once exhausted;
    /// `out` receives the yielded value.
    CoNext {
        dst: Option<Reg>,
        co: Reg,
        out: Option<Reg>,
    },
    CoHasNext { dst: Reg, co: Reg },
    CoCopy { dst: Reg, co: Reg },
    Yield { value: Option<Reg> },

    RegionOpen,
    RegionCommit,
    RegionRollback,
    NoSolution,

    PushCatch { target_pc: u32, dst: Option<Reg> },
    PopCatch,
    Throw { value: Reg },

    Jump { target_pc: u32 },
    JumpIf {
        cond: Reg,
        then_pc: u32,
        else_pc: u32,
    },
    Trap { message: String },
}

impl Instruction {
    /// Returns true if control never falls through to the next instruction.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Return { .. }
                | Instruction::Jump { .. }
                | Instruction::Throw { .. }
                | Instruction::NoSolution
                | Instruction::Trap { .. }
        )
    }
}

/// A bytecode function body (one code unit).
#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    /// Total number of registers used by this function.
    pub reg_count: u32,
    /// Parameter registers are `0..param_count`.
    pub param_count: u32,
    /// Dispatch signature; one shape per parameter.
    pub params: Vec<Shape>,
    pub code: Vec<Instruction>,
}

impl Function {
    /// Creates a function whose parameters accept any value.
    pub fn new(name: impl Into<String>, param_count: u32, reg_count: u32) -> Self {
        Self {
            name: name.into(),
            reg_count,
            param_count,
            params: vec![Shape::Any; param_count as usize],
            code: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<Shape>) -> Self {
        self.params = params;
        self
    }

    pub fn with_code(mut self, code: Vec<Instruction>) -> Self {
        self.code = code;
        self
    }
}

/// Errors raised while populating module tables.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModuleError {
    #[error("duplicate {kind} `{name}`")]
    Duplicate { kind: &'static str, name: String },
    #[error("{kind} table overflow")]
    Overflow { kind: &'static str },
}

/// A compact, ID-based executable module: code units plus their constant pool tables.
#[derive(Clone, Debug, Default)]
pub struct ExecutableModule {
    pub functions: Vec<Function>,
    pub function_ids: BTreeMap<String, FunctionId>,

    pub constructors: Vec<Constructor>,
    pub constructor_ids: BTreeMap<String, ConstructorId>,

    pub types: Vec<Shape>,

    pub symbols: Vec<String>,
    pub symbol_ids: BTreeMap<String, SymbolId>,

    /// Entry function for starting execution.
    pub entry: FunctionId,
}

fn next_index(len: usize, kind: &'static str) -> Result<u32, ModuleError> {
    len.try_into().map_err(|_| ModuleError::Overflow { kind })
}

impl ExecutableModule {
    pub fn add_function(&mut self, func: Function) -> Result<FunctionId, ModuleError> {
        if self.function_ids.contains_key(func.name.as_str()) {
            return Err(ModuleError::Duplicate {
                kind: "function",
                name: func.name,
            });
        }
        let id = FunctionId(next_index(self.functions.len(), "function")?);
        self.function_ids.insert(func.name.clone(), id);
        self.functions.push(func);
        Ok(id)
    }

    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id.0 as usize)
    }

    pub fn function_id(&self, name: &str) -> Option<FunctionId> {
        self.function_ids.get(name).copied()
    }

    pub fn add_constructor(
        &mut self,
        name: impl Into<String>,
        arity: u32,
    ) -> Result<ConstructorId, ModuleError> {
        let name = name.into();
        if self.constructor_ids.contains_key(name.as_str()) {
            return Err(ModuleError::Duplicate {
                kind: "constructor",
                name,
            });
        }
        let id = ConstructorId(next_index(self.constructors.len(), "constructor")?);
        self.constructor_ids.insert(name.clone(), id);
        self.constructors.push(Constructor { name, arity });
        Ok(id)
    }

    pub fn constructor(&self, id: ConstructorId) -> Option<&Constructor> {
        self.constructors.get(id.0 as usize)
    }

    pub fn constructor_id(&self, name: &str) -> Option<ConstructorId> {
        self.constructor_ids.get(name).copied()
    }

    /// Appends a type descriptor. Descriptors are not deduplicated.
    pub fn add_type(&mut self, shape: Shape) -> Result<TypeId, ModuleError> {
        let id = TypeId(next_index(self.types.len(), "type")?);
        self.types.push(shape);
        Ok(id)
    }

    pub fn type_shape(&self, id: TypeId) -> Option<&Shape> {
        self.types.get(id.0 as usize)
    }

    /// Returns the id for `name`, adding it to the symbol table on first use.
    pub fn intern_symbol(&mut self, name: &str) -> Result<SymbolId, ModuleError> {
        if let Some(id) = self.symbol_ids.get(name) {
            return Ok(*id);
        }
        let id = SymbolId(next_index(self.symbols.len(), "symbol")?);
        self.symbol_ids.insert(name.to_string(), id);
        self.symbols.push(name.to_string());
        Ok(id)
    }

    pub fn symbol(&self, id: SymbolId) -> Option<&str> {
        self.symbols.get(id.0 as usize).map(String::as_str)
    }

    pub fn symbol_id(&self, name: &str) -> Option<SymbolId> {
        self.symbol_ids.get(name).copied()
    }

    /// Human-readable name for diagnostics; falls back to the raw index.
    pub fn symbol_name(&self, id: SymbolId) -> String {
        match self.symbol(id) {
            Some(name) => name.to_string(),
            None => format!("#{}", id.0),
        }
    }

    pub fn function_name(&self, id: FunctionId) -> String {
        match self.function(id) {
            Some(func) => func.name.clone(),
            None => format!("fn#{}", id.0),
        }
    }
}
