use std::fmt;
use std::rc::Rc;

use rill_bytecode::{ConstValue, ConstructorId, FunctionId};

use crate::CoroutineId;

/// A runtime value held in registers and binding containers.
///
/// Values are immutable. Strings and nodes are shared through `Rc`; nodes produced by the VM are
/// interned, so structurally equal nodes share one allocation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Str(Rc<str>),
    Node(Rc<Node>),
    Function(FunctionId),
    Coroutine(CoroutineId),
}

/// A constructed term: a constructor applied to field values.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    pub ctor: ConstructorId,
    pub args: Vec<Value>,
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Node(_) => "node",
            Value::Function(_) => "function",
            Value::Coroutine(_) => "coroutine",
        }
    }

    /// Returns true if this value equals the literal `c`.
    pub fn matches_const(&self, c: &ConstValue) -> bool {
        match (self, c) {
            (Value::Unit, ConstValue::Unit) => true,
            (Value::Bool(a), ConstValue::Bool(b)) => a == b,
            (Value::Int(a), ConstValue::Int(b)) => a == b,
            (Value::Str(a), ConstValue::Str(b)) => **a == **b,
            (Value::Function(a), ConstValue::Function(b)) => a == b,
            _ => false,
        }
    }

    /// Returns the node if this value is one.
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Value::Node(node) => Some(node),
            _ => None,
        }
    }
}

impl From<&ConstValue> for Value {
    fn from(c: &ConstValue) -> Self {
        match c {
            ConstValue::Unit => Value::Unit,
            ConstValue::Bool(b) => Value::Bool(*b),
            ConstValue::Int(n) => Value::Int(*n),
            ConstValue::Str(s) => Value::Str(Rc::from(s.as_str())),
            ConstValue::Function(id) => Value::Function(*id),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Node(node) => {
                write!(f, "#{}(", node.ctor.0)?;
                for (i, arg) in node.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Value::Function(id) => write!(f, "fn#{}", id.0),
            Value::Coroutine(id) => write!(f, "co#{}", id.0),
        }
    }
}
