use std::fmt;

use crate::Value;

/// A recoverable condition raised by the running program.
///
/// Conditions unwind to the innermost catch handler, rolling back every backtracking region
/// opened after that handler was installed.
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    pub kind: ConditionKind,
    pub trace: StackTrace,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConditionKind {
    /// No candidate of an overloaded name accepted the arguments.
    UnresolvedCall { name: String, arity: usize },
    /// The current alternative has no solution; backtrack.
    NoSolution,
    /// A read of a name that no visible container binds.
    UndefinedVariable { name: String },
    /// A program-level exception carrying a value.
    Thrown(Value),
}

impl Condition {
    pub fn new(kind: ConditionKind) -> Self {
        Self {
            kind,
            trace: StackTrace::default(),
        }
    }

    pub fn with_trace(mut self, trace: StackTrace) -> Self {
        self.trace = trace;
        self
    }

    /// The value delivered to a catch handler.
    pub fn value(&self) -> Value {
        match &self.kind {
            ConditionKind::Thrown(value) => value.clone(),
            kind => Value::from(kind.to_string().as_str()),
        }
    }
}

impl fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionKind::UnresolvedCall { name, arity } => {
                write!(f, "no alternative of `{name}` accepts {arity} argument(s)")
            }
            ConditionKind::NoSolution => write!(f, "no solution"),
            ConditionKind::UndefinedVariable { name } => write!(f, "undefined variable `{name}`"),
            ConditionKind::Thrown(value) => write!(f, "thrown: {value}"),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.trace.is_empty() {
            write!(f, "\n{}", self.trace)?;
        }
        Ok(())
    }
}

/// One activation in a captured trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackTraceEntry {
    pub function: String,
    pub pc: usize,
}

/// Activations at a raise point, innermost first, following coroutine callers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackTrace {
    entries: Vec<StackTraceEntry>,
}

impl StackTrace {
    pub fn push(&mut self, function: impl Into<String>, pc: usize) {
        self.entries.push(StackTraceEntry {
            function: function.into(),
            pc,
        });
    }

    pub fn entries(&self) -> &[StackTraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  at {} (pc {})", entry.function, entry.pc)?;
        }
        Ok(())
    }
}
