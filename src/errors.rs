// Copyright 2025 Cornell University
// released under MIT License

use crate::types::Type;
use std::fmt;

/// Main error type of the compilation pipeline.
/// Every variant aborts composition: no partial network is ever produced.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}{context}")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub context: ErrorContext,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileErrorKind {
    #[error("Structural error: {0}")]
    Structural(StructuralError),
    #[error("Type error: {0}")]
    Type(TypeError),
    #[error("Parse error: {0}")]
    Parse(ParseError),
}

pub type CompileResult<T> = Result<T, CompileError>;

/// Where an error was found. Filled from the inside out: the innermost
/// caller that knows a piece of the location sets it, outer callers never
/// overwrite it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub automaton: Option<String>,
    pub state: Option<String>,
    pub edge: Option<usize>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(automaton) = &self.automaton {
            write!(f, " (automaton `{}`", automaton)?;
            if let Some(state) = &self.state {
                write!(f, ", state `{}`", state)?;
            }
            if let Some(edge) = self.edge {
                write!(f, ", edge {}", edge)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Violations of the model's structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    /// A send or receive refers to a channel nobody declares
    UnknownChannel { channel: String },
    /// A transition targets a state that does not exist
    UnknownState { state: String },
    /// An expression refers to a name that is not in scope
    UnresolvedIdentifier { name: String },
    /// Probabilistic destinations do not form a full partition
    NonExhaustiveBranches { details: String },
    DuplicateAutomaton { name: String },
    DuplicateState { name: String },
    DuplicateVariable { name: String },
    DuplicateStruct { name: String },
    /// Initial values that (transitively) depend on themselves
    CyclicDefault { cycle: Vec<String> },
    /// Writing a variable owned by a channel, the clock or another automaton
    ReadOnlyVariable { name: String },
    /// A local variable hides a global of the same name
    ShadowedGlobal { name: String },
    MissingInitialState,
    InvalidTimer { timer: String, details: String },
    InvalidBehaviorTree { details: String },
    /// A service or action without exactly one server, or declared with
    /// different types
    InvalidInterface { name: String, details: String },
}

/// Ill-typed expressions and declarations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    /// Storing a value in a variable of another width/sign without a cast
    WidthMismatch {
        target: String,
        expected: Type,
        found: Type,
    },
    /// Operands that an operator does not accept
    Mismatch { operation: String, details: String },
    IndexOnNonArray { expr: String, found: Type },
    FieldOnNonStruct { field: String, found: Type },
    UnknownField { field: String, struct_name: String },
    /// A constant index outside the declared bound
    IndexOutOfBounds { expr: String, index: i64, bound: u32 },
    UnknownType { name: String },
    RecursiveStruct { name: String },
    /// The same global declared twice with different types
    GlobalConflict { name: String, first: Type, second: Type },
}

/// Expression text rejected by the expression reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub input: String,
    pub message: String,
}

impl fmt::Display for StructuralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralError::UnknownChannel { channel } => {
                write!(f, "Channel `{}` is not declared by any automaton", channel)
            }
            StructuralError::UnknownState { state } => {
                write!(f, "Transition targets unknown state `{}`", state)
            }
            StructuralError::UnresolvedIdentifier { name } => {
                write!(f, "Unresolved identifier `{}`", name)
            }
            StructuralError::NonExhaustiveBranches { details } => {
                write!(f, "Branches are not exhaustive: {}", details)
            }
            StructuralError::DuplicateAutomaton { name } => {
                write!(f, "Automaton `{}` is defined more than once", name)
            }
            StructuralError::DuplicateState { name } => {
                write!(f, "State `{}` is defined more than once", name)
            }
            StructuralError::DuplicateVariable { name } => {
                write!(f, "Variable `{}` is declared more than once", name)
            }
            StructuralError::DuplicateStruct { name } => {
                write!(f, "Struct `{}` is defined more than once", name)
            }
            StructuralError::CyclicDefault { cycle } => {
                write!(
                    f,
                    "Initial values form a cycle: {}",
                    cycle.join(" -> ")
                )
            }
            StructuralError::ReadOnlyVariable { name } => {
                write!(f, "Variable `{}` cannot be written here", name)
            }
            StructuralError::ShadowedGlobal { name } => {
                write!(f, "Local variable `{}` shadows a global variable", name)
            }
            StructuralError::MissingInitialState => write!(f, "Automaton has no states"),
            StructuralError::InvalidTimer { timer, details } => {
                write!(f, "Invalid timer `{}`: {}", timer, details)
            }
            StructuralError::InvalidBehaviorTree { details } => {
                write!(f, "Invalid behavior tree: {}", details)
            }
            StructuralError::InvalidInterface { name, details } => {
                write!(f, "Invalid interface `{}`: {}", name, details)
            }
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeError::WidthMismatch {
                target,
                expected,
                found,
            } => write!(
                f,
                "Cannot store a value of type {} in `{}` of type {} without an explicit conversion",
                found, target, expected
            ),
            TypeError::Mismatch { operation, details } => {
                write!(f, "Invalid operands for {}: {}", operation, details)
            }
            TypeError::IndexOnNonArray { expr, found } => {
                write!(f, "Cannot index `{}` of type {}", expr, found)
            }
            TypeError::FieldOnNonStruct { field, found } => {
                write!(f, "Cannot access field `{}` on a value of type {}", field, found)
            }
            TypeError::UnknownField { field, struct_name } => {
                write!(f, "Struct {} has no field `{}`", struct_name, field)
            }
            TypeError::IndexOutOfBounds { expr, index, bound } => write!(
                f,
                "Index {} into `{}` is outside of the declared bound {}",
                index, expr, bound
            ),
            TypeError::UnknownType { name } => write!(f, "Unknown type `{}`", name),
            TypeError::RecursiveStruct { name } => {
                write!(f, "Struct {} contains itself", name)
            }
            TypeError::GlobalConflict {
                name,
                first,
                second,
            } => write!(
                f,
                "Global `{}` is declared as both {} and {}",
                name, first, second
            ),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot read `{}`: {}", self.input, self.message)
    }
}

impl From<StructuralError> for CompileError {
    fn from(value: StructuralError) -> Self {
        CompileError {
            kind: CompileErrorKind::Structural(value),
            context: ErrorContext::default(),
        }
    }
}

impl From<TypeError> for CompileError {
    fn from(value: TypeError) -> Self {
        CompileError {
            kind: CompileErrorKind::Type(value),
            context: ErrorContext::default(),
        }
    }
}

impl From<ParseError> for CompileError {
    fn from(value: ParseError) -> Self {
        CompileError {
            kind: CompileErrorKind::Parse(value),
            context: ErrorContext::default(),
        }
    }
}

impl CompileError {
    pub fn in_automaton(mut self, name: &str) -> Self {
        if self.context.automaton.is_none() {
            self.context.automaton = Some(name.to_string());
        }
        self
    }

    pub fn at_state(mut self, name: &str) -> Self {
        if self.context.state.is_none() {
            self.context.state = Some(name.to_string());
        }
        self
    }

    pub fn at_edge(mut self, index: usize) -> Self {
        if self.context.edge.is_none() {
            self.context.edge = Some(index);
        }
        self
    }

    pub fn is_structural(&self) -> bool {
        matches!(self.kind, CompileErrorKind::Structural(_))
    }

    pub fn is_type_error(&self) -> bool {
        matches!(self.kind, CompileErrorKind::Type(_))
    }
}

/// Attaches location information to the error of a `CompileResult`
pub trait WithContext {
    fn in_automaton(self, name: &str) -> Self;
    fn at_state(self, name: &str) -> Self;
    fn at_edge(self, index: usize) -> Self;
}

impl<T> WithContext for CompileResult<T> {
    fn in_automaton(self, name: &str) -> Self {
        self.map_err(|e| e.in_automaton(name))
    }

    fn at_state(self, name: &str) -> Self {
        self.map_err(|e| e.at_state(name))
    }

    fn at_edge(self, index: usize) -> Self {
        self.map_err(|e| e.at_edge(index))
    }
}

// Convenience constructors

impl StructuralError {
    pub fn unknown_channel(channel: &str) -> Self {
        StructuralError::UnknownChannel {
            channel: channel.to_string(),
        }
    }

    pub fn unresolved(name: &str) -> Self {
        StructuralError::UnresolvedIdentifier {
            name: name.to_string(),
        }
    }

    pub fn unknown_state(state: &str) -> Self {
        StructuralError::UnknownState {
            state: state.to_string(),
        }
    }

    pub fn read_only(name: &str) -> Self {
        StructuralError::ReadOnlyVariable {
            name: name.to_string(),
        }
    }

    pub fn invalid_bt(details: impl Into<String>) -> Self {
        StructuralError::InvalidBehaviorTree {
            details: details.into(),
        }
    }
}

impl TypeError {
    pub fn mismatch(operation: &str, details: impl Into<String>) -> Self {
        TypeError::Mismatch {
            operation: operation.to_string(),
            details: details.into(),
        }
    }

    pub fn unknown_type(name: &str) -> Self {
        TypeError::UnknownType {
            name: name.to_string(),
        }
    }

    pub fn recursive_struct(name: &str) -> Self {
        TypeError::RecursiveStruct {
            name: name.to_string(),
        }
    }
}
