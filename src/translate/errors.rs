use super::FrameState;
use crate::ir::SourceSpan;
use crate::vm;
use std::fmt;

/// Failure to translate one method (or, for `Internal`, possibly the whole unit)
#[derive(Debug)]
pub enum Error {
    /// The method body is not well-formed
    Structural {
        method: String,
        span: Option<SourceSpan>,
        kind: StructuralKind,
    },

    /// The method is well-formed but cannot be expressed in the target VM
    Unrepresentable {
        method: String,
        span: Option<SourceSpan>,
        reason: Unrepresentable,
    },

    /// Code generation or linking went wrong (this is a bug, not a mistake in the input)
    Internal {
        method: Option<String>,
        error: vm::Error,
    },

    /// Exception scope frame asked to make an impossible transition
    ScopeState {
        method: String,
        from: FrameState,
        to: FrameState,
    },

    /// A `try` statement was closed without one being open
    NoOpenTry { method: String },
}

impl Error {
    /// Is this a bug in the compiler rather than a problem with its input?
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::Internal { .. } | Error::ScopeState { .. } | Error::NoOpenTry { .. }
        )
    }

    /// Method the error was found in
    pub fn method(&self) -> Option<&str> {
        match self {
            Error::Structural { method, .. }
            | Error::Unrepresentable { method, .. }
            | Error::ScopeState { method, .. }
            | Error::NoOpenTry { method } => Some(method),
            Error::Internal { method, .. } => method.as_deref(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StructuralKind {
    BreakOutsideLoop,
    ContinueOutsideLoop,

    /// `return`, `break`, `continue`, or `goto` out of a `finally` block
    LeaveFinally,

    /// `goto` to a label inside a `try`, `catch`, or `finally` block the jump is not in
    GotoIntoProtectedRegion(String),

    UndefinedLabel(String),
    DuplicateLabel(String),
    RethrowOutsideCatch,

    /// `return value;` in a method that does not return anything
    UnexpectedReturnValue,

    /// `return;` in a method that returns a value
    MissingReturnValue,

    /// Control can reach the end of a method that returns a value
    MissingReturn,

    DuplicateMethod(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Unrepresentable {
    /// Integer literal wider than 256 bits (the payload is its width in bytes)
    IntegerTooWide(usize),

    /// Slot index that does not fit in a byte
    SlotIndex(u32),

    /// More than 255 argument or local slots (including temporaries)
    SlotCount(u32),

    UnknownMethod(String),
    UnknownIntrinsic(String),

    ArgumentCount {
        callee: String,
        expected: usize,
        found: usize,
    },

    StackUnderflow,

    /// Two paths reach the same point with different stack depths
    StackMismatch,
}

impl fmt::Display for StructuralKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralKind::BreakOutsideLoop => f.write_str("`break` outside of a loop or switch"),
            StructuralKind::ContinueOutsideLoop => f.write_str("`continue` outside of a loop"),
            StructuralKind::LeaveFinally => f.write_str("control cannot leave a `finally` block"),
            StructuralKind::GotoIntoProtectedRegion(label) => {
                write!(f, "`goto {}` jumps into a protected region", label)
            }
            StructuralKind::UndefinedLabel(label) => write!(f, "undefined label `{}`", label),
            StructuralKind::DuplicateLabel(label) => write!(f, "duplicate label `{}`", label),
            StructuralKind::RethrowOutsideCatch => f.write_str("rethrow outside of a `catch`"),
            StructuralKind::UnexpectedReturnValue => {
                f.write_str("method without a return value returns a value")
            }
            StructuralKind::MissingReturnValue => f.write_str("`return` is missing a value"),
            StructuralKind::MissingReturn => {
                f.write_str("not all code paths of the method return a value")
            }
            StructuralKind::DuplicateMethod(name) => write!(f, "method `{}` is defined twice", name),
        }
    }
}

impl fmt::Display for Unrepresentable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unrepresentable::IntegerTooWide(bytes) => {
                write!(f, "integer literal is {} bytes wide (at most 32 fit)", bytes)
            }
            Unrepresentable::SlotIndex(index) => write!(f, "slot index {} is too large", index),
            Unrepresentable::SlotCount(count) => write!(f, "{} slots is too many", count),
            Unrepresentable::UnknownMethod(name) => write!(f, "unknown method `{}`", name),
            Unrepresentable::UnknownIntrinsic(name) => write!(f, "unknown intrinsic `{}`", name),
            Unrepresentable::ArgumentCount {
                callee,
                expected,
                found,
            } => write!(
                f,
                "`{}` takes {} arguments but {} were supplied",
                callee, expected, found
            ),
            Unrepresentable::StackUnderflow => f.write_str("evaluation stack underflow"),
            Unrepresentable::StackMismatch => f.write_str("inconsistent evaluation stack depth"),
        }
    }
}

fn write_location(
    f: &mut fmt::Formatter<'_>,
    method: &str,
    span: &Option<SourceSpan>,
) -> fmt::Result {
    match span {
        Some(span) => write!(f, "{} {}: ", method, span),
        None => write!(f, "{}: ", method),
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Structural { method, span, kind } => {
                write_location(f, method, span)?;
                write!(f, "{}", kind)
            }
            Error::Unrepresentable {
                method,
                span,
                reason,
            } => {
                write_location(f, method, span)?;
                write!(f, "{}", reason)
            }
            Error::Internal {
                method: Some(method),
                error,
            } => write!(f, "{}: internal error: {}", method, error),
            Error::Internal {
                method: None,
                error,
            } => write!(f, "internal error: {}", error),
            Error::ScopeState { method, from, to } => write!(
                f,
                "{}: internal error: exception scope cannot go from {:?} to {:?}",
                method, from, to
            ),
            Error::NoOpenTry { method } => {
                write!(f, "{}: internal error: no `try` statement to close", method)
            }
        }
    }
}

impl From<vm::Error> for Error {
    fn from(error: vm::Error) -> Error {
        Error::Internal {
            method: None,
            error,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Internal { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Every error found while compiling a unit, in method order
#[derive(Debug)]
pub struct CompileErrors(pub Vec<Error>);

impl CompileErrors {
    pub fn errors(&self) -> &[Error] {
        &self.0
    }

    /// Are any of the errors compiler bugs?
    pub fn has_internal(&self) -> bool {
        self.0.iter().any(Error::is_internal)
    }
}

impl From<Error> for CompileErrors {
    fn from(err: Error) -> CompileErrors {
        CompileErrors(vec![err])
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s)", self.0.len())?;
        for error in &self.0 {
            write!(f, "\n  {}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}
