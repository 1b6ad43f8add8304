use super::code::{Label, MethodId};
use super::OpCode;
use crate::util::Offset;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    IoError(std::io::Error),

    /// A label was placed twice (indicates a bug in the code generator)
    LabelAlreadyPlaced(Label),

    /// A label was used that was not created by the method's label table
    UnknownLabel(Label),

    /// A label is referenced by an instruction, but was never placed
    UnplacedLabel { method: String, label: Label },

    /// A label was placed after the last instruction of its method, so it has no address
    LabelPastEnd { method: String, label: Label },

    /// A call or address refers to a method which does not exist (or has no code)
    UnknownMethod(MethodId),

    /// Jump offset does not fit even in the wide encoding
    JumpOffsetOverflow { address: Offset, offset: isize },

    /// Jump width selection kept changing past its iteration bound
    EncodingDidNotConverge { iterations: usize },

    /// Operand does not have the shape the instruction set expects for this opcode
    MalformedOperand {
        opcode: OpCode,
        reason: &'static str,
    },

    /// Opcode has no jump operand, so it has no narrow or wide form
    NotAJump(OpCode),

    /// Opcode has a dynamic stack effect, so it must be pushed with an explicit effect
    UnspecifiedStackEffect(OpCode),

    /// Instruction pops more values than are on the evaluation stack
    StackUnderflow {
        opcode: OpCode,
        depth: usize,
        pops: usize,
    },

    /// Two paths reach the same label with different evaluation stack depths
    IncompatibleStackDepth {
        label: Label,
        expected: usize,
        found: usize,
    },

    /// Byte does not correspond to any opcode in the instruction set
    UnknownOpcode(u8),

    /// Input ended in the middle of an instruction or structure
    Truncated { offset: usize },

    /// Decoded jump does not land on the start of an instruction of the same method
    InvalidJumpTarget { from: Offset, target: isize },

    /// Module file does not start with the expected magic number
    BadMagic(u32),

    /// Module file checksum does not match its contents
    ChecksumMismatch { expected: u32, found: u32 },

    /// Method table entry does not fit inside the script
    MethodOutOfRange { name: String },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::LabelAlreadyPlaced(label) => write!(f, "label {:?} placed twice", label),
            Error::UnknownLabel(label) => write!(f, "label {:?} does not exist", label),
            Error::UnplacedLabel { method, label } => {
                write!(f, "label {:?} in '{}' is referenced but never placed", label, method)
            }
            Error::LabelPastEnd { method, label } => {
                write!(f, "label {:?} in '{}' is placed past the last instruction", label, method)
            }
            Error::UnknownMethod(method) => write!(f, "reference to unknown method {:?}", method),
            Error::JumpOffsetOverflow { address, offset } => write!(
                f,
                "jump at address {} has offset {} which does not fit in 32 bits",
                address.0, offset
            ),
            Error::EncodingDidNotConverge { iterations } => write!(
                f,
                "jump encoding did not converge after {} iterations",
                iterations
            ),
            Error::MalformedOperand { opcode, reason } => {
                write!(f, "malformed operand for {}: {}", opcode, reason)
            }
            Error::NotAJump(opcode) => write!(f, "{} is not a jump", opcode),
            Error::UnspecifiedStackEffect(opcode) => {
                write!(f, "{} needs an explicit stack effect", opcode)
            }
            Error::StackUnderflow {
                opcode,
                depth,
                pops,
            } => write!(
                f,
                "{} pops {} values but the stack only has {}",
                opcode, pops, depth
            ),
            Error::IncompatibleStackDepth {
                label,
                expected,
                found,
            } => write!(
                f,
                "label {:?} reached with stack depth {} (expected {})",
                label, found, expected
            ),
            Error::UnknownOpcode(byte) => write!(f, "unknown opcode 0x{:02X}", byte),
            Error::Truncated { offset } => write!(f, "input truncated at byte {}", offset),
            Error::InvalidJumpTarget { from, target } => write!(
                f,
                "jump at address {} targets {} which is not an instruction of the same method",
                from.0, target
            ),
            Error::BadMagic(magic) => write!(f, "bad magic number 0x{:08X}", magic),
            Error::ChecksumMismatch { expected, found } => write!(
                f,
                "checksum mismatch: file says 0x{:08X}, contents hash to 0x{:08X}",
                expected, found
            ),
            Error::MethodOutOfRange { name } => {
                write!(f, "method '{}' does not fit inside the script", name)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}
