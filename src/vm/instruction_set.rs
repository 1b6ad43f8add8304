//! Description of the target instruction set
//!
//! The code generator never hardcodes operand lengths or stack effects: everything it needs to
//! know about an opcode comes from an [`InstructionSet`] descriptor. The descriptor answers, for
//! every opcode byte:
//!
//!   - how the operand is encoded (fixed number of bytes, length-prefixed data, a relative jump
//!     offset whose width is chosen by the linker, ...)
//!   - how many values the instruction pops and pushes on the evaluation stack
//!   - how control leaves the instruction (falls through, jumps, branches, terminates, ...)
//!
//! [`StandardInstructionSet`] is the NeoVM-style table used by default.

use crate::vm::Error;
use std::fmt;

/// One byte opcode
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OpCode(pub u8);

/// Width of a relative jump offset
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum JumpWidth {
    /// Signed 8-bit offset
    Narrow,

    /// Signed 32-bit offset
    Wide,
}

impl JumpWidth {
    /// Number of bytes used to encode one offset
    pub const fn bytes(self) -> usize {
        match self {
            JumpWidth::Narrow => 1,
            JumpWidth::Wide => 4,
        }
    }

    /// Can this width encode the given relative offset?
    pub fn fits(self, offset: isize) -> bool {
        match self {
            JumpWidth::Narrow => i8::try_from(offset).is_ok(),
            JumpWidth::Wide => i32::try_from(offset).is_ok(),
        }
    }
}

/// How the operand following an opcode is encoded
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum OperandEncoding {
    /// No operand
    None,

    /// Exactly this many immediate bytes
    Fixed(usize),

    /// Little-endian length prefix of this many bytes, followed by that many data bytes
    Prefixed(usize),

    /// Relative jump offset. The second field is the opcode for the same jump, but in the other
    /// width (so the linker can switch between the two).
    Jump(JumpWidth, OpCode),

    /// Pair of relative offsets (catch and finally handlers) with the same width rules as jumps
    Try(JumpWidth, OpCode),

    /// Relative address, always 4 bytes wide
    Address,
}

/// Effect of an instruction on the evaluation stack
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StackEffect {
    Fixed { pops: u8, pushes: u8 },

    /// Depends on the operand or callee (eg. calls, `PACK`) - the emitter must specify it
    Dynamic,
}

/// How control leaves an instruction
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FlowKind {
    /// Falls through to the next instruction
    Next,

    /// Unconditional jump
    Jump,

    /// Conditional jump (either jumps or falls through)
    Branch,

    /// Enter a protected region: falls through, but may also reach the handlers
    Try,

    /// Leave a protected region (running its `finally`) and continue at the target
    EndTry,

    /// Call into another method, then fall through
    Call,

    /// Returns, throws, aborts, or ends a `finally` handler: no static successor
    Terminate,
}

impl FlowKind {
    /// Does control ever continue with the next instruction?
    pub fn falls_through(self) -> bool {
        matches!(
            self,
            FlowKind::Next | FlowKind::Branch | FlowKind::Try | FlowKind::Call
        )
    }

    /// Does this end a basic block?
    pub fn ends_block(self) -> bool {
        !matches!(self, FlowKind::Next | FlowKind::Call)
    }
}

/// Everything the code generator knows about an opcode
#[derive(Copy, Clone, Debug)]
pub struct OpcodeInfo {
    pub opcode: OpCode,
    pub mnemonic: &'static str,
    pub operand: OperandEncoding,
    pub stack: StackEffect,
    pub flow: FlowKind,
}

/// Instruction set descriptor
pub trait InstructionSet: Sync {
    /// Look up the description of an opcode
    fn info(&self, opcode: OpCode) -> Option<&OpcodeInfo>;

    /// Like `info`, but unknown opcodes are an error
    fn lookup(&self, opcode: OpCode) -> Result<&OpcodeInfo, Error> {
        self.info(opcode).ok_or(Error::UnknownOpcode(opcode.0))
    }

    /// For a jump-like opcode, find the opcode of the same jump with the requested offset width
    fn with_width(&self, opcode: OpCode, width: JumpWidth) -> Result<OpCode, Error> {
        match self.lookup(opcode)?.operand {
            OperandEncoding::Jump(current, other) | OperandEncoding::Try(current, other) => {
                Ok(if current == width { opcode } else { other })
            }
            _ => Err(Error::NotAJump(opcode)),
        }
    }
}

macro_rules! instruction_set {
    ($( $name:ident = $byte:literal, $operand:expr, $stack:expr, $flow:expr; )*) => {
        impl OpCode {
            $( pub const $name: OpCode = OpCode($byte); )*
        }

        const STANDARD_ENTRIES: &[OpcodeInfo] = &[
            $(
                OpcodeInfo {
                    opcode: OpCode($byte),
                    mnemonic: stringify!($name),
                    operand: $operand,
                    stack: $stack,
                    flow: $flow,
                },
            )*
        ];
    };
}

const fn eff(pops: u8, pushes: u8) -> StackEffect {
    StackEffect::Fixed { pops, pushes }
}

use FlowKind::*;
use JumpWidth::*;
use OperandEncoding::{Address, Fixed, Jump as Rel, Prefixed, Try as TryPair};
use StackEffect::Dynamic;

instruction_set! {
    PUSHINT8 = 0x00, Fixed(1), eff(0, 1), Next;
    PUSHINT16 = 0x01, Fixed(2), eff(0, 1), Next;
    PUSHINT32 = 0x02, Fixed(4), eff(0, 1), Next;
    PUSHINT64 = 0x03, Fixed(8), eff(0, 1), Next;
    PUSHINT128 = 0x04, Fixed(16), eff(0, 1), Next;
    PUSHINT256 = 0x05, Fixed(32), eff(0, 1), Next;
    PUSHT = 0x08, OperandEncoding::None, eff(0, 1), Next;
    PUSHF = 0x09, OperandEncoding::None, eff(0, 1), Next;
    PUSHA = 0x0A, Address, eff(0, 1), Next;
    PUSHNULL = 0x0B, OperandEncoding::None, eff(0, 1), Next;
    PUSHDATA1 = 0x0C, Prefixed(1), eff(0, 1), Next;
    PUSHDATA2 = 0x0D, Prefixed(2), eff(0, 1), Next;
    PUSHDATA4 = 0x0E, Prefixed(4), eff(0, 1), Next;
    PUSHM1 = 0x0F, OperandEncoding::None, eff(0, 1), Next;
    PUSH0 = 0x10, OperandEncoding::None, eff(0, 1), Next;
    PUSH1 = 0x11, OperandEncoding::None, eff(0, 1), Next;
    PUSH2 = 0x12, OperandEncoding::None, eff(0, 1), Next;
    PUSH3 = 0x13, OperandEncoding::None, eff(0, 1), Next;
    PUSH4 = 0x14, OperandEncoding::None, eff(0, 1), Next;
    PUSH5 = 0x15, OperandEncoding::None, eff(0, 1), Next;
    PUSH6 = 0x16, OperandEncoding::None, eff(0, 1), Next;
    PUSH7 = 0x17, OperandEncoding::None, eff(0, 1), Next;
    PUSH8 = 0x18, OperandEncoding::None, eff(0, 1), Next;
    PUSH9 = 0x19, OperandEncoding::None, eff(0, 1), Next;
    PUSH10 = 0x1A, OperandEncoding::None, eff(0, 1), Next;
    PUSH11 = 0x1B, OperandEncoding::None, eff(0, 1), Next;
    PUSH12 = 0x1C, OperandEncoding::None, eff(0, 1), Next;
    PUSH13 = 0x1D, OperandEncoding::None, eff(0, 1), Next;
    PUSH14 = 0x1E, OperandEncoding::None, eff(0, 1), Next;
    PUSH15 = 0x1F, OperandEncoding::None, eff(0, 1), Next;
    PUSH16 = 0x20, OperandEncoding::None, eff(0, 1), Next;

    NOP = 0x21, OperandEncoding::None, eff(0, 0), Next;
    JMP = 0x22, Rel(Narrow, OpCode(0x23)), eff(0, 0), Jump;
    JMP_L = 0x23, Rel(Wide, OpCode(0x22)), eff(0, 0), Jump;
    JMPIF = 0x24, Rel(Narrow, OpCode(0x25)), eff(1, 0), Branch;
    JMPIF_L = 0x25, Rel(Wide, OpCode(0x24)), eff(1, 0), Branch;
    JMPIFNOT = 0x26, Rel(Narrow, OpCode(0x27)), eff(1, 0), Branch;
    JMPIFNOT_L = 0x27, Rel(Wide, OpCode(0x26)), eff(1, 0), Branch;
    JMPEQ = 0x28, Rel(Narrow, OpCode(0x29)), eff(2, 0), Branch;
    JMPEQ_L = 0x29, Rel(Wide, OpCode(0x28)), eff(2, 0), Branch;
    JMPNE = 0x2A, Rel(Narrow, OpCode(0x2B)), eff(2, 0), Branch;
    JMPNE_L = 0x2B, Rel(Wide, OpCode(0x2A)), eff(2, 0), Branch;
    JMPGT = 0x2C, Rel(Narrow, OpCode(0x2D)), eff(2, 0), Branch;
    JMPGT_L = 0x2D, Rel(Wide, OpCode(0x2C)), eff(2, 0), Branch;
    JMPGE = 0x2E, Rel(Narrow, OpCode(0x2F)), eff(2, 0), Branch;
    JMPGE_L = 0x2F, Rel(Wide, OpCode(0x2E)), eff(2, 0), Branch;
    JMPLT = 0x30, Rel(Narrow, OpCode(0x31)), eff(2, 0), Branch;
    JMPLT_L = 0x31, Rel(Wide, OpCode(0x30)), eff(2, 0), Branch;
    JMPLE = 0x32, Rel(Narrow, OpCode(0x33)), eff(2, 0), Branch;
    JMPLE_L = 0x33, Rel(Wide, OpCode(0x32)), eff(2, 0), Branch;
    CALL = 0x34, Rel(Narrow, OpCode(0x35)), Dynamic, Call;
    CALL_L = 0x35, Rel(Wide, OpCode(0x34)), Dynamic, Call;
    CALLA = 0x36, OperandEncoding::None, Dynamic, Next;
    CALLT = 0x37, Fixed(2), Dynamic, Next;
    ABORT = 0x38, OperandEncoding::None, eff(0, 0), Terminate;
    ASSERT = 0x39, OperandEncoding::None, eff(1, 0), Next;
    THROW = 0x3A, OperandEncoding::None, eff(1, 0), Terminate;
    TRY = 0x3B, TryPair(Narrow, OpCode(0x3C)), eff(0, 0), Try;
    TRY_L = 0x3C, TryPair(Wide, OpCode(0x3B)), eff(0, 0), Try;
    ENDTRY = 0x3D, Rel(Narrow, OpCode(0x3E)), eff(0, 0), EndTry;
    ENDTRY_L = 0x3E, Rel(Wide, OpCode(0x3D)), eff(0, 0), EndTry;
    ENDFINALLY = 0x3F, OperandEncoding::None, eff(0, 0), Terminate;
    RET = 0x40, OperandEncoding::None, Dynamic, Terminate;
    SYSCALL = 0x41, Fixed(4), Dynamic, Next;

    DEPTH = 0x43, OperandEncoding::None, eff(0, 1), Next;
    DROP = 0x45, OperandEncoding::None, eff(1, 0), Next;
    NIP = 0x46, OperandEncoding::None, eff(2, 1), Next;
    XDROP = 0x48, OperandEncoding::None, Dynamic, Next;
    CLEAR = 0x49, OperandEncoding::None, Dynamic, Next;
    DUP = 0x4A, OperandEncoding::None, eff(1, 2), Next;
    OVER = 0x4B, OperandEncoding::None, eff(2, 3), Next;
    PICK = 0x4D, OperandEncoding::None, eff(1, 1), Next;
    TUCK = 0x4E, OperandEncoding::None, eff(2, 3), Next;
    SWAP = 0x50, OperandEncoding::None, eff(2, 2), Next;
    ROT = 0x51, OperandEncoding::None, eff(3, 3), Next;
    ROLL = 0x52, OperandEncoding::None, eff(1, 0), Next;
    REVERSE3 = 0x53, OperandEncoding::None, eff(3, 3), Next;
    REVERSE4 = 0x54, OperandEncoding::None, eff(4, 4), Next;
    REVERSEN = 0x55, OperandEncoding::None, Dynamic, Next;

    INITSSLOT = 0x56, Fixed(1), eff(0, 0), Next;
    INITSLOT = 0x57, Fixed(2), eff(0, 0), Next;
    LDSFLD0 = 0x58, OperandEncoding::None, eff(0, 1), Next;
    LDSFLD1 = 0x59, OperandEncoding::None, eff(0, 1), Next;
    LDSFLD2 = 0x5A, OperandEncoding::None, eff(0, 1), Next;
    LDSFLD3 = 0x5B, OperandEncoding::None, eff(0, 1), Next;
    LDSFLD4 = 0x5C, OperandEncoding::None, eff(0, 1), Next;
    LDSFLD5 = 0x5D, OperandEncoding::None, eff(0, 1), Next;
    LDSFLD6 = 0x5E, OperandEncoding::None, eff(0, 1), Next;
    LDSFLD = 0x5F, Fixed(1), eff(0, 1), Next;
    STSFLD0 = 0x60, OperandEncoding::None, eff(1, 0), Next;
    STSFLD1 = 0x61, OperandEncoding::None, eff(1, 0), Next;
    STSFLD2 = 0x62, OperandEncoding::None, eff(1, 0), Next;
    STSFLD3 = 0x63, OperandEncoding::None, eff(1, 0), Next;
    STSFLD4 = 0x64, OperandEncoding::None, eff(1, 0), Next;
    STSFLD5 = 0x65, OperandEncoding::None, eff(1, 0), Next;
    STSFLD6 = 0x66, OperandEncoding::None, eff(1, 0), Next;
    STSFLD = 0x67, Fixed(1), eff(1, 0), Next;
    LDLOC0 = 0x68, OperandEncoding::None, eff(0, 1), Next;
    LDLOC1 = 0x69, OperandEncoding::None, eff(0, 1), Next;
    LDLOC2 = 0x6A, OperandEncoding::None, eff(0, 1), Next;
    LDLOC3 = 0x6B, OperandEncoding::None, eff(0, 1), Next;
    LDLOC4 = 0x6C, OperandEncoding::None, eff(0, 1), Next;
    LDLOC5 = 0x6D, OperandEncoding::None, eff(0, 1), Next;
    LDLOC6 = 0x6E, OperandEncoding::None, eff(0, 1), Next;
    LDLOC = 0x6F, Fixed(1), eff(0, 1), Next;
    STLOC0 = 0x70, OperandEncoding::None, eff(1, 0), Next;
    STLOC1 = 0x71, OperandEncoding::None, eff(1, 0), Next;
    STLOC2 = 0x72, OperandEncoding::None, eff(1, 0), Next;
    STLOC3 = 0x73, OperandEncoding::None, eff(1, 0), Next;
    STLOC4 = 0x74, OperandEncoding::None, eff(1, 0), Next;
    STLOC5 = 0x75, OperandEncoding::None, eff(1, 0), Next;
    STLOC6 = 0x76, OperandEncoding::None, eff(1, 0), Next;
    STLOC = 0x77, Fixed(1), eff(1, 0), Next;
    LDARG0 = 0x78, OperandEncoding::None, eff(0, 1), Next;
    LDARG1 = 0x79, OperandEncoding::None, eff(0, 1), Next;
    LDARG2 = 0x7A, OperandEncoding::None, eff(0, 1), Next;
    LDARG3 = 0x7B, OperandEncoding::None, eff(0, 1), Next;
    LDARG4 = 0x7C, OperandEncoding::None, eff(0, 1), Next;
    LDARG5 = 0x7D, OperandEncoding::None, eff(0, 1), Next;
    LDARG6 = 0x7E, OperandEncoding::None, eff(0, 1), Next;
    LDARG = 0x7F, Fixed(1), eff(0, 1), Next;
    STARG0 = 0x80, OperandEncoding::None, eff(1, 0), Next;
    STARG1 = 0x81, OperandEncoding::None, eff(1, 0), Next;
    STARG2 = 0x82, OperandEncoding::None, eff(1, 0), Next;
    STARG3 = 0x83, OperandEncoding::None, eff(1, 0), Next;
    STARG4 = 0x84, OperandEncoding::None, eff(1, 0), Next;
    STARG5 = 0x85, OperandEncoding::None, eff(1, 0), Next;
    STARG6 = 0x86, OperandEncoding::None, eff(1, 0), Next;
    STARG = 0x87, Fixed(1), eff(1, 0), Next;

    NEWBUFFER = 0x88, OperandEncoding::None, eff(1, 1), Next;
    MEMCPY = 0x89, OperandEncoding::None, eff(5, 0), Next;
    CAT = 0x8B, OperandEncoding::None, eff(2, 1), Next;
    SUBSTR = 0x8C, OperandEncoding::None, eff(3, 1), Next;
    LEFT = 0x8D, OperandEncoding::None, eff(2, 1), Next;
    RIGHT = 0x8E, OperandEncoding::None, eff(2, 1), Next;

    INVERT = 0x90, OperandEncoding::None, eff(1, 1), Next;
    AND = 0x91, OperandEncoding::None, eff(2, 1), Next;
    OR = 0x92, OperandEncoding::None, eff(2, 1), Next;
    XOR = 0x93, OperandEncoding::None, eff(2, 1), Next;
    EQUAL = 0x97, OperandEncoding::None, eff(2, 1), Next;
    NOTEQUAL = 0x98, OperandEncoding::None, eff(2, 1), Next;

    SIGN = 0x99, OperandEncoding::None, eff(1, 1), Next;
    ABS = 0x9A, OperandEncoding::None, eff(1, 1), Next;
    NEGATE = 0x9B, OperandEncoding::None, eff(1, 1), Next;
    INC = 0x9C, OperandEncoding::None, eff(1, 1), Next;
    DEC = 0x9D, OperandEncoding::None, eff(1, 1), Next;
    ADD = 0x9E, OperandEncoding::None, eff(2, 1), Next;
    SUB = 0x9F, OperandEncoding::None, eff(2, 1), Next;
    MUL = 0xA0, OperandEncoding::None, eff(2, 1), Next;
    DIV = 0xA1, OperandEncoding::None, eff(2, 1), Next;
    MOD = 0xA2, OperandEncoding::None, eff(2, 1), Next;
    POW = 0xA3, OperandEncoding::None, eff(2, 1), Next;
    SQRT = 0xA4, OperandEncoding::None, eff(1, 1), Next;
    MODMUL = 0xA5, OperandEncoding::None, eff(3, 1), Next;
    MODPOW = 0xA6, OperandEncoding::None, eff(3, 1), Next;
    SHL = 0xA8, OperandEncoding::None, eff(2, 1), Next;
    SHR = 0xA9, OperandEncoding::None, eff(2, 1), Next;
    NOT = 0xAA, OperandEncoding::None, eff(1, 1), Next;
    BOOLAND = 0xAB, OperandEncoding::None, eff(2, 1), Next;
    BOOLOR = 0xAC, OperandEncoding::None, eff(2, 1), Next;
    NZ = 0xB1, OperandEncoding::None, eff(1, 1), Next;
    NUMEQUAL = 0xB3, OperandEncoding::None, eff(2, 1), Next;
    NUMNOTEQUAL = 0xB4, OperandEncoding::None, eff(2, 1), Next;
    LT = 0xB5, OperandEncoding::None, eff(2, 1), Next;
    LE = 0xB6, OperandEncoding::None, eff(2, 1), Next;
    GT = 0xB7, OperandEncoding::None, eff(2, 1), Next;
    GE = 0xB8, OperandEncoding::None, eff(2, 1), Next;
    MIN = 0xB9, OperandEncoding::None, eff(2, 1), Next;
    MAX = 0xBA, OperandEncoding::None, eff(2, 1), Next;
    WITHIN = 0xBB, OperandEncoding::None, eff(3, 1), Next;

    PACKMAP = 0xBE, OperandEncoding::None, Dynamic, Next;
    PACKSTRUCT = 0xBF, OperandEncoding::None, Dynamic, Next;
    PACK = 0xC0, OperandEncoding::None, Dynamic, Next;
    UNPACK = 0xC1, OperandEncoding::None, Dynamic, Next;
    NEWARRAY0 = 0xC2, OperandEncoding::None, eff(0, 1), Next;
    NEWARRAY = 0xC3, OperandEncoding::None, eff(1, 1), Next;
    NEWARRAY_T = 0xC4, Fixed(1), eff(1, 1), Next;
    NEWSTRUCT0 = 0xC5, OperandEncoding::None, eff(0, 1), Next;
    NEWSTRUCT = 0xC6, OperandEncoding::None, eff(1, 1), Next;
    NEWMAP = 0xC8, OperandEncoding::None, eff(0, 1), Next;
    SIZE = 0xCA, OperandEncoding::None, eff(1, 1), Next;
    HASKEY = 0xCB, OperandEncoding::None, eff(2, 1), Next;
    KEYS = 0xCC, OperandEncoding::None, eff(1, 1), Next;
    VALUES = 0xCD, OperandEncoding::None, eff(1, 1), Next;
    PICKITEM = 0xCE, OperandEncoding::None, eff(2, 1), Next;
    APPEND = 0xCF, OperandEncoding::None, eff(2, 0), Next;
    SETITEM = 0xD0, OperandEncoding::None, eff(3, 0), Next;
    REVERSEITEMS = 0xD1, OperandEncoding::None, eff(1, 0), Next;
    REMOVE = 0xD2, OperandEncoding::None, eff(2, 0), Next;
    CLEARITEMS = 0xD3, OperandEncoding::None, eff(1, 0), Next;
    POPITEM = 0xD4, OperandEncoding::None, eff(1, 1), Next;

    ISNULL = 0xD8, OperandEncoding::None, eff(1, 1), Next;
    ISTYPE = 0xD9, Fixed(1), eff(1, 1), Next;
    CONVERT = 0xDB, Fixed(1), eff(1, 1), Next;

    ABORTMSG = 0xE0, OperandEncoding::None, eff(1, 0), Terminate;
    ASSERTMSG = 0xE1, OperandEncoding::None, eff(2, 0), Next;
}

const fn build_standard_table() -> [Option<OpcodeInfo>; 256] {
    let mut table: [Option<OpcodeInfo>; 256] = [None; 256];
    let mut i = 0;
    while i < STANDARD_ENTRIES.len() {
        let entry = STANDARD_ENTRIES[i];
        table[entry.opcode.0 as usize] = Some(entry);
        i += 1;
    }
    table
}

static STANDARD_TABLE: [Option<OpcodeInfo>; 256] = build_standard_table();

/// The default (NeoVM-style) instruction set
#[derive(Copy, Clone, Debug, Default)]
pub struct StandardInstructionSet;

impl InstructionSet for StandardInstructionSet {
    fn info(&self, opcode: OpCode) -> Option<&OpcodeInfo> {
        STANDARD_TABLE[opcode.0 as usize].as_ref()
    }
}

impl OpCode {
    /// Opcodes for the compact forms of common operations that take a small index
    ///
    /// For instance `OpCode::LDLOC0.indexed(2) == Some(OpCode::LDLOC2)`. Only indices 0-6 have a
    /// compact form.
    pub fn indexed(self, index: u8) -> Option<OpCode> {
        if index <= 6 {
            Some(OpCode(self.0 + index))
        } else {
            None
        }
    }

    /// Opcode for pushing a small integer constant without an operand
    pub fn push_small_int(value: i64) -> Option<OpCode> {
        match value {
            -1 => Some(OpCode::PUSHM1),
            0..=16 => Some(OpCode(OpCode::PUSH0.0 + value as u8)),
            _ => None,
        }
    }
}

impl fmt::Debug for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match StandardInstructionSet.info(*self) {
            Some(info) => f.write_str(info.mnemonic),
            None => write!(f, "0x{:02X}", self.0),
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn jump_pairs_are_symmetric() {
        let isa = StandardInstructionSet;
        for entry in STANDARD_ENTRIES {
            if let OperandEncoding::Jump(width, other) | OperandEncoding::Try(width, other) =
                entry.operand
            {
                let other_info = isa.lookup(other).unwrap();
                match other_info.operand {
                    OperandEncoding::Jump(other_width, back)
                    | OperandEncoding::Try(other_width, back) => {
                        assert_ne!(width, other_width, "{} pairs with same width", entry.mnemonic);
                        assert_eq!(back, entry.opcode, "{} pair is not symmetric", entry.mnemonic);
                        assert_eq!(other_info.flow, entry.flow);
                    }
                    _ => panic!("{} pairs with a non-jump", entry.mnemonic),
                }
            }
        }
    }

    #[test]
    fn table_has_no_duplicate_opcodes() {
        let mut seen = [false; 256];
        for entry in STANDARD_ENTRIES {
            assert!(!seen[entry.opcode.0 as usize], "duplicate {}", entry.mnemonic);
            seen[entry.opcode.0 as usize] = true;
        }
    }

    #[test]
    fn width_switching() {
        let isa = StandardInstructionSet;
        assert_eq!(isa.with_width(OpCode::JMP, JumpWidth::Wide).unwrap(), OpCode::JMP_L);
        assert_eq!(isa.with_width(OpCode::JMP_L, JumpWidth::Wide).unwrap(), OpCode::JMP_L);
        assert_eq!(isa.with_width(OpCode::TRY_L, JumpWidth::Narrow).unwrap(), OpCode::TRY);
        assert!(isa.with_width(OpCode::ADD, JumpWidth::Wide).is_err());
    }

    #[test]
    fn compact_forms() {
        assert_eq!(OpCode::LDLOC0.indexed(3), Some(OpCode::LDLOC3));
        assert_eq!(OpCode::STARG0.indexed(7), None);
        assert_eq!(OpCode::push_small_int(16), Some(OpCode::PUSH16));
        assert_eq!(OpCode::push_small_int(-1), Some(OpCode::PUSHM1));
        assert_eq!(OpCode::push_small_int(17), None);
        assert_eq!(format!("{:?}", OpCode::JMPIFNOT_L), "JMPIFNOT_L");
    }
}
