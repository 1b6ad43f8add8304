//! Calls that compile to a fixed instruction sequence instead of a `CALL`
//!
//! Intrinsics cover the VM builtins (arithmetic and collection opcodes) and the system calls
//! exposed by the host. A system call is identified by a 32-bit id derived from its name.

use crate::vm::OpCode;
use xxhash_rust::const_xxh32::xxh32;

/// One instruction of an intrinsic's template
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Opcode with no operand (and a fixed stack effect)
    Op(OpCode),

    /// Opcode with immediate operand bytes (and a fixed stack effect)
    OpWithOperand(OpCode, &'static [u8]),

    /// `SYSCALL id`, consuming every argument of the intrinsic
    Syscall { name: &'static str, id: u32 },
}

const fn syscall(name: &'static str) -> Step {
    Step::Syscall {
        name,
        id: syscall_id(name),
    }
}

/// Id used in `SYSCALL` operands for the system call with this name
pub const fn syscall_id(name: &str) -> u32 {
    xxh32(name.as_bytes(), 0)
}

#[derive(Debug)]
pub struct Intrinsic {
    pub name: &'static str,
    pub params: usize,
    pub returns_value: bool,

    /// Are arguments pushed last-first (like for method calls)?
    ///
    /// System calls take their first argument from the top of the stack, opcodes take their
    /// last one from there.
    pub reverse_args: bool,

    pub template: &'static [Step],
}

macro_rules! intrinsics {
    (@returns value) => { true };
    (@returns void) => { false };
    (@order reversed) => { true };
    (@order natural) => { false };
    ($( $name:literal ($params:literal) $returns:ident $order:ident => [ $( $step:expr ),* ]; )*) => {
        /// Every known intrinsic
        pub static INTRINSICS: &[Intrinsic] = &[
            $(
                Intrinsic {
                    name: $name,
                    params: $params,
                    returns_value: intrinsics!(@returns $returns),
                    reverse_args: intrinsics!(@order $order),
                    template: &[ $( $step ),* ],
                },
            )*
        ];
    };
}

use Step::{Op, OpWithOperand};

/// Operand of `CONVERT` for the byte string stack item type
const BYTE_STRING: &[u8] = &[0x28];

intrinsics! {
    "System.Runtime.Log" (1) void reversed => [syscall("System.Runtime.Log")];
    "System.Runtime.Notify" (2) void reversed => [syscall("System.Runtime.Notify")];
    "System.Runtime.CheckWitness" (1) value reversed => [syscall("System.Runtime.CheckWitness")];
    "System.Runtime.GetTime" (0) value reversed => [syscall("System.Runtime.GetTime")];
    "System.Storage.GetContext" (0) value reversed => [syscall("System.Storage.GetContext")];
    "System.Storage.Get" (2) value reversed => [syscall("System.Storage.Get")];
    "System.Storage.Put" (3) void reversed => [syscall("System.Storage.Put")];
    "System.Storage.Delete" (2) void reversed => [syscall("System.Storage.Delete")];

    "Math.Abs" (1) value natural => [Op(OpCode::ABS)];
    "Math.Sign" (1) value natural => [Op(OpCode::SIGN)];
    "Math.Max" (2) value natural => [Op(OpCode::MAX)];
    "Math.Min" (2) value natural => [Op(OpCode::MIN)];
    "Math.Pow" (2) value natural => [Op(OpCode::POW)];
    "Math.Sqrt" (1) value natural => [Op(OpCode::SQRT)];
    "Math.ModMul" (3) value natural => [Op(OpCode::MODMUL)];
    "Math.ModPow" (3) value natural => [Op(OpCode::MODPOW)];
    "Math.Within" (3) value natural => [Op(OpCode::WITHIN)];

    "Bytes.Concat" (2) value natural => [Op(OpCode::CAT)];
    "Bytes.Substring" (3) value natural => [Op(OpCode::SUBSTR)];
    "Bytes.Left" (2) value natural => [Op(OpCode::LEFT)];
    "Bytes.Right" (2) value natural => [Op(OpCode::RIGHT)];
    "Bytes.FromInteger" (1) value natural => [OpWithOperand(OpCode::CONVERT, BYTE_STRING)];

    "Collections.Size" (1) value natural => [Op(OpCode::SIZE)];
    "Collections.NewArray" (1) value natural => [Op(OpCode::NEWARRAY)];
    "Collections.NewMap" (0) value natural => [Op(OpCode::NEWMAP)];
    "Collections.HasKey" (2) value natural => [Op(OpCode::HASKEY)];
    "Collections.GetItem" (2) value natural => [Op(OpCode::PICKITEM)];
    "Collections.SetItem" (3) void natural => [Op(OpCode::SETITEM)];
    "Collections.Append" (2) void natural => [Op(OpCode::APPEND)];
    "Collections.Remove" (2) void natural => [Op(OpCode::REMOVE)];
    "Collections.Keys" (1) value natural => [Op(OpCode::KEYS)];
    "Collections.Values" (1) value natural => [Op(OpCode::VALUES)];

    "Object.IsNull" (1) value natural => [Op(OpCode::ISNULL)];
    "Object.IsNotNull" (1) value natural => [Op(OpCode::ISNULL), Op(OpCode::NOT)];

    "Runtime.Abort" (0) void natural => [Op(OpCode::ABORT)];
    "Runtime.AbortWithMessage" (1) void natural => [Op(OpCode::ABORTMSG)];
    "Runtime.Assert" (1) void natural => [Op(OpCode::ASSERT)];
    "Runtime.AssertWithMessage" (2) void natural => [Op(OpCode::ASSERTMSG)];
}

/// Find an intrinsic by name in a table
pub fn lookup_intrinsic<'t>(table: &'t [Intrinsic], name: &str) -> Option<&'t Intrinsic> {
    table.iter().find(|intrinsic| intrinsic.name == name)
}
