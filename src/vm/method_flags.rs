use super::binary_format::{Deserialize, Serialize};
use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::Result;

bitflags! {
    /// Flags on methods, as stored in the module method table
    #[derive(Default)]
    pub struct MethodFlags: u8 {
        /// Callable from outside the module
        const PUBLIC = 0x01;

        /// Does not modify contract state
        const SAFE = 0x02;

        /// Leaves a value on the caller's stack
        const RETURNS_VALUE = 0x04;
    }
}

impl Serialize for MethodFlags {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.bits().serialize(writer)
    }
}

/// Unknown bits are dropped
impl Deserialize for MethodFlags {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        Ok(MethodFlags::from_bits_truncate(u8::deserialize(reader)?))
    }
}
