use super::binary_format::{Deserialize, Serialize};
use super::{Error, InstructionSet, JumpWidth, OpCode, OpcodeInfo, OperandEncoding};
use crate::util::{Offset, OffsetVec, Width};
use byteorder::WriteBytesExt;
use std::fmt;
use std::io::{Error as IoError, ErrorKind};

/// Operand of an instruction
///
/// The type parameter is what jumps refer to: a symbolic target while code is being generated, or
/// a relative offset (from the start of the jumping instruction) once linked.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operand<T> {
    None,

    /// Immediate bytes, exactly as encoded (including any length prefix)
    Bytes(Vec<u8>),

    /// Relative jump and its current encoding width
    Jump(T, JumpWidth),

    /// Protected region handlers (either may be absent)
    Try {
        catch: Option<T>,
        finally: Option<T>,
        width: JumpWidth,
    },

    /// Always-wide relative address
    Address(T),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Instruction<T> {
    pub opcode: OpCode,
    pub operand: Operand<T>,
}

impl<T> Instruction<T> {
    /// Instruction without an operand
    pub fn simple(opcode: OpCode) -> Self {
        Instruction {
            opcode,
            operand: Operand::None,
        }
    }

    /// Instruction with immediate operand bytes
    pub fn with_bytes(opcode: OpCode, bytes: Vec<u8>) -> Self {
        Instruction {
            opcode,
            operand: Operand::Bytes(bytes),
        }
    }

    /// Jump-like instruction, initially in its narrow form
    ///
    /// The opcode should be the narrow one (eg. `JMP` not `JMP_L`): the linker picks the final
    /// width and opcode.
    pub fn jump(opcode: OpCode, target: T) -> Self {
        Instruction {
            opcode,
            operand: Operand::Jump(target, JumpWidth::Narrow),
        }
    }

    /// Start of a protected region
    pub fn try_region(catch: Option<T>, finally: Option<T>) -> Self {
        Instruction {
            opcode: OpCode::TRY,
            operand: Operand::Try {
                catch,
                finally,
                width: JumpWidth::Narrow,
            },
        }
    }

    /// Push a byte string, using the smallest length prefix possible
    pub fn push_data(data: &[u8]) -> Result<Self, Error> {
        let (opcode, mut bytes) = if let Ok(len) = u8::try_from(data.len()) {
            (OpCode::PUSHDATA1, vec![len])
        } else if let Ok(len) = u16::try_from(data.len()) {
            (OpCode::PUSHDATA2, len.to_le_bytes().to_vec())
        } else if let Ok(len) = u32::try_from(data.len()) {
            (OpCode::PUSHDATA4, len.to_le_bytes().to_vec())
        } else {
            return Err(Error::MalformedOperand {
                opcode: OpCode::PUSHDATA4,
                reason: "data longer than 4GB",
            });
        };
        bytes.extend_from_slice(data);
        Ok(Instruction::with_bytes(opcode, bytes))
    }

    /// Symbolic or relative targets mentioned in the operand
    pub fn targets(&self) -> impl Iterator<Item = &T> {
        let (first, second) = match &self.operand {
            Operand::Jump(target, _) | Operand::Address(target) => (Some(target), None),
            Operand::Try { catch, finally, .. } => (catch.as_ref(), finally.as_ref()),
            Operand::None | Operand::Bytes(_) => (None, None),
        };
        first.into_iter().chain(second)
    }

    /// Width of the jump offset(s), if this is a jump-like instruction
    pub fn jump_width(&self) -> Option<JumpWidth> {
        match &self.operand {
            Operand::Jump(_, width) | Operand::Try { width, .. } => Some(*width),
            _ => None,
        }
    }

    /// Rebuild the instruction with different targets
    pub fn map_targets<U, E>(
        &self,
        mut f: impl FnMut(&T) -> Result<U, E>,
    ) -> Result<Instruction<U>, E> {
        let operand = match &self.operand {
            Operand::None => Operand::None,
            Operand::Bytes(bytes) => Operand::Bytes(bytes.clone()),
            Operand::Jump(target, width) => Operand::Jump(f(target)?, *width),
            Operand::Try {
                catch,
                finally,
                width,
            } => Operand::Try {
                catch: catch.as_ref().map(&mut f).transpose()?,
                finally: finally.as_ref().map(&mut f).transpose()?,
                width: *width,
            },
            Operand::Address(target) => Operand::Address(f(target)?),
        };
        Ok(Instruction {
            opcode: self.opcode,
            operand,
        })
    }

    /// Check the operand against the encoding rule of the opcode
    pub fn check<'i>(&self, isa: &'i dyn InstructionSet) -> Result<&'i OpcodeInfo, Error> {
        let info = isa.lookup(self.opcode)?;
        let malformed = |reason| Error::MalformedOperand {
            opcode: self.opcode,
            reason,
        };
        match (info.operand, &self.operand) {
            (OperandEncoding::None, Operand::None) => (),
            (OperandEncoding::Fixed(n), Operand::Bytes(bytes)) => {
                if bytes.len() != n {
                    return Err(malformed("wrong number of immediate bytes"));
                }
            }
            (OperandEncoding::Prefixed(prefix), Operand::Bytes(bytes)) => {
                if bytes.len() < prefix {
                    return Err(malformed("missing length prefix"));
                }
                let mut len_bytes = [0u8; 8];
                len_bytes[..prefix].copy_from_slice(&bytes[..prefix]);
                if u64::from_le_bytes(len_bytes) != (bytes.len() - prefix) as u64 {
                    return Err(malformed("length prefix does not match data"));
                }
            }
            (OperandEncoding::Jump(expected, _), Operand::Jump(_, found))
            | (OperandEncoding::Try(expected, _), Operand::Try { width: found, .. }) => {
                if expected != *found {
                    return Err(malformed("offset width does not match opcode"));
                }
            }
            (OperandEncoding::Address, Operand::Address(_)) => (),
            _ => return Err(malformed("operand kind does not match opcode")),
        }
        Ok(info)
    }
}

impl<T> Width for Instruction<T> {
    fn width(&self) -> usize {
        1 + match &self.operand {
            Operand::None => 0,
            Operand::Bytes(bytes) => bytes.len(),
            Operand::Jump(_, width) => width.bytes(),
            Operand::Try { width, .. } => 2 * width.bytes(),
            Operand::Address(_) => 4,
        }
    }
}

fn write_offset<W: WriteBytesExt>(
    writer: &mut W,
    offset: i32,
    width: JumpWidth,
) -> std::io::Result<()> {
    match width {
        JumpWidth::Narrow => i8::try_from(offset)
            .map_err(|_| IoError::new(ErrorKind::InvalidData, "offset does not fit in a byte"))?
            .serialize(writer),
        JumpWidth::Wide => offset.serialize(writer),
    }
}

impl Serialize for Instruction<i32> {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.opcode.0.serialize(writer)?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Bytes(bytes) => writer.write_all(bytes),
            Operand::Jump(offset, width) => write_offset(writer, *offset, *width),
            Operand::Try {
                catch,
                finally,
                width,
            } => {
                // A zero offset means "no handler"
                write_offset(writer, catch.unwrap_or(0), *width)?;
                write_offset(writer, finally.unwrap_or(0), *width)
            }
            Operand::Address(offset) => offset.serialize(writer),
        }
    }
}

fn take<'b>(reader: &mut &'b [u8], len: usize, at: usize) -> Result<&'b [u8], Error> {
    if reader.len() < len {
        return Err(Error::Truncated { offset: at });
    }
    let (taken, rest) = reader.split_at(len);
    *reader = rest;
    Ok(taken)
}

fn read_offset(reader: &mut &[u8], width: JumpWidth, at: usize) -> Result<i32, Error> {
    let truncated = |_| Error::Truncated { offset: at };
    match width {
        JumpWidth::Narrow => Ok(i8::deserialize(reader).map_err(truncated)? as i32),
        JumpWidth::Wide => i32::deserialize(reader).map_err(truncated),
    }
}

impl Instruction<i32> {
    /// Decode the instruction starting at byte `at`
    pub fn decode(bytes: &[u8], at: usize, isa: &dyn InstructionSet) -> Result<Self, Error> {
        let mut reader = bytes.get(at..).ok_or(Error::Truncated { offset: at })?;
        let opcode = OpCode(take(&mut reader, 1, at)?[0]);
        let info = isa.lookup(opcode)?;
        let operand = match info.operand {
            OperandEncoding::None => Operand::None,
            OperandEncoding::Fixed(len) => Operand::Bytes(take(&mut reader, len, at)?.to_vec()),
            OperandEncoding::Prefixed(prefix) => {
                let prefix_bytes = take(&mut reader, prefix, at)?;
                let mut len_bytes = [0u8; 8];
                len_bytes[..prefix].copy_from_slice(prefix_bytes);
                let len = usize::try_from(u64::from_le_bytes(len_bytes))
                    .map_err(|_| Error::Truncated { offset: at })?;
                let mut bytes = prefix_bytes.to_vec();
                bytes.extend_from_slice(take(&mut reader, len, at)?);
                Operand::Bytes(bytes)
            }
            OperandEncoding::Jump(width, _) => {
                Operand::Jump(read_offset(&mut reader, width, at)?, width)
            }
            OperandEncoding::Try(width, _) => {
                let catch = read_offset(&mut reader, width, at)?;
                let finally = read_offset(&mut reader, width, at)?;
                Operand::Try {
                    catch: Some(catch).filter(|off| *off != 0),
                    finally: Some(finally).filter(|off| *off != 0),
                    width,
                }
            }
            OperandEncoding::Address => Operand::Address(
                i32::deserialize(&mut reader).map_err(|_| Error::Truncated { offset: at })?,
            ),
        };
        Ok(Instruction { opcode, operand })
    }
}

/// Decode a whole script (or a method's slice of it) into instructions
///
/// `base` is the address of the first byte, so that the resulting offsets match the addresses the
/// instructions had in the original script.
pub fn decode_script(
    bytes: &[u8],
    base: Offset,
    isa: &dyn InstructionSet,
) -> Result<OffsetVec<Instruction<i32>>, Error> {
    let mut instructions = OffsetVec::new_starting_at(base);
    let mut position = 0;
    while position < bytes.len() {
        let instruction = Instruction::decode(bytes, position, isa)
            .map_err(|err| match err {
                Error::Truncated { offset } => Error::Truncated {
                    offset: offset + base.0,
                },
                other => other,
            })?;
        position += instruction.width();
        instructions.push(instruction);
    }
    Ok(instructions)
}

impl<T: fmt::Display> fmt::Display for Instruction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Bytes(bytes) => {
                f.write_str(" 0x")?;
                for byte in bytes {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Operand::Jump(target, _) | Operand::Address(target) => write!(f, " {}", target),
            Operand::Try { catch, finally, .. } => {
                match catch {
                    Some(catch) => write!(f, " catch={}", catch)?,
                    None => f.write_str(" catch=none")?,
                }
                match finally {
                    Some(finally) => write!(f, " finally={}", finally),
                    None => f.write_str(" finally=none"),
                }
            }
        }
    }
}
