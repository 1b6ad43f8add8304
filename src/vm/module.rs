//! Binary module artifact
//!
//! A module packages the script of a whole compilation unit along with the metadata needed to
//! call into it. Everything is little-endian:
//!
//! ```text
//! magic        u32   0x3346454E
//! compiler     [u8; 64]  UTF-8, zero padded
//! source       u16 length + UTF-8
//! methods      u16 count, then per method:
//!                name (u16 length + UTF-8), offset u32, length u32, params u8, locals u8, flags u8
//! script       u32 length + bytes
//! checksum     u32 = xxh32(all preceding bytes, seed 0)
//! ```

use super::binary_format::{Deserialize, Serialize};
use super::code::{LinkedMethod, LinkedProgram};
use super::{decode_script, Error, InstructionSet, MethodFlags};
use crate::util::Offset;
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Error as IoError, ErrorKind, Read};
use std::path::Path;
use xxhash_rust::xxh32::xxh32;

/// Magic number at the start of every module
pub const MAGIC: u32 = 0x3346454E;

/// Number of bytes reserved for the compiler name
pub const COMPILER_LEN: usize = 64;

/// Entry of the method table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodEntry {
    pub name: String,

    /// Address of the first byte of the method in the script
    pub offset: u32,

    /// Number of script bytes in the method
    pub length: u32,

    pub params: u8,
    pub locals: u8,
    pub flags: MethodFlags,
}

impl Serialize for MethodEntry {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.name.serialize(writer)?;
        self.offset.serialize(writer)?;
        self.length.serialize(writer)?;
        self.params.serialize(writer)?;
        self.locals.serialize(writer)?;
        self.flags.serialize(writer)
    }
}

impl Deserialize for MethodEntry {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        Ok(MethodEntry {
            name: String::deserialize(reader)?,
            offset: u32::deserialize(reader)?,
            length: u32::deserialize(reader)?,
            params: u8::deserialize(reader)?,
            locals: u8::deserialize(reader)?,
            flags: MethodFlags::deserialize(reader)?,
        })
    }
}

/// Module artifact
///
/// The checksum is not stored: it is computed when serializing and verified when
/// deserializing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleFile {
    /// Name (and version) of the compiler, at most 64 bytes
    pub compiler: String,

    /// Name of the source the module was compiled from
    pub source: String,

    pub methods: Vec<MethodEntry>,
    pub script: Vec<u8>,
}

impl ModuleFile {
    /// Package a linked program
    ///
    /// A compiler name longer than 64 bytes is cut short (on a character boundary).
    pub fn from_program(
        compiler: &str,
        source: &str,
        program: &LinkedProgram,
    ) -> Result<ModuleFile, Error> {
        let mut compiler_end = compiler.len().min(COMPILER_LEN);
        while !compiler.is_char_boundary(compiler_end) {
            compiler_end -= 1;
        }

        let methods = program
            .methods
            .iter()
            .map(|method| {
                let out_of_range = || Error::MethodOutOfRange {
                    name: method.name.clone(),
                };
                let offset = u32::try_from(method.start().0).map_err(|_| out_of_range())?;
                let length = u32::try_from(method.end().0 - method.start().0)
                    .map_err(|_| out_of_range())?;
                Ok(MethodEntry {
                    name: method.name.clone(),
                    offset,
                    length,
                    params: method.params,
                    locals: method.locals,
                    flags: method.flags,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(ModuleFile {
            compiler: compiler[..compiler_end].to_owned(),
            source: source.to_owned(),
            methods,
            script: program.script()?,
        })
    }

    /// Encode the module, checksum included
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut bytes: Vec<u8> = vec![];
        MAGIC.serialize(&mut bytes)?;

        let mut compiler = [0u8; COMPILER_LEN];
        let compiler_bytes = self.compiler.as_bytes();
        if compiler_bytes.len() > COMPILER_LEN {
            return Err(Error::IoError(IoError::new(
                ErrorKind::InvalidInput,
                "compiler name longer than 64 bytes",
            )));
        }
        compiler[..compiler_bytes.len()].copy_from_slice(compiler_bytes);
        bytes.extend_from_slice(&compiler);

        self.source.serialize(&mut bytes)?;
        self.methods.serialize(&mut bytes)?;

        let script_len = u32::try_from(self.script.len()).map_err(|_| {
            IoError::new(ErrorKind::InvalidInput, "script longer than 4GB")
        })?;
        script_len.serialize(&mut bytes)?;
        bytes.extend_from_slice(&self.script);

        let checksum = xxh32(&bytes, 0);
        checksum.serialize(&mut bytes)?;
        Ok(bytes)
    }

    /// Decode a module, verifying its magic number, checksum, and method table
    pub fn from_bytes(bytes: &[u8]) -> Result<ModuleFile, Error> {
        let mut reader = bytes;
        let magic = u32::deserialize(&mut reader).map_err(|_| Error::Truncated { offset: 0 })?;
        if magic != MAGIC {
            return Err(Error::BadMagic(magic));
        }

        let body_len = bytes
            .len()
            .checked_sub(4)
            .ok_or(Error::Truncated { offset: bytes.len() })?;
        let (body, mut checksum_bytes) = bytes.split_at(body_len);
        let expected = u32::deserialize(&mut checksum_bytes)?;
        let found = xxh32(body, 0);
        if expected != found {
            return Err(Error::ChecksumMismatch { expected, found });
        }

        let truncated = |err: IoError| {
            if err.kind() == ErrorKind::UnexpectedEof {
                Error::Truncated { offset: body_len }
            } else {
                Error::IoError(err)
            }
        };
        let mut reader = body.get(4..).ok_or(Error::Truncated { offset: body_len })?;

        let mut compiler = [0u8; COMPILER_LEN];
        reader.read_exact(&mut compiler).map_err(truncated)?;
        let compiler_len = compiler
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(COMPILER_LEN);
        let compiler = String::from_utf8(compiler[..compiler_len].to_vec())
            .map_err(|err| IoError::new(ErrorKind::InvalidData, err))?;

        let source = String::deserialize(&mut reader).map_err(truncated)?;
        let methods = Vec::<MethodEntry>::deserialize(&mut reader).map_err(truncated)?;
        let script_len = u32::deserialize(&mut reader).map_err(truncated)? as usize;
        if reader.len() < script_len {
            return Err(Error::Truncated { offset: body_len });
        }
        if reader.len() > script_len {
            return Err(Error::IoError(IoError::new(
                ErrorKind::InvalidData,
                "unexpected bytes between script and checksum",
            )));
        }
        let script = reader.to_vec();

        for method in &methods {
            let end = method.offset as usize + method.length as usize;
            if end > script.len() {
                return Err(Error::MethodOutOfRange {
                    name: method.name.clone(),
                });
            }
        }

        Ok(ModuleFile {
            compiler,
            source,
            methods,
            script,
        })
    }

    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<ModuleFile, Error> {
        ModuleFile::from_bytes(&std::fs::read(path)?)
    }

    /// Decode the script of every method back into instructions
    ///
    /// Sequence points are not part of the module, so the methods come back without any.
    pub fn decode(&self, isa: &dyn InstructionSet) -> Result<LinkedProgram, Error> {
        let methods = self
            .methods
            .iter()
            .map(|method| {
                let start = method.offset as usize;
                let end = start + method.length as usize;
                let bytes = self.script.get(start..end).ok_or_else(|| {
                    Error::MethodOutOfRange {
                        name: method.name.clone(),
                    }
                })?;
                Ok(LinkedMethod {
                    name: method.name.clone(),
                    params: method.params,
                    locals: method.locals,
                    flags: method.flags,
                    instructions: decode_script(bytes, Offset(start), isa)?,
                    sequence_points: vec![],
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(LinkedProgram { methods })
    }
}
