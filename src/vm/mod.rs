//! Generate code for a stack-based virtual machine
//!
//! ### Simple example
//!
//! Consider a method that adds its two arguments:
//!
//! ```text
//! fn add(a, b) { return a + b; }
//! ```
//!
//! Generating, linking, and packaging its code can be done as follows:
//!
//! ```
//! use stackc::vm::code::{link, CodeBuffer, Program};
//! use stackc::vm::module::ModuleFile;
//! use stackc::vm::*;
//!
//! # fn generate() -> Result<(), Error> {
//! let isa = StandardInstructionSet;
//!
//! // Generate the method body
//! let mut code = CodeBuffer::new(&isa);
//! code.push(Instruction::with_bytes(OpCode::INITSLOT, vec![0, 2]))?;
//! code.push(Instruction::simple(OpCode::LDARG0))?;
//! code.push(Instruction::simple(OpCode::LDARG1))?;
//! code.push(Instruction::simple(OpCode::ADD))?;
//! code.push_dynamic(Instruction::simple(OpCode::RET), 1, 0)?;
//! let flags = MethodFlags::PUBLIC | MethodFlags::RETURNS_VALUE;
//! let method = code.finish(String::from("add"), 2, 0, flags)?;
//!
//! // Assign addresses
//! let program = link(&Program { methods: vec![method] }, &isa)?;
//! assert_eq!(program.script()?, vec![0x57, 0, 2, 0x78, 0x79, 0x9E, 0x40]);
//!
//! // Package everything into a module file
//! let module = ModuleFile::from_program("example", "add.src", &program)?;
//! let bytes = module.to_bytes()?;
//! assert_eq!(ModuleFile::from_bytes(&bytes)?, module);
//! # Ok(())
//! # }
//! # generate().unwrap();
//! ```

pub mod binary_format;
pub mod code;
pub mod debug_info;
mod errors;
mod instruction;
mod instruction_set;
mod method_flags;
pub mod module;

pub use errors::*;
pub use instruction::*;
pub use instruction_set::*;
pub use method_flags::*;
