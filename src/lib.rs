//! Code generation, linking, and control flow analysis for a stack-based contract VM
//!
//! A front end hands over a resolved [`ir::CompilationUnit`]. [`translate`] lowers every method
//! into symbolic code for the target [`vm`], links it into a script, optionally runs the
//! [`optimize`] passes, and packages the result as a [`vm::module::ModuleFile`] along with a
//! [`vm::debug_info::DebugInfo`] map.

pub mod ir;
pub mod optimize;
pub mod translate;
pub mod util;
pub mod vm;
