//! Method code representation and generation
//!
//! ### Structure
//!
//! Code goes through two representations:
//!
//!   - [`MethodCode`] is symbolic: jumps refer to [`Label`]s in the same method and calls refer
//!     to other methods by [`MethodId`]. Nothing has an address yet.
//!   - [`LinkedMethod`] is addressed: every instruction sits at its final position in the
//!     script, and jumps carry relative offsets whose width has been settled.
//!
//! [`link`] goes from the first to the second, [`unlink`] goes back.
//!
//! ### Code generation
//!
//! Getting stack depths right by hand is tedious and error prone, so [`CodeBuffer`] tracks the
//! evaluation stack depth and reachability as instructions are pushed, and checks that every
//! jump agrees with its target label on the depth.
//!
//! ### Analysis
//!
//! Once linked, a method can be split into a [`BasicBlockGraph`], which is what the optimizer and
//! coverage accounting work on.

mod basic_block;
mod buffer;
pub mod jump_encoding;
mod label;
mod method;

pub use basic_block::*;
pub use buffer::*;
pub use jump_encoding::{link, unlink, LinkedMethod, LinkedProgram};
pub use label::*;
pub use method::*;
