//! Lowering of resolved method bodies into VM code
//!
//! [`ModuleTranslator`] drives the whole pipeline for a unit. Each method is emitted on its own
//! by a [`MethodEmitter`], which relies on a [`ScopeTracker`] to get `break`, `continue`,
//! `return`, and `goto` out of protected regions right.

mod errors;
mod intrinsics;
mod method;
mod module;
mod scopes;
mod settings;

pub use errors::*;
pub use intrinsics::*;
pub use method::*;
pub use module::*;
pub use scopes::*;
pub use settings::*;
