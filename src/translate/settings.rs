pub struct Settings {
    /// Name (and version) of the compiler, recorded in the module header
    ///
    /// At most 64 bytes are kept.
    pub compiler_name: String,

    /// Name of the source the unit came from, recorded in the module header
    pub source_name: String,

    /// Run the optimizer after linking (constant branch folding, jump threading, dead block
    /// removal)
    pub optimize: bool,

    /// Emit methods on separate threads
    ///
    /// Only the time it takes changes: the output is identical either way.
    pub parallel: bool,

    /// Fuse an integer comparison followed by a conditional jump into one compare-and-jump
    /// instruction (eg. `LT; JMPIFNOT` becomes `JMPGE`)
    pub fuse_comparisons: bool,

    /// Produce a debug map correlating addresses with source spans
    pub emit_debug_info: bool,
}

impl Settings {
    pub fn new(source_name: impl Into<String>) -> Settings {
        Settings {
            compiler_name: format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            source_name: source_name.into(),
            optimize: true,
            parallel: false,
            fuse_comparisons: true,
            emit_debug_info: true,
        }
    }
}

impl Default for Settings {
    fn default() -> Settings {
        Settings::new("")
    }
}
