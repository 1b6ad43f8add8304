use super::{CompileErrors, Error, Intrinsic, MethodEmitter, Settings, StructuralKind, INTRINSICS};
use crate::ir::{CompilationUnit, MethodDecl};
use crate::optimize;
use crate::vm::code::{link, LinkedProgram, MethodCode, MethodId, Program};
use crate::vm::debug_info::DebugInfo;
use crate::vm::module::ModuleFile;
use crate::vm::{self, InstructionSet};
use std::collections::{HashMap, HashSet};

/// What callers need to know about a method of the unit
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MethodSignature {
    pub id: MethodId,
    pub params: usize,
    pub returns_value: bool,
}

/// Read-only state shared by every method emitter of a unit
pub struct CompilationContext<'a> {
    pub settings: &'a Settings,
    pub isa: &'a dyn InstructionSet,

    /// Signature of every method by name (the first definition wins if there are duplicates)
    pub methods: HashMap<String, MethodSignature>,

    pub intrinsics: &'static [Intrinsic],
}

impl<'a> CompilationContext<'a> {
    pub fn new(
        settings: &'a Settings,
        isa: &'a dyn InstructionSet,
        unit: &CompilationUnit,
    ) -> CompilationContext<'a> {
        let mut methods = HashMap::new();
        for (idx, method) in unit.methods.iter().enumerate() {
            methods
                .entry(method.name.clone())
                .or_insert(MethodSignature {
                    id: MethodId(idx),
                    params: method.params as usize,
                    returns_value: method.returns_value,
                });
        }
        CompilationContext {
            settings,
            isa,
            methods,
            intrinsics: INTRINSICS,
        }
    }
}

/// Result of compiling a unit
#[derive(Debug)]
pub struct CompiledModule {
    pub program: LinkedProgram,
    pub module: ModuleFile,
    pub debug_info: Option<DebugInfo>,
}

/// Compiles whole units: emits every method, optimizes, links, and packages the result
pub struct ModuleTranslator<'a> {
    settings: Settings,
    isa: &'a dyn InstructionSet,
}

impl<'a> ModuleTranslator<'a> {
    pub fn new(settings: Settings, isa: &'a dyn InstructionSet) -> ModuleTranslator<'a> {
        ModuleTranslator { settings, isa }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Compile a unit
    ///
    /// Emitting a method does not stop at the first method with errors: every error in the
    /// unit is reported, in method order.
    pub fn compile(&self, unit: &CompilationUnit) -> Result<CompiledModule, CompileErrors> {
        let context = CompilationContext::new(&self.settings, self.isa, unit);
        let results = if self.settings.parallel {
            emit_parallel(&context, &unit.methods)
        } else {
            unit.methods
                .iter()
                .map(|method| MethodEmitter::emit(&context, method))
                .collect()
        };

        let mut errors = vec![];
        let mut methods = Vec::with_capacity(unit.methods.len());
        let mut seen = HashSet::new();
        for (method, result) in unit.methods.iter().zip(results) {
            if !seen.insert(method.name.as_str()) {
                errors.push(Error::Structural {
                    method: method.name.clone(),
                    span: None,
                    kind: StructuralKind::DuplicateMethod(method.name.clone()),
                });
            }
            match result {
                Ok(code) => methods.push(code),
                Err(err) => errors.push(err),
            }
        }
        if !errors.is_empty() {
            log::debug!("`{}` has {} error(s)", unit.name, errors.len());
            return Err(CompileErrors(errors));
        }

        let mut program = Program { methods };
        if self.settings.optimize {
            let stats = optimize::optimize(&mut program, self.isa).map_err(internal)?;
            log::debug!("optimized `{}`: {:?}", unit.name, stats);
        }

        let linked = link(&program, self.isa).map_err(internal)?;
        let module =
            ModuleFile::from_program(&self.settings.compiler_name, &self.settings.source_name, &linked)
                .map_err(internal)?;
        let debug_info = if self.settings.emit_debug_info {
            Some(DebugInfo::from_program(&linked))
        } else {
            None
        };

        log::info!(
            "compiled `{}`: {} methods, {} bytes of script",
            unit.name,
            linked.methods.len(),
            module.script.len()
        );
        Ok(CompiledModule {
            program: linked,
            module,
            debug_info,
        })
    }
}

fn internal(error: vm::Error) -> CompileErrors {
    CompileErrors::from(Error::from(error))
}

/// Emit methods on as many threads as there are cores, keeping results in method order
///
/// Emitters share nothing but the read-only context, so the output does not depend on how the
/// methods are split up.
fn emit_parallel(
    context: &CompilationContext<'_>,
    methods: &[MethodDecl],
) -> Vec<Result<MethodCode, Error>> {
    if methods.is_empty() {
        return vec![];
    }
    let threads = std::thread::available_parallelism().map_or(1, |count| count.get());
    let chunk_size = (methods.len() + threads - 1) / threads;

    std::thread::scope(|scope| {
        let handles: Vec<_> = methods
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|method| MethodEmitter::emit(context, method))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| match handle.join() {
                Ok(results) => results,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{Expr, Stmt, StmtKind};
    use crate::vm::StandardInstructionSet;

    fn unit(methods: Vec<MethodDecl>) -> CompilationUnit {
        CompilationUnit {
            name: String::from("unit"),
            methods,
        }
    }

    #[test]
    fn signatures_are_indexed_by_name() {
        let isa = StandardInstructionSet;
        let settings = Settings::default();
        let unit = unit(vec![
            MethodDecl::new("a", vec![]),
            MethodDecl::new("b", vec![]).with_params(2).returning(),
            MethodDecl::new("a", vec![]).with_params(1),
        ]);
        let context = CompilationContext::new(&settings, &isa, &unit);
        assert_eq!(context.methods.len(), 2);
        assert_eq!(context.methods["a"].id, MethodId(0));
        assert_eq!(
            context.methods["b"],
            MethodSignature {
                id: MethodId(1),
                params: 2,
                returns_value: true
            }
        );
    }

    #[test]
    fn errors_are_collected_in_method_order() {
        let isa = StandardInstructionSet;
        let translator = ModuleTranslator::new(Settings::default(), &isa);
        let errors = translator
            .compile(&unit(vec![
                MethodDecl::new("first", vec![Stmt::new(StmtKind::Break)]),
                MethodDecl::new("fine", vec![]),
                MethodDecl::new("fine", vec![]),
                MethodDecl::new("last", vec![Stmt::expr(Expr::call("missing", vec![]))]),
            ]))
            .unwrap_err();

        let methods: Vec<_> = errors.errors().iter().map(|err| err.method()).collect();
        assert_eq!(methods, vec![Some("first"), Some("fine"), Some("last")]);
        assert!(!errors.has_internal());
    }

    #[test]
    fn compiles_to_a_module() {
        let isa = StandardInstructionSet;
        let mut settings = Settings::new("two.src");
        settings.compiler_name = String::from("test");
        let translator = ModuleTranslator::new(settings, &isa);
        let compiled = translator
            .compile(&unit(vec![
                MethodDecl::new("main", vec![Stmt::expr(Expr::call("two", vec![]))]),
                MethodDecl::new("two", vec![Stmt::ret(Some(Expr::int(2)))]).returning(),
            ]))
            .unwrap();

        // main: CALL +4, DROP, RET; two: PUSH2, RET
        assert_eq!(compiled.module.script, vec![0x34, 0x04, 0x45, 0x40, 0x12, 0x40]);
        assert_eq!(compiled.module.compiler, "test");
        assert_eq!(compiled.module.source, "two.src");
        assert_eq!(compiled.module.methods[1].offset, 4);
        assert!(compiled.debug_info.is_some());
    }
}
