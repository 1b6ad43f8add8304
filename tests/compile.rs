use stackc::ir::*;
use stackc::translate::{CompileErrors, CompiledModule, Error, ModuleTranslator, Settings};
use stackc::translate::{StructuralKind, Unrepresentable};
use stackc::util::Offset;
use stackc::vm::code::{BasicBlockGraph, BlockId, LinkedMethod};
use stackc::vm::module::ModuleFile;
use stackc::vm::{self, FlowKind, OpCode, Operand, StandardInstructionSet};

fn compile_with(settings: Settings, methods: Vec<MethodDecl>) -> Result<CompiledModule, CompileErrors> {
    let isa = StandardInstructionSet;
    let unit = CompilationUnit {
        name: String::from("test"),
        methods,
    };
    ModuleTranslator::new(settings, &isa).compile(&unit)
}

fn compile(methods: Vec<MethodDecl>) -> CompiledModule {
    compile_with(Settings::new("test.src"), methods).unwrap()
}

fn compile_unoptimized(methods: Vec<MethodDecl>) -> CompiledModule {
    let mut settings = Settings::new("test.src");
    settings.optimize = false;
    compile_with(settings, methods).unwrap()
}

fn log(message: &str) -> Stmt {
    Stmt::expr(Expr::intrinsic(
        "System.Runtime.Log",
        vec![Expr::string(message)],
    ))
}

fn opcodes(method: &LinkedMethod) -> Vec<OpCode> {
    method
        .instructions
        .iter()
        .map(|(_, _, insn)| insn.opcode)
        .collect()
}

/// Index of the instruction a jump lands on
fn jump_target(method: &LinkedMethod, idx: usize) -> usize {
    let (address, insn) = method.instructions.get_index(idx).unwrap();
    match insn.operand {
        Operand::Jump(relative, _) => method.target_index(address, relative).unwrap(),
        ref other => panic!("instruction {} is not a jump: {:?}", idx, other),
    }
}

/// Index of the instruction a `TRY`'s `finally` handler starts at
fn finally_target(method: &LinkedMethod, idx: usize) -> usize {
    let (address, insn) = method.instructions.get_index(idx).unwrap();
    match insn.operand {
        Operand::Try {
            finally: Some(relative),
            ..
        } => method.target_index(address, relative).unwrap(),
        ref other => panic!("instruction {} has no finally handler: {:?}", idx, other),
    }
}

fn graph(method: &LinkedMethod) -> BasicBlockGraph<'_> {
    BasicBlockGraph::build(method, &StandardInstructionSet).unwrap()
}

#[test]
fn straight_line_code_is_one_block() {
    let compiled = compile(vec![MethodDecl::new(
        "main",
        vec![log("one"), log("two"), log("three")],
    )]);
    let method = &compiled.program.methods[0];
    let graph = graph(method);
    assert_eq!(graph.len(), 1);
    assert_eq!(graph.terminator_flow(BlockId(0)), FlowKind::Terminate);
    assert!(graph.unreachable_blocks().is_empty());
}

#[test]
fn return_through_nested_finally_blocks() {
    let body = vec![Stmt::try_finally(
        vec![Stmt::try_finally(
            vec![Stmt::try_finally(vec![Stmt::ret(None)], vec![log("inner")])],
            vec![log("middle")],
        )],
        vec![log("outer")],
    )];
    let compiled = compile_unoptimized(vec![MethodDecl::new("leave", body)]);
    let method = &compiled.program.methods[0];

    #[rustfmt::skip]
    assert_eq!(
        opcodes(method),
        vec![
            OpCode::TRY, OpCode::TRY, OpCode::TRY,
            OpCode::ENDTRY,
            OpCode::PUSHDATA1, OpCode::SYSCALL, OpCode::ENDFINALLY,
            OpCode::ENDTRY,
            OpCode::PUSHDATA1, OpCode::SYSCALL, OpCode::ENDFINALLY,
            OpCode::ENDTRY,
            OpCode::PUSHDATA1, OpCode::SYSCALL, OpCode::ENDFINALLY,
            OpCode::JMP,
            OpCode::RET,
        ]
    );

    // Innermost handler first
    assert_eq!(finally_target(method, 2), 4);
    assert_eq!(finally_target(method, 1), 8);
    assert_eq!(finally_target(method, 0), 12);

    // Each frame is left with its own `ENDTRY`, from the inside out
    assert_eq!(jump_target(method, 3), 7);
    assert_eq!(jump_target(method, 7), 11);
    assert_eq!(jump_target(method, 11), 15);
    assert_eq!(jump_target(method, 15), 16);
}

#[test]
fn constant_false_branch_is_removed() {
    let body = vec![
        Stmt::if_else(Expr::bool(false), vec![Stmt::ret(Some(Expr::int(1)))], vec![]),
        Stmt::ret(Some(Expr::int(2))),
    ];
    let method = MethodDecl::new("pick", body).returning();

    let unoptimized = compile_unoptimized(vec![method.clone()]);
    let linked = &unoptimized.program.methods[0];
    assert_eq!(
        opcodes(linked),
        vec![
            OpCode::PUSHF,
            OpCode::JMPIFNOT,
            OpCode::PUSH1,
            OpCode::RET,
            OpCode::PUSH2,
            OpCode::RET
        ]
    );
    let blocks = graph(linked);
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks.terminator_flow(BlockId(0)), FlowKind::Branch);
    let mut successors: Vec<_> = blocks.successors(BlockId(0)).collect();
    successors.sort();
    assert_eq!(successors, vec![BlockId(1), BlockId(2)]);
    assert_eq!(blocks.terminator_flow(BlockId(1)), FlowKind::Terminate);
    assert_eq!(blocks.terminator_flow(BlockId(2)), FlowKind::Terminate);

    let optimized = compile(vec![method]);
    assert_eq!(opcodes(&optimized.program.methods[0]), vec![OpCode::PUSH2, OpCode::RET]);
    assert_eq!(optimized.module.script, vec![0x12, 0x40]);
}

#[test]
fn break_out_of_a_try_in_a_loop() {
    let body = vec![Stmt::while_loop(
        Expr::bool(true),
        vec![Stmt::try_finally(
            vec![Stmt::new(StmtKind::Break)],
            vec![log("cleanup")],
        )],
    )];
    let method = MethodDecl::new("once", body);

    let unoptimized = compile_unoptimized(vec![method.clone()]);
    let linked = &unoptimized.program.methods[0];
    assert_eq!(
        opcodes(linked),
        vec![
            OpCode::TRY,
            OpCode::ENDTRY,
            OpCode::PUSHDATA1,
            OpCode::SYSCALL,
            OpCode::ENDFINALLY,
            OpCode::JMP,
            OpCode::RET
        ]
    );
    // `ENDTRY` to a stub, which jumps to the loop exit
    assert_eq!(jump_target(linked, 1), 5);
    assert_eq!(jump_target(linked, 5), 6);

    // The stub is threaded away
    let optimized = compile(vec![method]);
    let linked = &optimized.program.methods[0];
    assert!(!opcodes(linked).contains(&OpCode::JMP));
    let exit = jump_target(linked, 1);
    assert_eq!(opcodes(linked)[exit], OpCode::RET);
}

#[test]
fn switch_without_default() {
    let sections = (1..=4)
        .map(|case| SwitchSection {
            values: vec![Literal::int(case)],
            default: false,
            body: vec![log("case"), Stmt::new(StmtKind::Break)],
        })
        .collect();
    let body = vec![Stmt::new(StmtKind::Switch {
        scrutinee: Expr::arg(0),
        sections,
    })];
    let compiled = compile_unoptimized(vec![MethodDecl::new("dispatch", body).with_params(1)]);
    let method = &compiled.program.methods[0];
    assert_eq!(method.locals, 1);

    let blocks = graph(method);
    // 4 comparisons, the jump past the switch, 4 sections, and the exit
    assert_eq!(blocks.len(), 10);
    for case in 0..4 {
        assert_eq!(blocks.predecessors(BlockId(5 + case)), &[BlockId(case)]);
    }
    assert_eq!(
        blocks.predecessors(BlockId(9)),
        &[BlockId(4), BlockId(5), BlockId(6), BlockId(7), BlockId(8)]
    );
    assert!(blocks.unreachable_blocks().is_empty());
}

#[test]
fn errors_from_every_method_are_reported() {
    let errors = compile_with(
        Settings::default(),
        vec![
            MethodDecl::new("jumps", vec![Stmt::goto("nowhere")]),
            MethodDecl::new("fine", vec![log("fine")]),
            MethodDecl::new(
                "huge",
                vec![Stmt::expr(Expr::Literal(Literal::Integer(vec![0x55; 40])))],
            ),
            MethodDecl::new("again", vec![Stmt::new(StmtKind::Rethrow)]),
        ],
    )
    .unwrap_err();

    let errors = errors.errors();
    assert_eq!(errors.len(), 3);
    assert!(matches!(
        &errors[0],
        Error::Structural { method, kind: StructuralKind::UndefinedLabel(label), .. }
            if method == "jumps" && label == "nowhere"
    ));
    assert!(matches!(
        &errors[1],
        Error::Unrepresentable { reason: Unrepresentable::IntegerTooWide(40), .. }
    ));
    assert!(matches!(
        &errors[2],
        Error::Structural { kind: StructuralKind::RethrowOutsideCatch, .. }
    ));
    assert!(errors.iter().all(|err| !err.is_internal()));
    assert!(errors[0].to_string().contains("undefined label `nowhere`"));
}

/// A unit that exercises most statement kinds
fn sample_unit(count: usize) -> Vec<MethodDecl> {
    (0..count)
        .map(|idx| {
            let counter = Slot::Local(1);
            let body = vec![
                Stmt::assign(Slot::Local(0), Expr::int(idx as i64 * 1000)).at(SourceSpan::new(
                    0,
                    idx as u32 + 1,
                    1,
                    idx as u32 + 1,
                    20,
                )),
                Stmt::new(StmtKind::For {
                    init: vec![Stmt::assign(counter, Expr::int(0))],
                    cond: Some(Expr::binary(BinaryOp::Lt, Expr::Load(counter), Expr::arg(0))),
                    step: vec![Stmt::assign(
                        counter,
                        Expr::binary(BinaryOp::Add, Expr::Load(counter), Expr::int(1)),
                    )],
                    body: vec![
                        Stmt::if_else(
                            Expr::binary(BinaryOp::NumEqual, Expr::Load(counter), Expr::int(3)),
                            vec![Stmt::new(StmtKind::Continue)],
                            vec![],
                        ),
                        log("iteration"),
                    ],
                }),
                Stmt::try_catch(
                    vec![Stmt::expr(Expr::call(
                        format!("m{}", (idx + 1) % count),
                        vec![Expr::local(0)],
                    ))],
                    Some(2),
                    vec![log("caught")],
                ),
                Stmt::ret(Some(Expr::local(0))),
            ];
            MethodDecl::new(format!("m{}", idx), body)
                .with_params(1)
                .with_locals(3)
                .returning()
        })
        .collect()
}

#[test]
fn parallel_emission_is_deterministic() {
    let sequential = compile(sample_unit(24));

    let mut settings = Settings::new("test.src");
    settings.parallel = true;
    let parallel = compile_with(settings, sample_unit(24)).unwrap();

    assert_eq!(
        parallel.module.to_bytes().unwrap(),
        sequential.module.to_bytes().unwrap()
    );
    assert_eq!(parallel.debug_info, sequential.debug_info);
}

#[test]
fn module_round_trip() {
    let compiled = compile(sample_unit(5));
    let bytes = compiled.module.to_bytes().unwrap();
    let module = ModuleFile::from_bytes(&bytes).unwrap();
    assert_eq!(module, compiled.module);

    let decoded = module.decode(&StandardInstructionSet).unwrap();
    assert_eq!(decoded.methods.len(), 5);
    for (decoded, linked) in decoded.methods.iter().zip(&compiled.program.methods) {
        assert_eq!(decoded.name, linked.name);
        assert_eq!(decoded.instructions, linked.instructions);
    }

    let mut corrupted = bytes.clone();
    let middle = corrupted.len() / 2;
    corrupted[middle] ^= 0x01;
    assert!(matches!(
        ModuleFile::from_bytes(&corrupted),
        Err(vm::Error::ChecksumMismatch { .. })
    ));

    let path = std::env::temp_dir().join(format!("stackc-round-trip-{}.nef", std::process::id()));
    compiled.module.save_to_path(&path).unwrap();
    let loaded = ModuleFile::load_from_path(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(loaded, compiled.module);
}

#[test]
fn debug_info_maps_addresses_to_statements() {
    let first = SourceSpan::new(0, 1, 1, 1, 12);
    let second = SourceSpan::new(0, 2, 1, 2, 12);
    let compiled = compile(vec![MethodDecl::new(
        "main",
        vec![log("a").at(first), log("b").at(second)],
    )]);
    let debug_info = compiled.debug_info.unwrap();

    // `PUSHDATA1 "a"` is 3 bytes, `SYSCALL` 5
    let (method, point) = debug_info.lookup(Offset(3)).unwrap();
    assert_eq!(method.name, "main");
    assert_eq!(point.span, first);
    let (_, point) = debug_info.lookup(Offset(8)).unwrap();
    assert_eq!(point.span, second);
    assert!(debug_info.lookup(Offset(100)).is_none());
}
