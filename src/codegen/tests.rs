use proptest::prelude::*;

use super::*;
use crate::ast::{Expr, FuncDef, Op, Program, Stmt};
use crate::diag::CodegenError;
use crate::isa::{op, AddrMode, Cond, Insn, Reg};
use crate::output::{Entry, RefKind};
use crate::runner::{
    compile_program, compile_program_with_policy, CompileOutput, CompilerConfig,
    CompilerConfigBuilder,
};

fn func(ident: &str, params: &[&str], body: Stmt) -> FuncDef {
    FuncDef {
        ident: ident.into(),
        params: params.iter().map(|p| p.to_string()).collect(),
        body,
    }
}

fn compile(funcs: Vec<FuncDef>) -> CompileOutput {
    let output =
        compile_program(&Program { funcs }, &CompilerConfig::default()).expect("codegen failed");
    assert!(
        !output.diagnostics.has_errors(),
        "unexpected errors: {}",
        output.diagnostics
    );
    output
}

fn compile_pie(funcs: Vec<FuncDef>) -> CompileOutput {
    let config = CompilerConfigBuilder::default()
        .force_pie(true)
        .build()
        .unwrap();
    compile_program(&Program { funcs }, &config).expect("codegen failed")
}

fn word(insn: Insn) -> Entry {
    Entry::Word(insn.pack())
}

fn imm(value: u16) -> Entry {
    Entry::Word(value)
}

fn def(label: &str) -> Entry {
    Entry::LabelDef(label.into())
}

fn abs(label: &str) -> Entry {
    Entry::LabelRef {
        label: label.into(),
        addend: 0,
        kind: RefKind::AbsPtr,
    }
}

/// `MOV dest, imm`; the immediate word follows separately.
fn mov_imm(dest: Reg) -> Entry {
    word(Insn {
        y: false,
        x: AddrMode::Imm,
        b: Reg::Imm,
        a: dest,
        o: op::mov(Cond::Always),
    })
}

/// A conditional jump in absolute form; the reference word follows.
fn jump_abs(cond: Cond) -> Entry {
    word(Insn {
        y: false,
        x: AddrMode::Imm,
        b: Reg::Imm,
        a: Reg::Pc,
        o: op::mov(cond),
    })
}

/// A conditional jump in PIE form; the reference word follows.
fn jump_pie(cond: Cond) -> Entry {
    word(Insn {
        y: true,
        x: AddrMode::Pc,
        b: Reg::Imm,
        a: Reg::Pc,
        o: op::lea(cond),
    })
}

/// A unary math instruction on a register.
fn math1_reg(opcode: u8, reg: Reg) -> Entry {
    word(Insn {
        y: false,
        x: AddrMode::Imm,
        b: Reg::R0,
        a: reg,
        o: opcode,
    })
}

/* ==== The literal scenario streams ==== */

#[test]
fn empty_function_is_label_and_return() {
    let output = compile(vec![func("f", &[], Stmt::Block(vec![]))]);
    assert_eq!(output.asm.entries(), &[def("f"), word(Insn::RET)]);
}

#[test]
fn return_constant_moves_the_immediate_into_r0() {
    let output = compile(vec![func("f", &[], Stmt::Return(Some(Expr::int(42))))]);
    assert_eq!(
        output.asm.entries(),
        &[def("f"), mov_imm(Reg::R0), imm(0x002a), word(Insn::RET)]
    );
}

#[test]
fn adding_two_register_parameters_lands_in_r0() {
    let body = Stmt::Return(Some(Expr::binary(
        Op::Add,
        Expr::ident("a"),
        Expr::ident("b"),
    )));
    let output = compile(vec![func("f", &["a", "b"], body)]);
    assert_eq!(
        output.asm.entries(),
        &[
            def("f"),
            word(Insn::SUB_ST),
            imm(2),
            // One ADD combining both parameter registers in place.
            word(Insn {
                y: false,
                x: AddrMode::Imm,
                b: Reg::R1,
                a: Reg::R0,
                o: op::ADD,
            }),
            word(Insn::ADD_ST),
            imm(2),
            word(Insn::RET),
        ]
    );
}

#[test]
fn if_else_branches_over_the_true_arm() {
    let body = Stmt::If {
        cond: Expr::ident("a"),
        then_branch: Box::new(Stmt::Return(Some(Expr::int(1)))),
        else_branch: Some(Box::new(Stmt::Return(Some(Expr::int(0))))),
    };
    let output = compile(vec![func("f", &["a"], body)]);
    assert_eq!(
        output.asm.entries(),
        &[
            def("f"),
            word(Insn::SUB_ST),
            imm(1),
            math1_reg(op::CMP1, Reg::R0),
            jump_abs(Cond::Uge),
            abs(".L0"),
            // Fall through arm: return 0.
            mov_imm(Reg::R0),
            imm(0),
            word(Insn::ADD_ST),
            imm(1),
            word(Insn::RET),
            def(".L0"),
            // True arm: return 1.
            mov_imm(Reg::R0),
            imm(1),
            word(Insn::ADD_ST),
            imm(1),
            word(Insn::RET),
        ]
    );
}

fn countdown_body() -> Stmt {
    Stmt::While {
        cond: Expr::ident("n"),
        body: Box::new(Stmt::Expr(Expr::assign(
            Expr::ident("n"),
            Expr::binary(Op::Sub, Expr::ident("n"), Expr::int(1)),
        ))),
        do_while: false,
    }
}

#[test]
fn while_loop_checks_at_the_bottom() {
    let output = compile(vec![func("f", &["n"], countdown_body())]);
    assert_eq!(
        output.asm.entries(),
        &[
            def("f"),
            word(Insn::SUB_ST),
            imm(1),
            jump_abs(Cond::Always),
            abs(".L1"),
            def(".L0"),
            math1_reg(op::DEC, Reg::R0),
            def(".L1"),
            math1_reg(op::CMP1, Reg::R0),
            jump_abs(Cond::Uge),
            abs(".L0"),
            word(Insn::ADD_ST),
            imm(1),
            word(Insn::RET),
        ]
    );
}

#[test]
fn do_while_falls_through_into_the_body() {
    let body = Stmt::While {
        cond: Expr::ident("n"),
        body: Box::new(Stmt::Expr(Expr::assign(
            Expr::ident("n"),
            Expr::binary(Op::Sub, Expr::ident("n"), Expr::int(1)),
        ))),
        do_while: true,
    };
    let output = compile(vec![func("f", &["n"], body)]);
    assert_eq!(
        output.asm.entries(),
        &[
            def("f"),
            word(Insn::SUB_ST),
            imm(1),
            def(".L0"),
            math1_reg(op::DEC, Reg::R0),
            def(".L1"),
            math1_reg(op::CMP1, Reg::R0),
            jump_abs(Cond::Uge),
            abs(".L0"),
            word(Insn::ADD_ST),
            imm(1),
            word(Insn::RET),
        ]
    );
}

#[test]
fn pie_differs_only_in_jump_encoding_and_reference_kind() {
    let plain = compile(vec![func("f", &["n"], countdown_body())]);
    let pie = compile_pie(vec![func("f", &["n"], countdown_body())]);

    assert_eq!(plain.asm.entries().len(), pie.asm.entries().len());
    for (a, b) in plain.asm.entries().iter().zip(pie.asm.entries()) {
        match (a, b) {
            (Entry::LabelRef { label: la, kind: ka, .. }, Entry::LabelRef { label: lb, kind: kb, .. }) => {
                assert_eq!(la, lb);
                assert_eq!(*ka, RefKind::AbsPtr);
                assert_eq!(*kb, RefKind::OffsPtr);
            }
            (Entry::Word(wa), Entry::Word(wb)) if wa != wb => {
                // The only differing words are the two jump forms.
                let (ia, ib) = (Insn::unpack(*wa), Insn::unpack(*wb));
                assert_eq!(ia.o & 0x0f, ib.o & 0x0f);
                assert_eq!(ia.pack(), jump_abs_raw(ia.o & 0x0f));
                assert_eq!(ib.pack(), jump_pie_raw(ib.o & 0x0f));
            }
            _ => assert_eq!(a, b),
        }
    }
}

fn jump_abs_raw(cond_bits: u8) -> u16 {
    match jump_abs(Cond::Always) {
        Entry::Word(base) => base & !0x0f | cond_bits as u16,
        _ => unreachable!(),
    }
}

fn jump_pie_raw(cond_bits: u8) -> u16 {
    match jump_pie(Cond::Always) {
        Entry::Word(base) => base & !0x0f | cond_bits as u16,
        _ => unreachable!(),
    }
}

/* ==== Algebraic properties ==== */

#[test]
fn adding_one_is_the_increment_peephole() {
    let binary = compile(vec![func(
        "f",
        &["a"],
        Stmt::Return(Some(Expr::binary(Op::Add, Expr::ident("a"), Expr::int(1)))),
    )]);
    let unary = compile(vec![func(
        "f",
        &["a"],
        Stmt::Return(Some(Expr::unary(Op::Add, Expr::ident("a")))),
    )]);
    assert_eq!(binary.asm.entries(), unary.asm.entries());
}

#[test]
fn comparing_against_one_uses_the_unary_compare() {
    let output = compile(vec![func(
        "f",
        &["a"],
        Stmt::Return(Some(Expr::binary(Op::Lt, Expr::ident("a"), Expr::int(1)))),
    )]);
    let cmp1 = math1_reg(op::CMP1, Reg::R0);
    assert!(output.asm.entries().contains(&cmp1));
    // No binary CMP anywhere in the stream.
    for entry in output.asm.entries() {
        if let Entry::Word(word) = entry {
            assert_ne!(Insn::unpack(*word).o & !op::CARRY_CONT, op::CMP);
        }
    }
}

#[test]
fn double_negation_of_a_condition_emits_nothing() {
    let config = CompilerConfig::default();
    let policy = HashedPolicy;
    let mut ctx = GenContext::new(&config, &policy);
    ctx.func = "f".into();

    let cond = ctx.pool.temp(Place::Cond {
        cond: Cond::Slt,
        generation: ctx.cond_generation,
    });
    let before = ctx.out.entries().len();
    let once = ctx.gen_expr_math1(Op::LogicNot, None, cond).unwrap();
    assert_eq!(
        ctx.pool.place(once),
        Place::Cond {
            cond: Cond::Sge,
            generation: ctx.cond_generation
        }
    );
    let twice = ctx.gen_expr_math1(Op::LogicNot, None, once).unwrap();
    assert_eq!(twice, cond);
    assert_eq!(
        ctx.pool.place(twice),
        Place::Cond {
            cond: Cond::Slt,
            generation: ctx.cond_generation
        }
    );
    assert_eq!(ctx.out.entries().len(), before);
}

#[test]
fn branch_true_and_inverted_branch_false_emit_the_same_words() {
    let config = CompilerConfig::default();
    let policy = HashedPolicy;

    let mut ctx = GenContext::new(&config, &policy);
    ctx.func = "f".into();
    let c = ctx.pool.temp(Place::Cond {
        cond: Cond::Eq,
        generation: ctx.cond_generation,
    });
    ctx.branch(c, Some(".LX"), None).unwrap();
    let direct = ctx.out.entries().to_vec();

    let mut ctx = GenContext::new(&config, &policy);
    ctx.func = "f".into();
    let c = ctx.pool.temp(Place::Cond {
        cond: Cond::Ne,
        generation: ctx.cond_generation,
    });
    ctx.branch(c, None, Some(".LX")).unwrap();
    assert_eq!(ctx.out.entries(), direct.as_slice());
}

/* ==== Allocator behavior ==== */

#[test]
fn pick_register_without_vacate_fails_when_full() {
    let config = CompilerConfig::default();
    let policy = HashedPolicy;
    let mut ctx = GenContext::new(&config, &policy);
    ctx.func = "f".into();
    for i in 0..crate::isa::NUM_REGS {
        let reg = Reg::gp(i);
        let id = ctx.pool.temp(Place::Reg(reg));
        ctx.regs.occupy(reg, id);
    }
    assert_eq!(
        ctx.pick_register(false),
        Err(CodegenError::NoFreeRegister)
    );
}

#[test]
fn eviction_spills_a_parameter_to_its_home_slot() {
    let body = Stmt::Block(vec![
        Stmt::Declare {
            ident: "x".into(),
            init: Some(Expr::int(5)),
        },
        Stmt::Declare {
            ident: "y".into(),
            init: Some(Expr::int(7)),
        },
        Stmt::Return(Some(Expr::binary(
            Op::Add,
            Expr::ident("x"),
            Expr::ident("y"),
        ))),
    ]);
    let program = Program {
        funcs: vec![func("f", &["a", "b", "c", "d"], body)],
    };
    let config = CompilerConfig::default();
    let policy = FixedPolicy(Reg::R1);
    let output = compile_program_with_policy(&program, &config, &policy).unwrap();
    assert!(!output.diagnostics.has_errors());
    assert!(output.resolve().is_ok());

    // The spill of R1 to its reserved home slot must be in the stream:
    // MOV [ST+d], R1 with the displacement word following.
    let spill = Insn {
        y: true,
        x: AddrMode::St,
        b: Reg::R1,
        a: Reg::St,
        o: op::mov(Cond::Always),
    };
    assert!(output.asm.entries().contains(&word(spill)));
}

#[test]
fn descriptor_follows_the_value_on_eviction() {
    let config = CompilerConfig::default();
    let policy = FixedPolicy(Reg::R0);
    let mut ctx = GenContext::new(&config, &policy);
    let f = func(
        "f",
        &["a"],
        Stmt::Return(Some(Expr::unary(Op::AddrOf, Expr::ident("a")))),
    );
    ctx.emit_function(&f).unwrap();
    assert!(ctx.check_occupancy().is_ok());
    assert_eq!(ctx.stack_size, 0);
}

/* ==== Moves, pointers and calls ==== */

#[test]
fn store_through_pointer_parameter() {
    let body = Stmt::Expr(Expr::assign(
        Expr::unary(Op::Deref, Expr::ident("p")),
        Expr::ident("v"),
    ));
    let output = compile(vec![func("f", &["p", "v"], body)]);
    assert_eq!(
        output.asm.entries(),
        &[
            def("f"),
            word(Insn::SUB_ST),
            imm(2),
            // MOV [R0+0], R1
            word(Insn {
                y: true,
                x: AddrMode::Rel0,
                b: Reg::R1,
                a: Reg::Imm,
                o: op::mov(Cond::Always),
            }),
            imm(0),
            word(Insn::ADD_ST),
            imm(2),
            word(Insn::RET),
        ]
    );
}

#[test]
fn address_of_a_local_is_a_stack_lea() {
    let body = Stmt::Block(vec![
        Stmt::Declare {
            ident: "x".into(),
            init: Some(Expr::int(3)),
        },
        Stmt::Return(Some(Expr::unary(Op::AddrOf, Expr::ident("x")))),
    ]);
    let output = compile(vec![func("f", &[], body)]);
    assert_eq!(
        output.asm.entries(),
        &[
            def("f"),
            word(Insn::SUB_ST),
            imm(1),
            // MOV [ST+0], 3
            word(Insn {
                y: true,
                x: AddrMode::St,
                b: Reg::Imm,
                a: Reg::St,
                o: op::mov(Cond::Always),
            }),
            imm(0),
            imm(3),
            // LEA R0, [ST+0]
            word(Insn {
                y: true,
                x: AddrMode::St,
                b: Reg::Imm,
                a: Reg::R0,
                o: op::lea(Cond::Always),
            }),
            imm(0),
            word(Insn::ADD_ST),
            imm(1),
            word(Insn::RET),
        ]
    );
}

#[test]
fn calls_spill_evict_and_reload_arguments() {
    let callee = func("g", &["x"], Stmt::Return(Some(Expr::ident("x"))));
    let caller = func(
        "f",
        &["a"],
        Stmt::Return(Some(Expr::call("g", vec![Expr::ident("a")]))),
    );
    let output = compile(vec![caller, callee]);

    let entries = output.asm.entries();
    // The argument register's occupant is written back to its home
    // before the call, reloaded as the argument, then JSR g.
    let jsr = word(Insn {
        y: false,
        x: AddrMode::Imm,
        b: Reg::Imm,
        a: Reg::Pc,
        o: op::JSR,
    });
    let jsr_at = entries.iter().position(|e| *e == jsr).expect("no JSR");
    assert_eq!(entries[jsr_at + 1], abs("g"));

    let spill = word(Insn {
        y: true,
        x: AddrMode::St,
        b: Reg::R0,
        a: Reg::St,
        o: op::mov(Cond::Always),
    });
    let reload = word(Insn {
        y: true,
        x: AddrMode::St,
        b: Reg::St,
        a: Reg::R0,
        o: op::mov(Cond::Always),
    });
    let spill_at = entries.iter().position(|e| *e == spill).expect("no spill");
    let reload_at = entries.iter().position(|e| *e == reload).expect("no reload");
    assert!(spill_at < reload_at && reload_at < jsr_at);

    assert!(output.resolve().is_ok());
}

#[test]
fn multiplication_lowers_to_the_runtime_helper() {
    let helper = func("__px16_mul", &["x", "y"], Stmt::Return(Some(Expr::int(0))));
    let caller = func(
        "f",
        &["a", "b"],
        Stmt::Return(Some(Expr::binary(Op::Mul, Expr::ident("a"), Expr::ident("b")))),
    );
    let output = compile(vec![caller, helper]);
    assert!(output.asm.entries().contains(&abs("__px16_mul")));
    assert!(output.resolve().is_ok());
}

#[test]
fn constant_shifts_unroll_into_repeated_shifts() {
    let output = compile(vec![func(
        "f",
        &["a"],
        Stmt::Return(Some(Expr::binary(
            Op::ShiftL,
            Expr::ident("a"),
            Expr::int(3),
        ))),
    )]);
    let shl = math1_reg(op::SHL, Reg::R0);
    let count = output
        .asm
        .entries()
        .iter()
        .filter(|e| **e == shl)
        .count();
    assert_eq!(count, 3);
}

#[test]
fn logical_and_short_circuits_through_a_label() {
    let output = compile(vec![func(
        "f",
        &["a", "b"],
        Stmt::Return(Some(Expr::binary(
            Op::LogicAnd,
            Expr::ident("a"),
            Expr::ident("b"),
        ))),
    )]);
    // One internal label, bound exactly once, and a resolvable stream.
    assert!(output
        .asm
        .entries()
        .iter()
        .any(|e| matches!(e, Entry::LabelDef(l) if l == ".L0")));
    assert!(output.resolve().is_ok());
}

#[test]
fn string_literals_move_to_the_string_pool() {
    let output = compile(vec![func(
        "f",
        &[],
        Stmt::Return(Some(Expr::Str("Hi".into()))),
    )]);
    let entries = output.asm.entries();
    let pool_at = entries
        .iter()
        .position(|e| matches!(e, Entry::LabelDef(l) if l == ".S0"))
        .expect("no string pool label");
    assert_eq!(
        &entries[pool_at..],
        &[def(".S0"), imm('H' as u16), imm('i' as u16), imm(0)]
    );
    assert!(output.resolve().is_ok());
}

/* ==== Conditions under pressure ==== */

#[test]
fn live_condition_is_materialized_before_the_next_compare() {
    let body = Stmt::Return(Some(Expr::binary(
        Op::Add,
        Expr::binary(Op::Lt, Expr::ident("a"), Expr::ident("b")),
        Expr::binary(Op::Gt, Expr::ident("a"), Expr::ident("b")),
    )));
    let output = compile(vec![func("f", &["a", "b"], body)]);

    // The first comparison's condition must become a 0/1 word before
    // the second CMP clobbers the flags: a conditional MOV with SLT.
    let setcc = output.asm.entries().iter().any(|e| {
        matches!(e, Entry::Word(w) if Insn::unpack(*w).o == op::mov(Cond::Slt))
    });
    assert!(setcc, "no SLT conditional move in the stream");
    assert!(output.resolve().is_ok());
}

#[test]
fn stale_conditions_are_a_fatal_internal_error() {
    let config = CompilerConfig::default();
    let policy = HashedPolicy;
    let mut ctx = GenContext::new(&config, &policy);
    ctx.func = "f".into();

    let cond = ctx.pool.temp(Place::Cond {
        cond: Cond::Eq,
        generation: ctx.cond_generation,
    });
    // Clobber the flags without registering the condition as live.
    ctx.cond_generation += 1;
    assert!(matches!(
        ctx.materialize_part(cond, Reg::R0, 0),
        Err(CodegenError::StaleCondition { .. })
    ));
}

/* ==== Inline assembly operands ==== */

#[test]
fn iasm_operands_render_in_every_expressible_form() {
    let config = CompilerConfig::default();
    let policy = HashedPolicy;
    let mut ctx = GenContext::new(&config, &policy);
    ctx.func = "f".into();

    let any = IasmConstraint {
        allow_const: true,
        allow_reg: true,
        allow_mem: true,
    };
    let c = ctx.pool.temp(Place::Const(0x42));
    assert_eq!(ctx.iasm_operand(c, &any).unwrap(), "0x0042");

    let r = ctx.pool.temp(Place::Reg(Reg::R2));
    assert_eq!(ctx.iasm_operand(r, &any).unwrap(), "R2");

    let l = ctx.pool.temp(Place::Label {
        label: "data".into(),
        addend: 0,
    });
    assert_eq!(ctx.iasm_operand(l, &any).unwrap(), "[data]");

    // A constant under a register-only constraint is loaded first.
    let reg_only = IasmConstraint {
        allow_const: false,
        allow_reg: true,
        allow_mem: false,
    };
    let c = ctx.pool.temp(Place::Const(7));
    let rendered = ctx.iasm_operand(c, &reg_only).unwrap();
    assert!(rendered.starts_with('R'));
    assert!(matches!(ctx.pool.place(c), Place::Reg(_)));
}

#[test]
fn inexpressible_iasm_operands_render_empty_with_a_warning() {
    let config = CompilerConfig::default();
    let policy = HashedPolicy;
    let mut ctx = GenContext::new(&config, &policy);
    ctx.func = "f".into();

    let cond = ctx.pool.temp(Place::Cond {
        cond: Cond::Eq,
        generation: ctx.cond_generation,
    });
    let constraint = IasmConstraint::default();
    assert_eq!(ctx.iasm_operand(cond, &constraint).unwrap(), "");
    assert_eq!(ctx.diagnostics().len(), 1);
}

/* ==== Fuzzing ==== */

fn arb_binop() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Add),
        Just(Op::Sub),
        Just(Op::BitAnd),
        Just(Op::BitOr),
        Just(Op::BitXor),
        Just(Op::Lt),
        Just(Op::Le),
        Just(Op::Gt),
        Just(Op::Ge),
        Just(Op::Eq),
        Just(Op::Ne),
        Just(Op::LogicAnd),
        Just(Op::LogicOr),
    ]
}

fn arb_unop() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::LogicNot),
        Just(Op::BitNot),
        Just(Op::Add),
        Just(Op::Sub),
    ]
}

fn arb_expr() -> impl Strategy<Value = Expr> {
    let leaf = prop_oneof![
        (0..512_i64).prop_map(Expr::int),
        Just(Expr::ident("a")),
        Just(Expr::ident("b")),
    ];
    leaf.prop_recursive(5, 48, 2, |inner| {
        prop_oneof![
            (arb_binop(), inner.clone(), inner.clone())
                .prop_map(|(op, lhs, rhs)| Expr::binary(op, lhs, rhs)),
            (arb_unop(), inner).prop_map(|(op, operand)| Expr::unary(op, operand)),
        ]
    })
}

proptest! {
    #[test]
    fn random_expression_trees_keep_every_invariant(expr in arb_expr()) {
        let config = CompilerConfig::default();
        let policy = FixedPolicy(Reg::R3);
        let mut ctx = GenContext::new(&config, &policy);
        let f = func("fuzz", &["a", "b"], Stmt::Return(Some(expr)));

        ctx.emit_function(&f).expect("internal invariant violated");
        prop_assert!(ctx.check_occupancy().is_ok());
        prop_assert_eq!(ctx.stack_size, 0);
        prop_assert!(!ctx.diagnostics().has_errors());

        let (out, _) = ctx.finish();
        prop_assert!(out.resolve().is_ok());
    }

    #[test]
    fn random_trees_compile_identically_on_repeated_runs(expr in arb_expr()) {
        let f = || {
            let config = CompilerConfig::default();
            let program = Program {
                funcs: vec![func("fuzz", &["a", "b"], Stmt::Return(Some(expr.clone())))],
            };
            compile_program(&program, &config)
                .expect("codegen failed")
                .asm
                .entries()
                .to_vec()
        };
        prop_assert_eq!(f(), f());
    }
}
