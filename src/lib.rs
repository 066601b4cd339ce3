// XXX: proptest causes issues with clippy
#![allow(clippy::unit_arg)]
//! Code generation core for a C compiler targeting the Pixie-16.
//!
//! The crate turns a semantically analyzed [`ast::Program`] into a
//! stream of packed 16-bit machine words and symbolic label references,
//! ready for a post-processor to resolve into a binary image.
//!
//! # Example
//!
//! ```
//! # use px16_codegen::ast::{Expr, FuncDef, Op, Program, Stmt};
//! # use px16_codegen::runner::{compile_program, CompilerConfig};
//! // func add(a, b) { return a + b; }
//! let program = Program {
//!     funcs: vec![FuncDef {
//!         ident: "add".into(),
//!         params: vec!["a".into(), "b".into()],
//!         body: Stmt::Return(Some(Expr::binary(
//!             Op::Add,
//!             Expr::ident("a"),
//!             Expr::ident("b"),
//!         ))),
//!     }],
//! };
//!
//! let output = compile_program(&program, &CompilerConfig::default())
//!     .expect("codegen failed");
//! assert!(output.diagnostics.is_empty());
//!
//! let image = output.resolve().expect("all labels bound");
//! assert!(!image.is_empty());
//! ```

pub mod ast;
pub mod codegen;
pub mod diag;
pub mod isa;
pub mod output;
pub mod runner;
