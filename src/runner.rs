//! Driving whole compilation units through the generator.
//!
//! The host frontend hands a [`Program`](crate::ast::Program) and a
//! [`CompilerConfig`] to [`compile_program`] and receives the output
//! stream plus the collected diagnostics. Functions whose generation ran
//! into source errors are dropped from the stream; the rest of the unit
//! still compiles.
//!
//! # Example
//!
//! ```
//! # use px16_codegen::ast::{Expr, FuncDef, Program, Stmt};
//! # use px16_codegen::runner::{compile_program, CompilerConfigBuilder, OutputType};
//! let program = Program {
//!     funcs: vec![FuncDef {
//!         ident: "nop".into(),
//!         params: vec![],
//!         body: Stmt::Block(vec![]),
//!     }],
//! };
//!
//! let config = CompilerConfigBuilder::default()
//!     .output_type(OutputType::Executable)
//!     .build()
//!     .expect("This is always infallible");
//!
//! let output = compile_program(&program, &config).expect("codegen failed");
//! assert!(output.diagnostics.is_empty());
//! assert_eq!(output.resolve().unwrap().len(), 1);
//! ```

use derive_builder::Builder;
use log::debug;

use crate::ast::Program;
use crate::codegen::{EvictionPolicy, GenContext, HashedPolicy};
use crate::diag::{CodegenError, Diagnostics};
use crate::isa::{ADDR_BYTES, NUM_REGS, WORD_BYTES};
use crate::output::{AsmOut, ResolveError};

/// Architecture facts the generator and the host agree on.
///
/// The defaults describe the Pixie-16; the builder exists so tests and
/// tooling can explore variations without recompiling.
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct TargetConfig {
    /// Size of a machine word in bytes.
    #[builder(default = "WORD_BYTES")]
    pub word_bytes: usize,
    /// Size of an address in bytes.
    #[builder(default = "ADDR_BYTES")]
    pub addr_bytes: usize,
    /// Number of allocatable registers.
    #[builder(default = "NUM_REGS")]
    pub num_regs: usize,
    /// Byte order of emitted images.
    #[builder(default = "true")]
    pub little_endian: bool,
    /// Whether plain `char` is signed.
    #[builder(default = "true")]
    pub char_signed: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            word_bytes: WORD_BYTES,
            addr_bytes: ADDR_BYTES,
            num_regs: NUM_REGS,
            little_endian: true,
            char_signed: true,
        }
    }
}

/// What kind of artifact the unit is compiled into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    Executable,
    Shared,
    Raw,
}

impl Default for OutputType {
    fn default() -> Self {
        OutputType::Executable
    }
}

impl OutputType {
    /// Derive the output type from an output file name: `.so` and `.o`
    /// are shared objects, `.bin` is a raw image, everything else an
    /// executable.
    pub fn from_path(path: &str) -> Self {
        if path.ends_with(".so") || path.ends_with(".o") {
            OutputType::Shared
        } else if path.ends_with(".bin") {
            OutputType::Raw
        } else {
            OutputType::Executable
        }
    }
}

/// Configuration of one compilation unit.
#[derive(Debug, Clone, PartialEq, Builder)]
pub struct CompilerConfig {
    #[builder(default)]
    pub target: TargetConfig,
    #[builder(default)]
    pub output_type: OutputType,
    /// Force position independent code on or off. Left unset, shared
    /// output implies PIE.
    #[builder(default, setter(strip_option))]
    pub force_pie: Option<bool>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            target: TargetConfig::default(),
            output_type: OutputType::default(),
            force_pie: None,
        }
    }
}

impl CompilerConfig {
    /// Is position independent code requested?
    pub fn pie(&self) -> bool {
        self.force_pie
            .unwrap_or(self.output_type == OutputType::Shared)
    }
}

/// The result of compiling one unit.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// The emitted stream.
    pub asm: AsmOut,
    /// Everything the generator had to say about the source.
    pub diagnostics: Diagnostics,
}

impl CompileOutput {
    /// Resolve the stream into a flat word image.
    pub fn resolve(&self) -> Result<Vec<u16>, ResolveError> {
        self.asm.resolve()
    }
}

/// Compile a whole program with the default eviction policy.
pub fn compile_program(
    program: &Program,
    config: &CompilerConfig,
) -> Result<CompileOutput, CodegenError> {
    compile_program_with_policy(program, config, &HashedPolicy)
}

/// Compile a whole program with an explicit eviction policy.
pub fn compile_program_with_policy(
    program: &Program,
    config: &CompilerConfig,
    policy: &dyn EvictionPolicy,
) -> Result<CompileOutput, CodegenError> {
    let mut ctx = GenContext::new(config, policy);
    for func in &program.funcs {
        let checkpoint = ctx.out.checkpoint();
        let errors_before = ctx.diagnostics().error_count();
        ctx.emit_function(func)?;
        if ctx.diagnostics().error_count() > errors_before {
            debug!("// dropping {} after source errors", func.ident);
            ctx.out.rollback(checkpoint);
        }
    }
    let (asm, diagnostics) = ctx.finish();
    Ok(CompileOutput { asm, diagnostics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, FuncDef, Stmt};

    fn func(ident: &str, params: &[&str], body: Stmt) -> FuncDef {
        FuncDef {
            ident: ident.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            body,
        }
    }

    #[test]
    fn output_type_detection_follows_the_extension() {
        assert_eq!(OutputType::from_path("libfoo.so"), OutputType::Shared);
        assert_eq!(OutputType::from_path("foo.o"), OutputType::Shared);
        assert_eq!(OutputType::from_path("image.bin"), OutputType::Raw);
        assert_eq!(OutputType::from_path("a.out"), OutputType::Executable);
        assert_eq!(OutputType::from_path("prog"), OutputType::Executable);
    }

    #[test]
    fn shared_output_implies_pie() {
        let shared = CompilerConfigBuilder::default()
            .output_type(OutputType::Shared)
            .build()
            .unwrap();
        assert!(shared.pie());

        let executable = CompilerConfig::default();
        assert!(!executable.pie());

        let forced = CompilerConfigBuilder::default()
            .output_type(OutputType::Shared)
            .force_pie(false)
            .build()
            .unwrap();
        assert!(!forced.pie());
    }

    #[test]
    fn erroneous_functions_are_dropped_from_the_stream() {
        let program = Program {
            funcs: vec![
                func(
                    "bad",
                    &[],
                    Stmt::Return(Some(Expr::ident("no_such_thing"))),
                ),
                func("good", &[], Stmt::Return(Some(Expr::int(1)))),
            ],
        };
        let output = compile_program(&program, &CompilerConfig::default()).unwrap();
        assert!(output.diagnostics.has_errors());
        let image = output.resolve().unwrap();
        // Only `good` survives: MOV R0, 1 and the return.
        assert_eq!(image.len(), 3);
    }

    #[test]
    fn target_defaults_describe_the_pixie_16() {
        let target = TargetConfigBuilder::default().build().unwrap();
        assert_eq!(target, TargetConfig::default());
        assert_eq!(target.word_bytes, 2);
        assert_eq!(target.num_regs, 4);
    }
}
