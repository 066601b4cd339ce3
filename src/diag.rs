//! Diagnostic messages and internal error types.
//!
//! User facing problems (unknown identifiers, bad lvalues, unsupported
//! constructs) collect as [`Diagnostic`]s in a [`Diagnostics`] queue and
//! never abort the compilation unit. Internal invariant violations are
//! [`CodegenError`]s; they propagate immediately and kill the unit.

use colored::Colorize;
use pad::PadStr;
use thiserror::Error;

use std::fmt;

use crate::isa::Reg;

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Hint,
    Info,
    Warn,
    Err,
}

/// A position in a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    /// Zero indexed line.
    pub line: u32,
    /// Zero indexed column.
    pub col: u32,
}

/// A single diagnostic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Where the message points, if anywhere.
    pub pos: Option<Pos>,
    /// Message severity.
    pub lvl: Severity,
    /// Human readable message.
    pub msg: String,
}

/// The diagnostic queue of one compilation unit.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    list: Vec<Diagnostic>,
}

/// Fatal internal errors of the generator.
///
/// Every variant signals a broken invariant inside the code generator
/// itself, never a problem with the compiled source.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodegenError {
    #[error("no free register and vacating was not permitted")]
    NoFreeRegister,
    #[error("condition consumed after the flags were clobbered (set at generation {set}, now at {now})")]
    StaleCondition { set: u64, now: u64 },
    #[error("register {0} is occupied by a descriptor that does not live in it")]
    OccupancyMismatch(Reg),
}

impl Severity {
    fn name(self) -> &'static str {
        match self {
            Severity::Hint => "hint",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Err => "err",
        }
    }
}

impl Diagnostics {
    /// Create an empty queue.
    pub fn new() -> Self {
        Diagnostics::default()
    }

    /// Append a message.
    pub fn report(&mut self, pos: Option<Pos>, lvl: Severity, msg: impl Into<String>) {
        self.list.push(Diagnostic {
            pos,
            lvl,
            msg: msg.into(),
        });
    }

    /// Number of messages with severity [`Severity::Err`].
    pub fn error_count(&self) -> usize {
        self.list.iter().filter(|d| d.lvl == Severity::Err).count()
    }

    /// Were any errors reported?
    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    /// Iterate over all collected messages.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = self.name().pad_to_width(4);
        let colored = match self {
            Severity::Hint => name.dimmed(),
            Severity::Info => name.normal(),
            Severity::Warn => name.yellow(),
            Severity::Err => name.red().bold(),
        };
        write!(f, "{}", colored)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.pos {
            Some(pos) => write!(f, "{} {}:{}: {}", self.lvl, pos.line, pos.col, self.msg),
            None => write!(f, "{} {}", self.lvl, self.msg),
        }
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for diag in &self.list {
            writeln!(f, "{}", diag)?;
        }
        Ok(())
    }
}
