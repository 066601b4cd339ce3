//! The assembly sink.
//!
//! Code generation appends into an [`AsmOut`]: literal machine words,
//! placeholder words referencing labels, and label definitions. The sink
//! makes no layout decisions, it only records the stream in program
//! order. A post-processor (or [`AsmOut::resolve`] for tests and simple
//! images) later assigns addresses and patches the references.
//!
//! # Example
//!
//! ```
//! # use px16_codegen::output::{AsmOut, RefKind};
//! let mut out = AsmOut::new();
//! let target = out.fresh_label();
//!
//! out.emit_word(0x1234);
//! out.emit_label_ref(&target, 0, RefKind::AbsPtr);
//! out.bind_label(&target);
//!
//! assert_eq!(out.resolve().unwrap(), vec![0x1234, 0x0002]);
//! ```

use colored::Colorize;
use log::trace;
use thiserror::Error;

use std::collections::HashMap;
use std::fmt;

use crate::isa::Insn;

/// A symbolic label.
pub type Label = String;

/// How a label reference is turned into a word once the label is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    /// The absolute address of the label, plus the addend.
    AbsPtr,
    /// The displacement from the word after the reference to the label,
    /// plus the addend.
    OffsPtr,
}

/// A single entry of the output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// A literal machine word.
    Word(u16),
    /// A placeholder word whose value depends on label resolution.
    LabelRef {
        label: Label,
        addend: i32,
        kind: RefKind,
    },
    /// Marks the current stream position as the definition of `label`.
    LabelDef(Label),
}

/// Errors surfaced while resolving a stream into a flat image.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("label `{0}` is referenced but never bound")]
    Unbound(Label),
    #[error("label `{0}` is bound more than once")]
    DoublyBound(Label),
}

/// The append only output stream of one compilation unit.
#[derive(Debug, Clone, Default)]
pub struct AsmOut {
    entries: Vec<Entry>,
    next_label: u32,
}

impl AsmOut {
    /// Create an empty stream.
    pub fn new() -> Self {
        AsmOut::default()
    }

    /// Append a literal machine word.
    pub fn emit_word(&mut self, word: u16) {
        self.entries.push(Entry::Word(word));
    }

    /// Append a packed instruction word.
    pub fn emit_insn(&mut self, insn: Insn) {
        self.emit_word(insn.pack());
    }

    /// Append a placeholder word referencing `label`.
    pub fn emit_label_ref(&mut self, label: &str, addend: i32, kind: RefKind) {
        self.entries.push(Entry::LabelRef {
            label: label.to_string(),
            addend,
            kind,
        });
    }

    /// Allocate a unique label name.
    pub fn fresh_label(&mut self) -> Label {
        let label = format!(".L{}", self.next_label);
        self.next_label += 1;
        label
    }

    /// Record that `label` refers to the current append position.
    pub fn bind_label(&mut self, label: &str) {
        trace!("{}:", label);
        self.entries.push(Entry::LabelDef(label.to_string()));
    }

    /// All entries appended so far, in program order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Number of words the stream occupies once resolved.
    pub fn len_words(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !matches!(e, Entry::LabelDef(_)))
            .count()
    }

    /// Current append position, usable with [`AsmOut::rollback`].
    pub fn checkpoint(&self) -> usize {
        self.entries.len()
    }

    /// Drop every entry appended after `checkpoint`.
    ///
    /// Used to discard the output of a function whose generation ran into
    /// source errors. Labels bound after the checkpoint disappear with
    /// their references, so the stream stays resolvable.
    pub fn rollback(&mut self, checkpoint: usize) {
        self.entries.truncate(checkpoint);
    }

    /// Resolve the stream into a flat word image.
    ///
    /// Walks the stream twice: once to assign a word address to every
    /// label definition, once to patch the references.
    pub fn resolve(&self) -> Result<Vec<u16>, ResolveError> {
        let mut labels: HashMap<&str, i32> = HashMap::new();
        let mut addr = 0_i32;
        for entry in &self.entries {
            match entry {
                Entry::Word(_) | Entry::LabelRef { .. } => addr += 1,
                Entry::LabelDef(label) => {
                    if labels.insert(label, addr).is_some() {
                        return Err(ResolveError::DoublyBound(label.clone()));
                    }
                }
            }
        }

        let mut image = Vec::with_capacity(addr as usize);
        for entry in &self.entries {
            match entry {
                Entry::Word(word) => image.push(*word),
                Entry::LabelRef {
                    label,
                    addend,
                    kind,
                } => {
                    let target = *labels
                        .get(label.as_str())
                        .ok_or_else(|| ResolveError::Unbound(label.clone()))?;
                    let here = image.len() as i32;
                    let value = match kind {
                        RefKind::AbsPtr => target + addend,
                        // PC has advanced past the reference word.
                        RefKind::OffsPtr => target + addend - (here + 1),
                    };
                    image.push(value as u16);
                }
                Entry::LabelDef(_) => {}
            }
        }
        Ok(image)
    }

    /// The resolved image as bytes, for writing a raw binary.
    pub fn to_bytes(&self, little_endian: bool) -> Result<Vec<u8>, ResolveError> {
        let words = self.resolve()?;
        let mut bytes = Vec::with_capacity(words.len() * 2);
        for word in words {
            if little_endian {
                bytes.extend_from_slice(&word.to_le_bytes());
            } else {
                bytes.extend_from_slice(&word.to_be_bytes());
            }
        }
        Ok(bytes)
    }
}

impl fmt::Display for AsmOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut addr = 0_usize;
        for entry in &self.entries {
            match entry {
                Entry::Word(word) => {
                    writeln!(f, "  {:04x}  {:04x}", addr, word)?;
                    addr += 1;
                }
                Entry::LabelRef {
                    label,
                    addend,
                    kind,
                } => {
                    let what = match kind {
                        RefKind::AbsPtr => format!("-> {}{:+}", label, addend),
                        RefKind::OffsPtr => format!("~> {}{:+}", label, addend),
                    };
                    writeln!(f, "  {:04x}  .... {}", addr, what.dimmed())?;
                    addr += 1;
                }
                Entry::LabelDef(label) => writeln!(f, "{}:", label)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_labels_are_unique() {
        let mut out = AsmOut::new();
        let a = out.fresh_label();
        let b = out.fresh_label();
        assert_ne!(a, b);
    }

    #[test]
    fn absolute_references_resolve_to_the_bound_address() {
        let mut out = AsmOut::new();
        let label = out.fresh_label();
        out.emit_word(0xffff);
        out.emit_label_ref(&label, 0, RefKind::AbsPtr);
        out.emit_word(0xffff);
        out.bind_label(&label);
        out.emit_word(0xaaaa);
        assert_eq!(out.resolve().unwrap(), vec![0xffff, 3, 0xffff, 0xaaaa]);
    }

    #[test]
    fn relative_references_count_from_past_the_reference() {
        let mut out = AsmOut::new();
        let label = out.fresh_label();
        out.bind_label(&label);
        out.emit_word(0);
        out.emit_label_ref(&label, 0, RefKind::OffsPtr);
        // The target is two words behind the post-reference PC.
        assert_eq!(out.resolve().unwrap(), vec![0, -2_i32 as u16]);
    }

    #[test]
    fn addends_shift_the_resolved_value() {
        let mut out = AsmOut::new();
        let label = out.fresh_label();
        out.emit_label_ref(&label, 2, RefKind::AbsPtr);
        out.bind_label(&label);
        assert_eq!(out.resolve().unwrap(), vec![3]);
    }

    #[test]
    fn unbound_labels_are_an_error() {
        let mut out = AsmOut::new();
        out.emit_label_ref("nowhere", 0, RefKind::AbsPtr);
        assert_eq!(
            out.resolve(),
            Err(ResolveError::Unbound("nowhere".to_string()))
        );
    }

    #[test]
    fn double_binding_is_an_error() {
        let mut out = AsmOut::new();
        out.bind_label("twice");
        out.emit_word(0);
        out.bind_label("twice");
        assert_eq!(
            out.resolve(),
            Err(ResolveError::DoublyBound("twice".to_string()))
        );
    }

    #[test]
    fn rollback_discards_entries_and_bindings() {
        let mut out = AsmOut::new();
        out.emit_word(1);
        let mark = out.checkpoint();
        out.bind_label("gone");
        out.emit_word(2);
        out.rollback(mark);
        assert_eq!(out.entries().len(), 1);
        assert_eq!(out.resolve().unwrap(), vec![1]);
    }
}
