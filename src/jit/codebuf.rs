//! Code buffer for building native code.
//!
//! Labels are typed handles allocated up front and bound once. References to
//! labels are patched when the buffer is finished, so forward and backward
//! references look the same to callers.

use thiserror::Error;

use super::memory::{ExecutableMemory, MemoryError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeBufferError {
    #[error("label {0} referenced but never bound")]
    UnboundLabel(usize),
    #[error("label {0} bound twice")]
    Rebound(usize),
    #[error("relative offset to label {0} does not fit in 32 bits")]
    OutOfRange(usize),
}

/// A position in the code buffer, bound at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// How a label reference is encoded.
#[derive(Debug, Clone, Copy)]
pub enum ReferenceSize {
    /// 32-bit offset relative to the end of the reference.
    Rel32,
    /// 32-bit offset of the target relative to another label (jump tables).
    TableEntry(Label),
}

#[derive(Debug, Clone, Copy)]
struct LabelRef {
    offset: usize,
    label: Label,
    size: ReferenceSize,
}

/// Unconditional `jmp rel32` most recently emitted, for jump-to-next elision.
#[derive(Debug, Clone, Copy)]
struct TrailingJump {
    start: usize,
    reference: usize,
    label: Label,
}

const JMP_REL32_LEN: usize = 5;

/// A buffer for building machine code.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    refs: Vec<LabelRef>,
    trailing_jump: Option<TrailingJump>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Allocate an unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current position.
    ///
    /// If the last thing emitted is a `jmp` to this very label, the jump is
    /// dropped.
    pub fn bind(&mut self, label: Label) -> Result<(), CodeBufferError> {
        if self.labels[label.0].is_some() {
            return Err(CodeBufferError::Rebound(label.0));
        }
        if let Some(jump) = self.trailing_jump {
            if jump.label == label && jump.start + JMP_REL32_LEN == self.code.len() {
                self.trailing_jump = None;
                let end = self.code.len();
                self.code.truncate(jump.start);
                self.refs.remove(jump.reference);
                for bound in self.labels.iter_mut().flatten() {
                    if *bound == end {
                        *bound = jump.start;
                    }
                }
            }
        }
        self.labels[label.0] = Some(self.code.len());
        Ok(())
    }

    /// Offset of a bound label.
    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0).copied().flatten()
    }

    /// Emit a 4-byte placeholder that is patched to reference `label`.
    pub fn emit_label_ref(&mut self, label: Label, size: ReferenceSize) {
        let offset = self.code.len();
        self.refs.push(LabelRef {
            offset,
            label,
            size,
        });
        self.emit_u32(0);
    }

    /// Record that the bytes just emitted are `jmp rel32 label`.
    pub(crate) fn note_jump(&mut self, label: Label) {
        if self.code.len() < JMP_REL32_LEN || self.refs.is_empty() {
            return;
        }
        self.trailing_jump = Some(TrailingJump {
            start: self.code.len() - JMP_REL32_LEN,
            reference: self.refs.len() - 1,
            label,
        });
    }

    fn resolve(&self, label: Label) -> Result<usize, CodeBufferError> {
        self.label_offset(label)
            .ok_or(CodeBufferError::UnboundLabel(label.0))
    }

    /// Patch every label reference.
    pub fn patch_label_refs(&mut self) -> Result<(), CodeBufferError> {
        for r in std::mem::take(&mut self.refs) {
            let target = self.resolve(r.label)? as i64;
            let origin = match r.size {
                ReferenceSize::Rel32 => r.offset as i64 + 4,
                ReferenceSize::TableEntry(base) => self.resolve(base)? as i64,
            };
            let rel = i32::try_from(target - origin).map_err(|_| CodeBufferError::OutOfRange(r.label.0))?;
            self.code[r.offset..r.offset + 4].copy_from_slice(&rel.to_le_bytes());
        }
        self.trailing_jump = None;
        Ok(())
    }

    /// Patch references and return the finished bytes.
    pub fn finish(mut self) -> Result<Vec<u8>, CodeBufferError> {
        self.patch_label_refs()?;
        Ok(self.code)
    }

    /// Patch references and copy into executable memory.
    pub fn finalize(self) -> Result<ExecutableMemory, MemoryError> {
        let code = self.finish().map_err(|_| MemoryError::InvalidSize)?;
        ExecutableMemory::from_code(&code)
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Pad with `int3` up to `alignment`.
    pub fn align(&mut self, alignment: usize) {
        let current = self.code.len();
        let aligned = (current + alignment - 1) & !(alignment - 1);
        self.code.resize(aligned, 0xCC);
        self.trailing_jump = None;
    }
}
