//! Control-flow recovery.
//!
//! Discovers functions from the entry point, the constant pool and direct
//! calls, then walks each function once to find its blocks and jump tables.

mod function;
mod jump_table;
mod walker;

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;
use tracing::debug;

use crate::isa::{DecodeError, Instruction, PoolItemKind, PoolItems, read_word};

pub use function::{Function, JumpTable};
use walker::FunctionWalker;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("entry point {addr:#010x} is outside the text segment")]
    EntryOutOfText { addr: u32 },
    #[error("function {function:#010x}: block {block:#010x} runs off the end of the text segment")]
    UnterminatedBlock { function: u32, block: u32 },
    #[error("function {function:#010x}: label {label:#010x} is never reached")]
    UnresolvedLabel { function: u32, label: u32 },
    #[error("branch at {addr:#010x} has an unresolvable target")]
    UnresolvableBranch { addr: u32 },
    #[error("branch at {addr:#010x} targets {target:#010x} outside its function or the text segment")]
    BranchOutOfText { addr: u32, target: u32 },
    #[error("jump table at {addr:#010x}: base register load not found")]
    JumpTableBaseNotFound { addr: u32 },
}

/// The text segment plus what analysis needs to resolve operands.
pub(crate) struct TextWindow<'a> {
    pub bytes: &'a [u8],
    pub start: u32,
    pub end: u32,
    pub pool: &'a PoolItems,
    /// Pool indices that `CALLl` uses to reach VM services.
    pub services: &'a BTreeSet<u32>,
}

impl TextWindow<'_> {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn decode(&self, addr: u32) -> Result<Instruction, DecodeError> {
        Instruction::decode(self.bytes, addr)
    }

    /// Decode without failing; used by the backward-looking heuristics.
    pub fn peek(&self, addr: u32) -> Option<Instruction> {
        if !self.contains(addr) {
            return None;
        }
        self.decode(addr).ok()
    }
}

/// Function discovery over a loaded image.
pub struct ProgramAnalysis<'a> {
    text: TextWindow<'a>,
}

impl<'a> ProgramAnalysis<'a> {
    /// `image` is the whole guest memory; the text segment is
    /// `[text_base, text_base + text_size)`, clipped to the image.
    pub fn new(
        image: &'a [u8],
        text_base: u32,
        text_size: u32,
        pool: &'a PoolItems,
        services: &'a BTreeSet<u32>,
    ) -> Self {
        let image_end = u32::try_from(image.len()).unwrap_or(u32::MAX);
        let end = text_base.saturating_add(text_size).min(image_end);
        Self {
            text: TextWindow {
                bytes: image,
                start: text_base,
                end,
                pool,
                services,
            },
        }
    }

    pub fn text_start(&self) -> u32 {
        self.text.start
    }

    pub fn text_end(&self) -> u32 {
        self.text.end
    }

    /// Discover every reachable function, ordered by address.
    pub fn analyze(&self, entry_offset: u32) -> Result<Vec<Function>, AnalysisError> {
        let entry = self
            .text
            .start
            .checked_add(entry_offset)
            .filter(|&addr| self.text.contains(addr))
            .ok_or(AnalysisError::EntryOutOfText {
                addr: self.text.start.wrapping_add(entry_offset),
            })?;

        let mut discovery = Discovery::default();
        discovery.enqueue(entry);

        let pool = self.text.pool;
        for index in pool.indices() {
            match pool.classify(index) {
                Some(PoolItemKind::InText) => {
                    let addr = pool.get_constant(index);
                    if self.text.contains(addr) {
                        discovery.enqueue(addr);
                    }
                }
                Some(PoolItemKind::FunctionTableList) => {
                    for addr in self.function_table(pool.get_constant(index)) {
                        if self.text.contains(addr) {
                            discovery.enqueue(addr);
                        }
                    }
                }
                _ => {}
            }
        }
        self.drain(&mut discovery)?;

        for index in pool.indices() {
            if pool.classify(index) != Some(PoolItemKind::FunctionInTable) {
                continue;
            }
            let addr = pool.get_constant(index);
            if !self.text.contains(addr) || discovery.absorbed(addr) {
                continue;
            }
            discovery.enqueue(addr);
            self.drain(&mut discovery)?;
        }

        debug!(
            functions = discovery.functions.len(),
            jump_tables = discovery.table_ranges.len(),
            "analysis complete"
        );
        Ok(discovery.functions.into_values().collect())
    }

    /// Entries of a zero-terminated function-pointer array.
    fn function_table(&self, addr: u32) -> Vec<u32> {
        let mut entries = Vec::new();
        let mut slot = addr;
        while let Some(entry) = read_word(self.text.bytes, slot) {
            if entry == 0 {
                break;
            }
            entries.push(entry);
            match slot.checked_add(4) {
                Some(next) => slot = next,
                None => break,
            }
        }
        entries
    }

    fn drain(&self, discovery: &mut Discovery) -> Result<(), AnalysisError> {
        while let Some(addr) = discovery.queue.pop_front() {
            let scan = FunctionWalker::new(&self.text, addr).walk()?;
            for table in &scan.function.jump_tables {
                discovery.case_labels.extend(table.labels.iter().copied());
                discovery.table_ranges.push(table.slot_range());
            }
            for callee in scan.callees {
                discovery.enqueue(callee);
            }
            discovery.functions.insert(addr, scan.function);
        }
        Ok(())
    }
}

#[derive(Default)]
struct Discovery {
    discovered: BTreeSet<u32>,
    queue: VecDeque<u32>,
    functions: BTreeMap<u32, Function>,
    case_labels: BTreeSet<u32>,
    table_ranges: Vec<std::ops::Range<u32>>,
}

impl Discovery {
    fn enqueue(&mut self, addr: u32) {
        if self.discovered.insert(addr) {
            self.queue.push_back(addr);
        }
    }

    /// Already a function, a case label, or table data.
    fn absorbed(&self, addr: u32) -> bool {
        self.discovered.contains(&addr)
            || self.case_labels.contains(&addr)
            || self.table_ranges.iter().any(|range| range.contains(&addr))
    }
}
