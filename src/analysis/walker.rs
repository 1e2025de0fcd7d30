//! Single forward pass over one function.
//!
//! The walker keeps the set of open blocks and the set of labels that have
//! been referenced but not walked yet. When no block is open it skips to the
//! nearest pending label. A backward branch into skipped code pends its
//! target again, and a block that falls into walked code ends there. The
//! function ends when both sets are empty.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::isa::{BranchForm, Instruction, Opcode, Register};

use super::function::{Function, JumpTable};
use super::{AnalysisError, TextWindow, jump_table};

/// Result of walking one function.
pub(crate) struct FunctionScan {
    pub function: Function,
    /// Direct call and tail-call targets to queue as functions.
    pub callees: Vec<u32>,
}

pub(crate) struct FunctionWalker<'t, 'a> {
    text: &'t TextWindow<'a>,
    start: u32,
    cursor: u32,
    end: u32,
    labels: BTreeSet<u32>,
    pending: BTreeSet<u32>,
    open: BTreeSet<u32>,
    current: Option<u32>,
    /// Walked instructions: address to the address after it.
    walked: BTreeMap<u32, u32>,
    jump_tables: Vec<JumpTable>,
    callees: Vec<u32>,
}

impl<'t, 'a> FunctionWalker<'t, 'a> {
    pub fn new(text: &'t TextWindow<'a>, start: u32) -> Self {
        Self {
            text,
            start,
            cursor: start,
            end: start,
            labels: BTreeSet::from([start]),
            pending: BTreeSet::new(),
            open: BTreeSet::new(),
            current: None,
            walked: BTreeMap::new(),
            jump_tables: Vec::new(),
            callees: Vec::new(),
        }
    }

    pub fn walk(mut self) -> Result<FunctionScan, AnalysisError> {
        loop {
            if self.walked.contains_key(&self.cursor) {
                // Fell or jumped into code that is already walked.
                if self.pending.remove(&self.cursor) {
                    self.labels.insert(self.cursor);
                }
                self.close();
            } else if self.text.contains(self.cursor) {
                self.enter(self.cursor);
            }
            if self.current.is_none() {
                match self.pending.first().copied() {
                    Some(next) => {
                        self.cursor = next;
                        continue;
                    }
                    None => break,
                }
            }
            if !self.text.contains(self.cursor) {
                return Err(self.exhausted());
            }

            let ins = self.text.decode(self.cursor)?;
            self.step(&ins)?;
            let next = ins.next();
            // A label that lands inside an instruction can never be reached.
            if let Some(&inside) = self.pending.range(ins.addr + 1..next).next() {
                return Err(AnalysisError::UnresolvedLabel {
                    function: self.start,
                    label: inside,
                });
            }
            self.walked.insert(ins.addr, next);
            self.end = self.end.max(next);
            self.cursor = next;
        }

        trace!(
            function = format_args!("{:#x}", self.start),
            length = self.end - self.start,
            blocks = self.labels.len(),
            tables = self.jump_tables.len(),
            "function walked"
        );
        Ok(FunctionScan {
            function: Function {
                addr: self.start,
                length: self.end - self.start,
                labels: self.labels,
                jump_tables: self.jump_tables,
            },
            callees: self.callees,
        })
    }

    fn exhausted(&self) -> AnalysisError {
        if let Some(&block) = self.open.first() {
            AnalysisError::UnterminatedBlock {
                function: self.start,
                block,
            }
        } else {
            AnalysisError::UnresolvedLabel {
                function: self.start,
                label: self.pending.first().copied().unwrap_or(self.cursor),
            }
        }
    }

    /// Confirm a pending label at `addr` and split the current block there.
    fn enter(&mut self, addr: u32) {
        if self.pending.remove(&addr) {
            self.labels.insert(addr);
        }
        if self.labels.contains(&addr) && self.current != Some(addr) {
            self.close();
            self.open.insert(addr);
            self.current = Some(addr);
        }
    }

    fn close(&mut self) {
        if let Some(block) = self.current.take() {
            self.open.remove(&block);
        }
    }

    /// Record a branch target. Targets that are not walked yet are pending,
    /// behind the branch or ahead of it.
    fn add_label(&mut self, target: u32) -> Result<(), AnalysisError> {
        if self.walked.contains_key(&target) {
            self.labels.insert(target);
            return Ok(());
        }
        if let Some((&addr, &next)) = self.walked.range(..target).next_back() {
            if addr < target && target < next {
                return Err(AnalysisError::UnresolvedLabel {
                    function: self.start,
                    label: target,
                });
            }
        }
        self.pending.insert(target);
        Ok(())
    }

    fn require_in_function(&self, ins: &Instruction, target: u32) -> Result<(), AnalysisError> {
        if target < self.start || !self.text.contains(target) {
            return Err(AnalysisError::BranchOutOfText {
                addr: ins.addr,
                target,
            });
        }
        Ok(())
    }

    fn dword_target(&self, ins: &Instruction) -> Result<u32, AnalysisError> {
        self.text
            .pool
            .branch_target(ins.addr, ins.operand())
            .ok_or(AnalysisError::UnresolvableBranch { addr: ins.addr })
    }

    fn step(&mut self, ins: &Instruction) -> Result<(), AnalysisError> {
        if let Some((form, _)) = ins.opcode.branch() {
            let target = match form {
                BranchForm::Registers => self.dword_target(ins)?,
                _ => ins.short_target(),
            };
            self.require_in_function(ins, target)?;
            self.add_label(target)?;
            self.close();
            self.labels.insert(ins.next());
            return Ok(());
        }

        match ins.opcode {
            Opcode::Jpl => {
                let target = self.dword_target(ins)?;
                if target < self.start {
                    if !self.text.contains(target) {
                        return Err(AnalysisError::BranchOutOfText {
                            addr: ins.addr,
                            target,
                        });
                    }
                    self.callees.push(target);
                } else {
                    self.require_in_function(ins, target)?;
                    self.add_label(target)?;
                }
                self.close();
            }
            Opcode::Calll => {
                let operand = ins.operand();
                if self.text.services.contains(&operand) {
                    return Ok(());
                }
                match self.text.pool.branch_target(ins.addr, operand) {
                    Some(target) => {
                        if !self.text.contains(target) {
                            return Err(AnalysisError::BranchOutOfText {
                                addr: ins.addr,
                                target,
                            });
                        }
                        self.callees.push(target);
                    }
                    None => {
                        if self.text.pool.is_terminate_function(operand) {
                            self.close();
                        }
                    }
                }
            }
            Opcode::Ret => self.close(),
            Opcode::Jpr => {
                if ins.rd()? != Register::Ra {
                    if let Some(table) = jump_table::recognize(self.text, self.start, ins)? {
                        for &label in &table.labels {
                            self.add_label(label)?;
                        }
                        self.jump_tables.push(table);
                    }
                }
                self.close();
            }
            _ => {}
        }
        Ok(())
    }
}
