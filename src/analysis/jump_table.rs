//! Jump-table recognition.
//!
//! Two compiler idioms end in `JPr rX` through a table of absolute case
//! addresses:
//!
//! ```text
//! direct:  [ANDi rI, rS, mask]  SLLi rT, rI, 2                   LDWd rX, rT, base  JPr rX
//! based:   [ANDi rI, rS, mask]  SLLi rT, rI, 2  ADD rT, rT, rB   LDWd rX, rT, off   JPr rX
//! ```
//!
//! The case count comes from the bounds check on the index register that
//! guards the idiom. This is a heuristic tuned to observed compiler output.

use crate::isa::{BranchForm, Condition, Instruction, Opcode, Register, read_word};

use super::function::JumpTable;
use super::{AnalysisError, TextWindow};

/// How far back to look for a bounds check that branches into the idiom.
const COUNT_SCAN_WORDS: u32 = 50;

/// Upper bound on recovered case counts.
const MAX_CASES: u32 = 4096;

/// Try to recover the table dispatched by `jump`.
///
/// Returns `Ok(None)` when the code does not match an idiom. A matched based
/// idiom whose base register load cannot be found is an error.
pub(crate) fn recognize(
    text: &TextWindow<'_>,
    function_start: u32,
    jump: &Instruction,
) -> Result<Option<JumpTable>, AnalysisError> {
    let target_reg = jump.rd()?;
    let peek = |addr: Option<u32>| {
        addr.filter(|&a| a >= function_start)
            .and_then(|a| text.peek(a))
    };

    let Some(load) = peek(jump.addr.checked_sub(8)) else {
        return Ok(None);
    };
    if load.opcode != Opcode::Ldwd || load.byte1() != target_reg.id() {
        return Ok(None);
    }
    let slot_reg = load.byte2();

    let (shift_addr, base_reg) = match peek(load.addr.checked_sub(4)) {
        Some(add) if add.opcode == Opcode::Add && add.byte1() == slot_reg => {
            if add.byte2() == slot_reg {
                (add.addr.checked_sub(4), Some(add.byte3()))
            } else if add.byte3() == slot_reg {
                (add.addr.checked_sub(4), Some(add.byte2()))
            } else {
                return Ok(None);
            }
        }
        _ => (load.addr.checked_sub(4), None),
    };

    let Some(shift) = peek(shift_addr) else {
        return Ok(None);
    };
    if shift.opcode != Opcode::Slli || shift.byte1() != slot_reg || shift.byte3() != 2 {
        return Ok(None);
    }

    let mut start = shift.addr;
    let mut index_reg = shift.byte2();
    if let Some(mask) = peek(shift.addr.checked_sub(8)) {
        if mask.opcode == Opcode::Andi && mask.byte1() == index_reg {
            start = mask.addr;
            index_reg = mask.byte2();
        }
    }

    let offset = text.pool.read_immediate(load.operand());
    let base = match base_reg {
        None => match offset {
            Some(base) => base,
            None => return Ok(None),
        },
        Some(base_reg) => {
            let not_found = AnalysisError::JumpTableBaseNotFound { addr: jump.addr };
            let offset = offset.ok_or(not_found.clone())?;
            let search_from = load.addr - 4;
            let value = find_base_load(text, function_start, search_from, base_reg).ok_or(not_found)?;
            value.wrapping_add(offset)
        }
    };

    let Some(count) = case_count(text, function_start, start, index_reg) else {
        return Ok(None);
    };

    let mut labels = Vec::with_capacity(count as usize);
    for slot in 0..count {
        let Some(target) = base
            .checked_add(slot * 4)
            .and_then(|addr| read_word(text.bytes, addr))
        else {
            return Ok(None);
        };
        if target < function_start || !text.contains(target) || target & 3 != 0 {
            return Ok(None);
        }
        labels.push(target);
    }

    let Some(index_reg) = Register::from_id(slot_reg) else {
        return Ok(None);
    };
    Ok(Some(JumpTable {
        jump_addr: jump.addr,
        load_addr: load.addr,
        index_reg,
        base,
        labels,
    }))
}

/// Walk back word by word to the nearest `LDI` of `reg`.
fn find_base_load(text: &TextWindow<'_>, function_start: u32, from: u32, reg: u8) -> Option<u32> {
    let mut addr = from;
    while addr >= function_start.saturating_add(4) {
        addr -= 4;
        if let Some(ins) = text.peek(addr) {
            if ins.opcode == Opcode::Ldi && ins.byte1() == reg {
                return text.pool.read_immediate(ins.operand());
            }
        }
    }
    None
}

/// Compare-immediate branch on `index_reg`, with its constant.
fn bounds_check(ins: &Instruction, index_reg: u8) -> Option<(Condition, i32)> {
    let (form, cond) = ins.opcode.branch()?;
    if ins.byte1() != index_reg {
        return None;
    }
    let bound = match form {
        BranchForm::Registers => return None,
        BranchForm::Immediate => ins.imm8_rs() as i32,
        BranchForm::ByteImmediate if cond.is_unsigned() => ins.byte2() as i32,
        BranchForm::ByteImmediate => ins.imm8_rs() as i32,
    };
    Some((cond, bound))
}

/// Count implied by a branch that enters the idiom at `start` when in range.
fn entering_count(ins: &Instruction, index_reg: u8, start: u32) -> Option<i32> {
    let (cond, bound) = bounds_check(ins, index_reg)?;
    if ins.short_target() != start {
        return None;
    }
    match cond {
        Condition::Le | Condition::Leu => Some(bound + 1),
        Condition::Lt | Condition::Ltu => Some(bound),
        _ => None,
    }
}

fn case_count(text: &TextWindow<'_>, function_start: u32, start: u32, index_reg: u8) -> Option<u32> {
    let valid = |count: i32| (count > 0 && count as u32 <= MAX_CASES).then_some(count as u32);

    let previous = start
        .checked_sub(4)
        .filter(|&a| a >= function_start)
        .and_then(|a| text.peek(a));
    if let Some(prev) = previous {
        if let Some((cond, bound)) = bounds_check(&prev, index_reg) {
            let count = match cond {
                Condition::Gt | Condition::Gtu => Some(bound + 1),
                Condition::Ge | Condition::Geu => Some(bound),
                _ => entering_count(&prev, index_reg, start),
            };
            if let Some(count) = count {
                return valid(count);
            }
        }
    }

    for words in 1..=COUNT_SCAN_WORDS {
        let Some(addr) = start.checked_sub(words * 4) else {
            break;
        };
        if addr < function_start {
            break;
        }
        if let Some(count) = text.peek(addr).and_then(|ins| entering_count(&ins, index_reg, start)) {
            return valid(count);
        }
    }
    None
}
