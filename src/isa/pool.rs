//! Constant pool items.
//!
//! The pool is a 1-based array of tagged 64-bit entries. Bit 63 separates
//! constant-like items from imports; bits 60 to 62 mark constants that point
//! into the text segment or at function tables.

const IMPORT_BIT: u64 = 1 << 63;
const IN_TEXT_BIT: u64 = 1 << 62;
const FUNCTION_TABLE_LIST_BIT: u64 = 1 << 61;
const FUNCTION_IN_TABLE_BIT: u64 = 1 << 60;
const TERMINATE_MASK: u64 = IMPORT_BIT | (1 << 32);
const TAG_MASK: u64 = IN_TEXT_BIT | FUNCTION_TABLE_LIST_BIT | FUNCTION_IN_TABLE_BIT;

/// Inline immediates carry bit 31; bit 30 is their sign.
const INLINE_BIT: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolItemKind {
    Constant,
    InText,
    FunctionTableList,
    FunctionInTable,
    TerminateFunction,
    Import,
}

/// Read-only view of the constant pool.
#[derive(Debug, Clone, Default)]
pub struct PoolItems {
    items: Vec<u64>,
}

impl PoolItems {
    pub fn new(items: Vec<u64>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Raw item at a 1-based index.
    pub fn raw(&self, index: u32) -> Option<u64> {
        let slot = (index as usize).checked_sub(1)?;
        self.items.get(slot).copied()
    }

    pub fn classify(&self, index: u32) -> Option<PoolItemKind> {
        let item = self.raw(index)?;
        let kind = if item & TERMINATE_MASK == TERMINATE_MASK {
            PoolItemKind::TerminateFunction
        } else if item & IMPORT_BIT != 0 {
            PoolItemKind::Import
        } else if item & IN_TEXT_BIT != 0 {
            PoolItemKind::InText
        } else if item & FUNCTION_TABLE_LIST_BIT != 0 {
            PoolItemKind::FunctionTableList
        } else if item & FUNCTION_IN_TABLE_BIT != 0 {
            PoolItemKind::FunctionInTable
        } else {
            PoolItemKind::Constant
        };
        Some(kind)
    }

    /// True for every constant-like item, including tagged text pointers.
    pub fn is_constant(&self, index: u32) -> bool {
        self.raw(index).is_some_and(|item| item & IMPORT_BIT == 0)
    }

    pub fn is_in_text(&self, index: u32) -> bool {
        self.classify(index) == Some(PoolItemKind::InText)
    }

    pub fn is_function_table_list(&self, index: u32) -> bool {
        self.classify(index) == Some(PoolItemKind::FunctionTableList)
    }

    pub fn is_function_in_table(&self, index: u32) -> bool {
        self.classify(index) == Some(PoolItemKind::FunctionInTable)
    }

    pub fn is_terminate_function(&self, index: u32) -> bool {
        self.classify(index) == Some(PoolItemKind::TerminateFunction)
    }

    /// Payload of a constant-like item with the tag bits stripped, or 0.
    pub fn get_constant(&self, index: u32) -> u32 {
        match self.raw(index) {
            Some(item) if item & IMPORT_BIT == 0 => (item & !TAG_MASK) as u32,
            _ => 0,
        }
    }

    /// Indices of every item, 1-based.
    pub fn indices(&self) -> impl Iterator<Item = u32> {
        1..=self.items.len() as u32
    }

    /// Resolve an immediate dword: inline value or pool constant.
    pub fn read_immediate(&self, dword: u32) -> Option<u32> {
        if dword & INLINE_BIT != 0 {
            return Some(decode_inline(dword));
        }
        if self.is_constant(dword) {
            Some(self.get_constant(dword))
        } else {
            None
        }
    }

    /// Resolve the target of a dword-form branch at `addr`.
    ///
    /// Text pointers are absolute; inline and plain constants are relative to
    /// the branch instruction.
    pub fn branch_target(&self, addr: u32, dword: u32) -> Option<u32> {
        if dword & INLINE_BIT == 0 && self.is_in_text(dword) {
            return Some(self.get_constant(dword));
        }
        self.read_immediate(dword)
            .map(|offset| addr.wrapping_add(offset))
    }
}

/// Value of an inline immediate: bit 30 is copied into bit 31.
pub fn decode_inline(dword: u32) -> u32 {
    (dword & 0x7FFF_FFFF) | ((dword << 1) & 0x8000_0000)
}

/// Encode a value as an inline immediate. Values must fit in 31 bits signed.
pub fn encode_inline(value: i32) -> u32 {
    (value as u32 & 0x7FFF_FFFF) | INLINE_BIT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PoolItems {
        PoolItems::new(vec![
            42,
            IN_TEXT_BIT | 0x1000,
            FUNCTION_TABLE_LIST_BIT | 0x2000,
            FUNCTION_IN_TABLE_BIT | 0x3000,
            IMPORT_BIT | (1 << 32) | 7,
            IMPORT_BIT | 9,
        ])
    }

    #[test]
    fn test_classify() {
        let pool = sample();
        assert_eq!(pool.classify(1), Some(PoolItemKind::Constant));
        assert_eq!(pool.classify(2), Some(PoolItemKind::InText));
        assert_eq!(pool.classify(3), Some(PoolItemKind::FunctionTableList));
        assert_eq!(pool.classify(4), Some(PoolItemKind::FunctionInTable));
        assert_eq!(pool.classify(5), Some(PoolItemKind::TerminateFunction));
        assert_eq!(pool.classify(6), Some(PoolItemKind::Import));
    }

    #[test]
    fn test_out_of_range_is_total() {
        let pool = sample();
        assert_eq!(pool.classify(0), None);
        assert_eq!(pool.classify(7), None);
        assert!(!pool.is_constant(0));
        assert!(!pool.is_in_text(100));
        assert_eq!(pool.get_constant(0), 0);
        assert_eq!(pool.get_constant(u32::MAX), 0);
    }

    #[test]
    fn test_get_constant_strips_tags() {
        let pool = sample();
        assert_eq!(pool.get_constant(1), 42);
        assert_eq!(pool.get_constant(2), 0x1000);
        assert_eq!(pool.get_constant(3), 0x2000);
        assert_eq!(pool.get_constant(5), 0);
    }

    #[test]
    fn test_inline_immediates() {
        assert_eq!(decode_inline(encode_inline(5)), 5);
        assert_eq!(decode_inline(encode_inline(-8)) as i32, -8);
        assert_eq!(decode_inline(0xC000_0000), 0xC000_0000);
    }

    #[test]
    fn test_read_immediate() {
        let pool = sample();
        assert_eq!(pool.read_immediate(encode_inline(-4)), Some((-4i32) as u32));
        assert_eq!(pool.read_immediate(1), Some(42));
        assert_eq!(pool.read_immediate(6), None);
        assert_eq!(pool.read_immediate(0), None);
    }

    #[test]
    fn test_branch_target_kinds() {
        let pool = sample();
        assert_eq!(pool.branch_target(0x100, encode_inline(-8)), Some(0xF8));
        assert_eq!(pool.branch_target(0x100, 2), Some(0x1000));
        assert_eq!(pool.branch_target(0x100, 1), Some(0x100 + 42));
        assert_eq!(pool.branch_target(0x100, 5), None);
    }
}
