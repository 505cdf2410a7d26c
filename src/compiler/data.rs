//! Static data: globals, string literals, named constants and vtables

use crate::error::SourceLoc;

/// Output section of a data item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Section {
    /// Initialized, writable
    Data,
    /// Zero-initialized, only the size is emitted
    Bss,
    /// Read-only: string literals, `const` objects, vtables
    Const,
}

impl Section {
    /// Psect name
    pub fn name(self) -> &'static str {
        match self {
            Section::Data => "data",
            Section::Bss => "bss",
            Section::Const => "const",
        }
    }

    /// `pflg` attribute of the psect
    pub fn flags(self) -> u8 {
        match self {
            Section::Data => 0,
            Section::Bss => 2,
            Section::Const => 1,
        }
    }
}

/// One initialized word
#[derive(Debug, Clone, PartialEq)]
pub enum DataWord {
    /// Literal 16-bit value
    Value(u16),
    /// Address of a label plus a word offset (relocated)
    Symbol(String, i64),
}

/// A labeled block of static storage
#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    /// Assembly label
    pub label: String,
    /// Section
    pub section: Section,
    /// Emit `.global`
    pub exported: bool,
    /// Contents; empty for bss
    pub words: Vec<DataWord>,
    /// Size in words
    pub size: u32,
    /// Definition site
    pub loc: Option<SourceLoc>,
}

impl DataItem {
    /// Zero-filled storage
    pub fn bss(label: impl Into<String>, size: u32, exported: bool) -> Self {
        DataItem {
            label: label.into(),
            section: Section::Bss,
            exported,
            words: Vec::new(),
            size,
            loc: None,
        }
    }

    /// Initialized storage
    pub fn init(label: impl Into<String>, section: Section, words: Vec<DataWord>, exported: bool) -> Self {
        let size = words.len() as u32;
        DataItem {
            label: label.into(),
            section,
            exported,
            words,
            size,
            loc: None,
        }
    }

    /// A string literal, one character per word, NUL terminated
    pub fn string(label: impl Into<String>, bytes: &[u8]) -> Self {
        let words = bytes
            .iter()
            .map(|b| DataWord::Value(*b as u16))
            .chain(std::iter::once(DataWord::Value(0)))
            .collect();
        DataItem::init(label, Section::Const, words, false)
    }
}

/// Splits a value into little-endian words (low word first)
pub fn value_words(bits: u64, count: usize) -> Vec<DataWord> {
    (0..count)
        .map(|i| DataWord::Value((bits >> (16 * i)) as u16))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_is_nul_terminated_words() {
        let item = DataItem::string("L1", b"hi");
        assert_eq!(item.size, 3);
        assert_eq!(item.words[0], DataWord::Value(b'h' as u16));
        assert_eq!(item.words[2], DataWord::Value(0));
        assert_eq!(item.section, Section::Const);
    }

    #[test]
    fn test_value_words_low_first() {
        let w = value_words(0x1234_5678, 2);
        assert_eq!(w, vec![DataWord::Value(0x5678), DataWord::Value(0x1234)]);
    }
}
