//! Assembly text and listing output
//!
//! Functions go to the `text` psect, data items to `data`, `bss` or
//! `const`. A `.psect` directive is written whenever the current psect
//! changes. Before the first instruction of each source line the line is
//! echoed as `; file:line: text`, at most once per line.
//!
//! The listing shows, per instruction, its psect-relative address, its
//! encoded words in hex (relocated words marked with `'`) and its text.

use super::data::{DataItem, DataWord, Section};
use super::mach::encode::{encode, Word};
use super::mach::relax::addresses;
use super::mach::MachFunc;
use crate::error::{Result, SourceLoc};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

/// Psect holding code
pub const TEXT: &str = "text";
/// `pflg` of the code psect
const TEXT_FLAGS: u8 = 5;

/// Writes assembly for one translation unit
pub struct Emitter<'a> {
    lines: Vec<&'a str>,
    asm: String,
    listing: Option<String>,
    psect: Option<&'static str>,
    echoed: HashSet<(Arc<str>, u32)>,
    sizes: HashMap<&'static str, u32>,
}

fn hex_words(words: &[Word]) -> String {
    words
        .iter()
        .map(|w| {
            let mut s = hex::encode(w.value.to_be_bytes());
            if w.relocated {
                s.push('\'');
            }
            s
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn data_word(w: &DataWord) -> String {
    match w {
        DataWord::Value(v) => format!("{}", *v as i16),
        DataWord::Symbol(s, 0) => s.clone(),
        DataWord::Symbol(s, off) => format!("{}{:+}", s, off),
    }
}

impl<'a> Emitter<'a> {
    /// Creates an emitter echoing lines of `source`
    pub fn new(source: &'a str, listing: bool) -> Self {
        Emitter {
            lines: source.lines().collect(),
            asm: String::new(),
            listing: listing.then(String::new),
            psect: None,
            echoed: HashSet::new(),
            sizes: HashMap::new(),
        }
    }

    fn psect(&mut self, name: &'static str, flags: u8) {
        if self.psect == Some(name) {
            return;
        }
        self.psect = Some(name);
        let _ = writeln!(self.asm, "\t.psect\t{},pflg={},p2al=0", name, flags);
        if let Some(l) = self.listing.as_mut() {
            let _ = writeln!(l, "{:>24}\t.psect\t{}", "", name);
        }
    }

    fn address(&self) -> u32 {
        self.psect.and_then(|p| self.sizes.get(p)).copied().unwrap_or(0)
    }

    fn advance(&mut self, words: u32) {
        if let Some(p) = self.psect {
            *self.sizes.entry(p).or_insert(0) += words;
        }
    }

    fn line(&mut self, text: &str) {
        self.asm.push_str(text);
        self.asm.push('\n');
    }

    fn list(&mut self, address: Option<u32>, words: &[Word], text: &str) {
        let Some(l) = self.listing.as_mut() else {
            return;
        };
        let addr = address.map(|a| format!("{:04x}", a)).unwrap_or_default();
        let mut rows = text.lines();
        let _ = writeln!(l, "{:<4} {:<19}{}", addr, hex_words(words), rows.next().unwrap_or(""));
        for rest in rows {
            let _ = writeln!(l, "{:<24}{}", "", rest);
        }
    }

    /// Echoes the source line of `loc` unless it was echoed already
    fn echo(&mut self, loc: &SourceLoc) {
        if loc.line == 0 || !self.echoed.insert((loc.file.clone(), loc.line)) {
            return;
        }
        let text = self
            .lines
            .get(loc.phys_line.saturating_sub(1) as usize)
            .copied()
            .unwrap_or("")
            .trim_end();
        let comment = format!("; {}:{}: {}", loc.file, loc.line, text);
        self.line(&comment);
        if let Some(l) = self.listing.as_mut() {
            let _ = writeln!(l, "{:<24}{}", "", comment);
        }
    }

    fn symbol(&mut self, label: &str, exported: bool) {
        if exported {
            self.line(&format!("\t.global\t{}", label));
            self.list(None, &[], &format!("\t.global\t{}", label));
        }
        self.line(&format!("{}:", label));
        let at = self.address();
        self.list(Some(at), &[], &format!("{}:", label));
    }

    /// Writes a relaxed function
    pub fn function(&mut self, func: &MachFunc) -> Result<()> {
        self.psect(TEXT, TEXT_FLAGS);
        let base = self.address();
        let (nodes, labels) = addresses(func, base);
        self.symbol(&func.label, func.exported);
        for (id, m) in func.code.iter() {
            if let Some(loc) = func.code.loc(id) {
                let loc = loc.clone();
                self.echo(&loc);
            }
            let at = nodes.get(&id).copied().unwrap_or(base);
            let words = encode(m, at, &labels)?;
            let text = m.to_string();
            self.line(&text);
            self.list(Some(at), &words, &text);
        }
        self.advance(func.size());
        Ok(())
    }

    /// Writes static data
    pub fn data(&mut self, item: &DataItem) {
        let flags = item.section.flags();
        self.psect(item.section.name(), flags);
        if let Some(loc) = &item.loc {
            self.echo(loc);
        }
        self.symbol(&item.label, item.exported);
        let at = self.address();
        if item.section == Section::Bss {
            let text = format!("\t.blkw\t{}", item.size);
            self.line(&text);
            self.list(Some(at), &[], &text);
        } else {
            for (i, w) in item.words.iter().enumerate() {
                let text = format!("\t.word\t{}", data_word(w));
                self.line(&text);
                let word = match w {
                    DataWord::Value(v) => Word {
                        value: *v,
                        relocated: false,
                    },
                    DataWord::Symbol(_, off) => Word {
                        value: *off as u16,
                        relocated: true,
                    },
                };
                self.list(Some(at + i as u32), &[word], &text);
            }
        }
        self.advance(item.size);
    }

    /// Finished assembly text and listing
    pub fn finish(self) -> (String, Option<String>) {
        (self.asm, self.listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::mach::{Mach, Reg};

    fn ret_func(label: &str, exported: bool, loc: Option<SourceLoc>) -> MachFunc {
        let mut f = MachFunc::new(label, exported, Vec::new(), SourceLoc::builtin());
        f.code.push_back(Mach::Ldi { rd: Reg::R0, value: 1 }, loc.clone());
        f.code.push_back(Mach::Ret { wide: false }, loc);
        f
    }

    #[test]
    fn test_psect_written_once_per_change() {
        let mut e = Emitter::new("", false);
        e.function(&ret_func("a", true, None)).unwrap();
        e.function(&ret_func("b", false, None)).unwrap();
        e.data(&DataItem::bss("g", 3, true));
        let (asm, listing) = e.finish();
        assert!(listing.is_none());
        assert_eq!(asm.matches(".psect\ttext").count(), 1);
        assert_eq!(asm.matches(".psect\tbss").count(), 1);
        assert!(asm.contains("\t.global\ta\na:\n"));
        assert!(!asm.contains(".global\tb"));
        assert!(asm.contains("\t.blkw\t3"));
    }

    #[test]
    fn test_source_line_echoed_once() {
        let loc = SourceLoc::new(Arc::from("t.c"), 2, 1);
        let mut e = Emitter::new("int x;\nint f(void) { return 1; }\n", false);
        e.function(&ret_func("f", true, Some(loc))).unwrap();
        let (asm, _) = e.finish();
        assert_eq!(asm.matches("; t.c:2: int f(void) { return 1; }").count(), 1);
    }

    #[test]
    fn test_listing_shows_addresses_and_words() {
        let mut e = Emitter::new("", true);
        e.function(&ret_func("a", false, None)).unwrap();
        e.function(&ret_func("b", false, None)).unwrap();
        let (_, listing) = e.finish();
        let listing = listing.unwrap();
        // ldi r0,#1 encodes as 3001; ret as 1007; b starts at word 2
        assert!(listing.contains("0000 3001"));
        assert!(listing.contains("0002 3001"));
        assert!(listing.contains("1007"));
    }

    #[test]
    fn test_relocated_data_word_marked() {
        let mut e = Emitter::new("", true);
        e.data(&DataItem::init(
            "vt",
            Section::Const,
            vec![DataWord::Symbol("S__f".into(), 0)],
            false,
        ));
        let (asm, listing) = e.finish();
        assert!(asm.contains("\t.word\tS__f"));
        assert!(listing.unwrap().contains("0000'"));
    }
}
