//! Initializers for static storage and for locals
//!
//! Static objects get their full image at compile time: every word is
//! either a literal or a relocated label. Local aggregates become a list of
//! stores run after the object is zero filled.

use super::ast::{Expr, ExprKind, LocalInit};
use super::fold::{fold, Const};
use super::Parser;
use crate::compiler::data::{value_words, DataWord};
use crate::error::{Error, Result, SourceLoc};
use crate::lexer::{Punct, TokenKind};
use crate::types::{StructId, Type, TypeId};
use std::collections::HashSet;

/// Stores collected for a braced local initializer
#[derive(Debug, Default)]
struct Aggregate {
    vptrs: Vec<(u32, String)>,
    constructs: Vec<(u32, StructId)>,
    items: Vec<(u32, Expr)>,
}

/// A struct component initialized by one element of a braced list
#[derive(Debug, Clone)]
struct Component {
    offset: u32,
    ty: TypeId,
    default: Option<Expr>,
}

impl Parser<'_> {
    // ========================================================================
    // Static storage
    // ========================================================================

    /// Parses the initializer after `=` of a static object. Returns the
    /// completed type (array lengths filled in) and the image.
    pub(super) fn global_initializer(&mut self, ty: TypeId, loc: &SourceLoc) -> Result<(TypeId, Vec<DataWord>)> {
        let mut words = Vec::new();
        let ty = self.static_value(ty, &mut words, loc)?;
        Ok((ty, words))
    }

    fn static_value(&mut self, ty: TypeId, out: &mut Vec<DataWord>, loc: &SourceLoc) -> Result<TypeId> {
        let ty_u = self.sess.types.unqualified(ty);
        if let Type::Array(elem, len) = self.sess.types.kind(ty_u).clone() {
            return self.static_array(elem, len, out, loc);
        }
        if let Some(sid) = self.sess.types.as_struct(ty_u) {
            if !self.eat(Punct::LBrace) {
                return Err(Error::semantic(loc, "initializer is not a constant"));
            }
            let image = self.static_struct(sid, loc)?;
            out.extend(image);
            return Ok(ty);
        }
        let braced = self.eat(Punct::LBrace);
        let e = self.assignment_expr()?;
        let e = self.convert(e, ty)?;
        if braced {
            self.eat(Punct::Comma);
            self.expect(Punct::RBrace)?;
        }
        let value = fold(&e, &self.sess.types, &self.sess.symbols)
            .ok_or_else(|| Error::semantic(&e.loc, "initializer is not a constant"))?;
        out.extend(self.const_words(ty_u, value, &e.loc)?);
        Ok(ty)
    }

    fn static_array(
        &mut self,
        elem: TypeId,
        len: Option<u32>,
        out: &mut Vec<DataWord>,
        loc: &SourceLoc,
    ) -> Result<TypeId> {
        let esize = self
            .sess
            .types
            .size_of(elem)
            .ok_or_else(|| Error::semantic(loc, "array of incomplete element type"))?;
        let is_char = esize == 1 && self.sess.types.is_integer(elem);
        if let (true, TokenKind::Str(bytes)) = (is_char, &self.peek().kind) {
            let bytes = bytes.clone();
            self.next();
            let n = self.string_length(&bytes, len, loc)?;
            out.extend(
                bytes
                    .iter()
                    .map(|b| DataWord::Value(*b as u16))
                    .chain(std::iter::repeat(DataWord::Value(0)))
                    .take(n as usize),
            );
            return Ok(self.sess.types.array_of(elem, Some(n)));
        }

        self.expect(Punct::LBrace)?;
        let mut count = 0u32;
        while !self.eat(Punct::RBrace) {
            if let Some(n) = len {
                if count >= n {
                    return Err(Error::semantic(&self.loc(), "excess elements in array initializer"));
                }
            }
            self.static_value(elem, out, loc)?;
            count += 1;
            if !self.eat(Punct::Comma) {
                self.expect(Punct::RBrace)?;
                break;
            }
        }
        let n = len.unwrap_or(count);
        let padding = (n - count) * esize;
        out.extend(std::iter::repeat(DataWord::Value(0)).take(padding as usize));
        Ok(self.sess.types.array_of(elem, Some(n)))
    }

    /// Length of a char array initialized from a string; the NUL is dropped
    /// when the declared length leaves no room for it
    fn string_length(&self, bytes: &[u8], len: Option<u32>, loc: &SourceLoc) -> Result<u32> {
        let needed = bytes.len() as u32;
        match len {
            None => Ok(needed + 1),
            Some(n) if n >= needed => Ok(n),
            Some(_) => Err(Error::semantic(loc, "initializer-string for char array is too long")),
        }
    }

    /// Bases, then fields; a union takes only its first field
    fn components(&mut self, sid: StructId) -> Vec<Component> {
        let def = self.sess.types.struct_def(sid).clone();
        let mut all: Vec<Component> = def
            .bases
            .iter()
            .map(|b| Component {
                offset: b.offset,
                ty: self.sess.types.struct_type(b.sid),
                default: None,
            })
            .collect();
        all.extend(def.fields.iter().map(|f| Component {
            offset: f.offset,
            ty: f.ty,
            default: f.init.clone(),
        }));
        if def.is_union {
            all.truncate(1);
        }
        all
    }

    /// Braced static struct initializer; `{` has been consumed
    fn static_struct(&mut self, sid: StructId, loc: &SourceLoc) -> Result<Vec<DataWord>> {
        let mut image = self.struct_image(sid, loc, false)?;
        let components = self.components(sid);
        let mut idx = 0;
        while !self.eat(Punct::RBrace) {
            let c = components
                .get(idx)
                .cloned()
                .ok_or_else(|| Error::semantic(&self.loc(), "excess elements in struct initializer"))?;
            let mut words = Vec::new();
            self.static_value(c.ty, &mut words, loc)?;
            let start = c.offset as usize;
            image.splice(start..start + words.len(), words);
            idx += 1;
            if !self.eat(Punct::Comma) {
                self.expect(Punct::RBrace)?;
                break;
            }
        }
        // Explicit base images carry the base's vptrs; restore ours.
        self.store_vptrs(sid, &mut image);
        Ok(image)
    }

    /// Image of a struct object that is not explicitly initialized
    pub(super) fn static_image(&mut self, sid: StructId, loc: &SourceLoc) -> Result<Vec<DataWord>> {
        self.struct_image(sid, loc, true)
    }

    fn struct_image(&mut self, sid: StructId, loc: &SourceLoc, run_ctor: bool) -> Result<Vec<DataWord>> {
        let def = self.sess.types.struct_def(sid).clone();
        if run_ctor && def.methods.iter().any(|m| m.name == "__ctor") {
            return Err(Error::semantic(
                loc,
                format!("static '{}' needs a constructor call; dynamic initialization is not supported", def.name),
            ));
        }
        self.mark_struct_used(sid);
        let mut image = vec![DataWord::Value(0); def.size as usize];
        for b in &def.bases {
            if self.sess.types.struct_def(b.sid).needs_init {
                let sub = self.struct_image(b.sid, loc, true)?;
                let start = b.offset as usize;
                image.splice(start..start + sub.len(), sub);
            }
        }
        for f in &def.fields {
            let start = f.offset as usize;
            if let Some(init) = &f.init {
                let value = fold(init, &self.sess.types, &self.sess.symbols)
                    .ok_or_else(|| Error::semantic(&init.loc, "default member initializer is not a constant"))?;
                let ty = self.sess.types.unqualified(f.ty);
                let words = self.const_words(ty, value, &init.loc)?;
                image.splice(start..start + words.len(), words);
            } else if let Some(fsid) = self.sess.types.as_struct(f.ty) {
                if self.sess.types.struct_def(fsid).needs_init {
                    let sub = self.struct_image(fsid, loc, true)?;
                    image.splice(start..start + sub.len(), sub);
                }
            }
            if def.is_union {
                break;
            }
        }
        self.store_vptrs(sid, &mut image);
        Ok(image)
    }

    fn store_vptrs(&self, sid: StructId, image: &mut [DataWord]) {
        for vt in &self.sess.types.struct_def(sid).vtables {
            if let Some(w) = image.get_mut(vt.vptr_offset as usize) {
                *w = DataWord::Symbol(vt.label.clone(), 0);
            }
        }
    }

    /// Words of a folded constant stored in an object of type `ty`
    fn const_words(&self, ty: TypeId, value: Const, loc: &SourceLoc) -> Result<Vec<DataWord>> {
        let size = self.sess.types.size_of(ty).unwrap_or(1) as usize;
        match (value, self.sess.types.kind(ty)) {
            (Const::Float(f), Type::Float { bits: 32 }) => Ok(value_words((f as f32).to_bits() as u64, 2)),
            (Const::Float(f), Type::Float { .. }) => Ok(value_words(f.to_bits(), 4)),
            (Const::Int(v), _) => Ok(value_words(v as u64, size)),
            (Const::Addr(label, off), _) if size == 1 => Ok(vec![DataWord::Symbol(label, off)]),
            _ => Err(Error::semantic(loc, "initializer is not a constant")),
        }
    }

    // ========================================================================
    // Locals
    // ========================================================================

    /// Parses the optional `= ...` of a local. Returns the completed type
    /// and how the object starts out.
    pub(super) fn local_initializer(&mut self, ty: TypeId, loc: &SourceLoc) -> Result<(TypeId, LocalInit)> {
        let ty_u = self.sess.types.unqualified(ty);
        let sid = self.sess.types.as_struct(ty_u);
        if !self.eat(Punct::Assign) {
            return Ok(match sid {
                Some(s) if self.sess.types.struct_def(s).needs_init => (ty, LocalInit::Construct(s)),
                _ => (ty, LocalInit::None),
            });
        }

        let aggregate = self.sess.types.is_array(ty_u) || (sid.is_some() && self.peek_punct(Punct::LBrace));
        if !aggregate {
            let e = self.assignment_expr()?;
            let e = self.convert(e, ty)?;
            return Ok((ty, LocalInit::Expr(e)));
        }

        let mut acc = Aggregate::default();
        let ty = self.local_value(ty, 0, &mut acc, loc)?;
        Ok((
            ty,
            LocalInit::Aggregate {
                vptrs: acc.vptrs,
                constructs: acc.constructs,
                items: acc.items,
            },
        ))
    }

    fn local_value(&mut self, ty: TypeId, at: u32, acc: &mut Aggregate, loc: &SourceLoc) -> Result<TypeId> {
        let ty_u = self.sess.types.unqualified(ty);
        if let Type::Array(elem, len) = self.sess.types.kind(ty_u).clone() {
            return self.local_array(elem, len, at, acc, loc);
        }
        if let Some(sid) = self.sess.types.as_struct(ty_u) {
            if self.eat(Punct::LBrace) {
                self.local_struct(sid, at, acc)?;
                return Ok(ty);
            }
        }
        let braced = self.sess.types.as_struct(ty_u).is_none() && self.eat(Punct::LBrace);
        let e = self.assignment_expr()?;
        let e = self.convert(e, ty)?;
        if braced {
            self.eat(Punct::Comma);
            self.expect(Punct::RBrace)?;
        }
        acc.items.push((at, e));
        Ok(ty)
    }

    fn local_array(
        &mut self,
        elem: TypeId,
        len: Option<u32>,
        at: u32,
        acc: &mut Aggregate,
        loc: &SourceLoc,
    ) -> Result<TypeId> {
        let esize = self
            .sess
            .types
            .size_of(elem)
            .ok_or_else(|| Error::semantic(loc, "array of incomplete element type"))?;
        let is_char = esize == 1 && self.sess.types.is_integer(elem);
        if let (true, TokenKind::Str(bytes)) = (is_char, &self.peek().kind) {
            let bytes = bytes.clone();
            let sloc = self.next().loc;
            let n = self.string_length(&bytes, len, loc)?;
            let elem_u = self.sess.types.unqualified(elem);
            for (i, b) in bytes.iter().take(n as usize).enumerate() {
                let value = Expr::new(ExprKind::Int(*b as i8 as i64), elem_u, sloc.clone());
                acc.items.push((at + i as u32, value));
            }
            return Ok(self.sess.types.array_of(elem, Some(n)));
        }

        self.expect(Punct::LBrace)?;
        let mut count = 0u32;
        while !self.eat(Punct::RBrace) {
            if let Some(n) = len {
                if count >= n {
                    return Err(Error::semantic(&self.loc(), "excess elements in array initializer"));
                }
            }
            self.local_value(elem, at + count * esize, acc, loc)?;
            count += 1;
            if !self.eat(Punct::Comma) {
                self.expect(Punct::RBrace)?;
                break;
            }
        }
        Ok(self.sess.types.array_of(elem, Some(len.unwrap_or(count))))
    }

    /// Braced local struct initializer; `{` has been consumed. Omitted
    /// components are constructed or get their default values.
    fn local_struct(&mut self, sid: StructId, at: u32, acc: &mut Aggregate) -> Result<()> {
        self.mark_struct_used(sid);
        let components = self.components(sid);
        let mut given = HashSet::new();
        let mut idx = 0;
        while !self.eat(Punct::RBrace) {
            let cloc = self.loc();
            let c = components
                .get(idx)
                .cloned()
                .ok_or_else(|| Error::semantic(&cloc, "excess elements in struct initializer"))?;
            self.local_value(c.ty, at + c.offset, acc, &cloc)?;
            given.insert(idx);
            idx += 1;
            if !self.eat(Punct::Comma) {
                self.expect(Punct::RBrace)?;
                break;
            }
        }

        for (i, c) in components.iter().enumerate() {
            if given.contains(&i) {
                continue;
            }
            if let Some(e) = &c.default {
                acc.items.push((at + c.offset, e.clone()));
            } else if let Some(csid) = self.sess.types.as_struct(c.ty) {
                if self.sess.types.struct_def(csid).needs_init {
                    self.mark_struct_used(csid);
                    acc.constructs.push((at + c.offset, csid));
                }
            }
        }
        for vt in &self.sess.types.struct_def(sid).vtables {
            acc.vptrs.push((at + vt.vptr_offset, vt.label.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::compiler::data::{DataWord, Section};
    use crate::parser::ast::{LocalInit, StmtKind};
    use crate::parser::tests::parse_src;

    fn data_words(src: &str, label: &str) -> Vec<DataWord> {
        let (sess, unit) = parse_src(src);
        assert!(!sess.has_errors(), "{:?}", sess.diags.errors());
        unit.data
            .iter()
            .find(|d| d.label == label)
            .map(|d| d.words.clone())
            .unwrap_or_else(|| panic!("no item {}", label))
    }

    #[test]
    fn test_global_array_padding_and_length() {
        let w = data_words("int a[4] = { 1, 2 };", "a");
        assert_eq!(
            w,
            vec![DataWord::Value(1), DataWord::Value(2), DataWord::Value(0), DataWord::Value(0)]
        );
        let w = data_words("int b[] = { 7, 8, 9 };", "b");
        assert_eq!(w.len(), 3);
    }

    #[test]
    fn test_global_long_and_negative() {
        let w = data_words("long x = -2;", "x");
        assert_eq!(w, vec![DataWord::Value(0xfffe), DataWord::Value(0xffff)]);
    }

    #[test]
    fn test_global_char_array_from_string() {
        let w = data_words("char s[] = \"ok\";", "s");
        assert_eq!(
            w,
            vec![DataWord::Value(b'o' as u16), DataWord::Value(b'k' as u16), DataWord::Value(0)]
        );
        let w = data_words("char t[2] = \"ok\";", "t");
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn test_global_pointer_to_global() {
        let w = data_words("int a[3]; int *p = &a[2];", "p");
        assert_eq!(w, vec![DataWord::Symbol("a".into(), 2)]);
    }

    #[test]
    fn test_global_struct_with_vtable_and_defaults() {
        let src = "struct V { int k = 5; virtual int f(void) { return k; } };\n\
                   struct V g;";
        let (sess, unit) = parse_src(src);
        assert!(!sess.has_errors(), "{:?}", sess.diags.errors());
        let item = unit.data.iter().find(|d| d.label == "g").unwrap();
        assert_eq!(item.section, Section::Data);
        assert_eq!(item.words[0], DataWord::Symbol("__vtbl_V".into(), 0));
        assert_eq!(item.words[1], DataWord::Value(5));
    }

    #[test]
    fn test_static_ctor_rejected() {
        let src = "struct C { int a; void __ctor() { a = 1; } }; struct C g;";
        let (sess, _) = parse_src(src);
        assert!(sess.has_errors());
    }

    #[test]
    fn test_local_braced_struct() {
        let src = "struct P { int x; int y = 3; };\n\
                   void f(void) { struct P p = { 1 }; }";
        let (sess, unit) = parse_src(src);
        assert!(!sess.has_errors(), "{:?}", sess.diags.errors());
        let body = &unit.functions[0].body;
        let local = match &body.kind {
            StmtKind::Block(items) => items[0].clone(),
            _ => panic!(),
        };
        match local.kind {
            StmtKind::Local {
                init: LocalInit::Aggregate { items, .. },
                ..
            } => {
                let offsets: Vec<u32> = items.iter().map(|(o, _)| *o).collect();
                assert_eq!(offsets, vec![0, 1]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_excess_elements() {
        let (sess, _) = parse_src("int a[1] = { 1, 2 };");
        assert!(sess.has_errors());
    }
}
