//! Declarations: specifiers, declarators, struct/union/enum bodies and
//! function definitions

use super::ast::{FunctionDef, Stmt};
use super::decl::{Decl, DeclId, DeclKind, Storage, VarLocation};
use super::fold::Const;
use super::scope::{ScopeId, ScopeKind, Tag};
use super::{Deferred, FuncState, ParamInfo, Parser};
use crate::compiler::data::{DataItem, Section};
use crate::error::{Error, Result, SourceLoc};
use crate::lexer::{Keyword, Punct, Token, TokenKind, TokenStream};
use crate::types::{Field, Method, StructId, TypeId, MAX_OBJECT_WORDS};

/// Storage class, base type and flags shared by a declaration's declarators
#[derive(Debug, Clone)]
pub(crate) struct DeclSpec {
    pub storage: Storage,
    pub ty: TypeId,
    pub is_virtual: bool,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub(crate) enum Modifier {
    Pointer { is_const: bool, is_volatile: bool },
    Array(Option<u32>),
    Function { params: Vec<ParamInfo>, varargs: bool },
}

/// A declarator before its modifiers are applied to the base type
#[derive(Debug, Clone, Default)]
pub(crate) struct Declarator {
    pub name: Option<(String, SourceLoc)>,
    /// `Owner` in `Owner::name`
    pub owner: Option<(String, SourceLoc)>,
    /// Applied in order to the base type
    pub mods: Vec<Modifier>,
}

#[derive(Default)]
struct Builtin {
    void: u8,
    char: u8,
    short: u8,
    int: u8,
    long: u8,
    float: u8,
    double: u8,
    signed: u8,
    unsigned: u8,
}

impl Builtin {
    fn any(&self) -> bool {
        self.void
            + self.char
            + self.short
            + self.int
            + self.long
            + self.float
            + self.double
            + self.signed
            + self.unsigned
            > 0
    }
}

impl Parser<'_> {
    // ========================================================================
    // Top level
    // ========================================================================

    pub(super) fn external_declaration(&mut self) -> Result<()> {
        let spec = self.specifiers()?;
        if spec.is_virtual {
            return Err(Error::syntax(&spec.loc, "'virtual' outside of a struct"));
        }
        if self.eat(Punct::Semi) {
            return Ok(());
        }
        let mut first = true;
        loop {
            let d = self.declarator()?;
            let (ty, params) = self.apply_declarator(spec.ty, &d)?;
            let asm = self.asm_label()?;
            if first && self.sess.types.is_function(ty) && self.peek_punct(Punct::LBrace) {
                let loc = d.name.as_ref().map(|n| n.1.clone()).unwrap_or(spec.loc.clone());
                let (decl, member) = self.declare_function(&spec, &d, ty, params.clone(), asm)?;
                return self.function_body(decl, params.unwrap_or_default(), member, loc);
            }
            first = false;
            self.declare_object(&spec, &d, ty, params, asm, false)?;
            if self.eat(Punct::Comma) {
                continue;
            }
            self.expect(Punct::Semi)?;
            return Ok(());
        }
    }

    fn asm_label(&mut self) -> Result<Option<String>> {
        if !self.tokens.eat_keyword(Keyword::Asm) {
            return Ok(None);
        }
        self.expect(Punct::LParen)?;
        let tok = self.next();
        let label = match tok.kind {
            TokenKind::Str(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            other => {
                return Err(Error::syntax(
                    &tok.loc,
                    format!("expected string literal in __asm before '{}'", other),
                ))
            }
        };
        self.expect(Punct::RParen)?;
        Ok(Some(label))
    }

    // ========================================================================
    // Specifiers
    // ========================================================================

    pub(super) fn specifiers(&mut self) -> Result<DeclSpec> {
        let loc = self.loc();
        let mut storage = Storage::None;
        let mut is_virtual = false;
        let (mut is_const, mut is_volatile) = (false, false);
        let mut b = Builtin::default();
        let mut named: Option<TypeId> = None;

        loop {
            let tok = self.peek().clone();
            match &tok.kind {
                TokenKind::Keyword(k) => {
                    let class = match k {
                        Keyword::Typedef => Some(Storage::Typedef),
                        Keyword::Static => Some(Storage::Static),
                        Keyword::Extern => Some(Storage::Extern),
                        Keyword::Auto => Some(Storage::Auto),
                        Keyword::Register => Some(Storage::Register),
                        _ => None,
                    };
                    if let Some(class) = class {
                        if storage != Storage::None {
                            return Err(Error::syntax(&tok.loc, "multiple storage classes in declaration"));
                        }
                        storage = class;
                        self.next();
                        continue;
                    }
                    match k {
                        Keyword::Virtual => is_virtual = true,
                        Keyword::Const => is_const = true,
                        Keyword::Volatile => is_volatile = true,
                        Keyword::Void => b.void += 1,
                        Keyword::Char => b.char += 1,
                        Keyword::Short => b.short += 1,
                        Keyword::Int => b.int += 1,
                        Keyword::Long => b.long += 1,
                        Keyword::Float => b.float += 1,
                        Keyword::Double => b.double += 1,
                        Keyword::Signed => b.signed += 1,
                        Keyword::Unsigned => b.unsigned += 1,
                        Keyword::Struct | Keyword::Union | Keyword::Enum => {
                            if named.is_some() || b.any() {
                                return Err(Error::syntax(&tok.loc, "two or more data types in declaration"));
                            }
                            self.next();
                            named = Some(match k {
                                Keyword::Enum => self.enum_specifier()?,
                                _ => self.struct_specifier(*k == Keyword::Union)?,
                            });
                            continue;
                        }
                        _ => break,
                    }
                    self.next();
                }
                TokenKind::Ident(name) if named.is_none() && !b.any() => {
                    match self.sess.symbols.lookup(self.scope, name) {
                        Some((_, d)) => match self.sess.symbols.decl(d).kind {
                            DeclKind::Typedef { ty } => {
                                named = Some(ty);
                                self.next();
                            }
                            _ => break,
                        },
                        None => break,
                    }
                }
                _ => break,
            }
        }

        let base = match named {
            Some(ty) => {
                if b.any() {
                    return Err(Error::syntax(&loc, "two or more data types in declaration"));
                }
                ty
            }
            None => self.builtin_type(&b, &loc)?,
        };
        let ty = self.sess.types.qualified(base, is_const, is_volatile);
        Ok(DeclSpec {
            storage,
            ty,
            is_virtual,
            loc,
        })
    }

    fn builtin_type(&self, b: &Builtin, loc: &SourceLoc) -> Result<TypeId> {
        let invalid = || Err(Error::syntax(loc, "invalid combination of type specifiers"));
        if !b.any() {
            return Err(Error::syntax(loc, "expected type specifier"));
        }
        if b.signed > 0 && b.unsigned > 0 || b.signed > 1 || b.unsigned > 1 {
            return invalid();
        }
        let unsigned = b.unsigned > 0;
        let sign_ok = b.void + b.float + b.double == 0;
        if (b.signed + b.unsigned) > 0 && !sign_ok {
            return invalid();
        }
        let others = |n: u8| n > 0;
        if others(b.void) {
            if b.char + b.short + b.int + b.long + b.float + b.double > 0 || b.void > 1 {
                return invalid();
            }
            return Ok(TypeId::VOID);
        }
        if others(b.float) {
            if b.float > 1 || b.char + b.short + b.int + b.long + b.double > 0 {
                return invalid();
            }
            return Ok(TypeId::FLOAT);
        }
        if others(b.double) {
            if b.double > 1 || b.char + b.short + b.int > 0 || b.long > 1 {
                return invalid();
            }
            return Ok(TypeId::DOUBLE);
        }
        if others(b.char) {
            if b.char > 1 || b.short + b.int + b.long > 0 {
                return invalid();
            }
            return Ok(if unsigned { TypeId::UCHAR } else { TypeId::CHAR });
        }
        if b.long > 1 {
            return Err(Error::syntax(loc, "'long long' is not supported"));
        }
        if b.int > 1 || b.short > 1 || (b.short > 0 && b.long > 0) {
            return invalid();
        }
        if b.long == 1 {
            return Ok(if unsigned { TypeId::ULONG } else { TypeId::LONG });
        }
        Ok(if unsigned { TypeId::UINT } else { TypeId::INT })
    }

    // ========================================================================
    // Struct / union / enum
    // ========================================================================

    fn struct_specifier(&mut self, is_union: bool) -> Result<TypeId> {
        let loc = self.loc();
        let kw = if is_union { "union" } else { "struct" };
        let name = match &self.peek().kind {
            TokenKind::Ident(n) => {
                let n = n.clone();
                self.next();
                Some(n)
            }
            _ => None,
        };
        let has_body = self.peek_punct(Punct::LBrace) || (name.is_some() && self.peek_punct(Punct::Colon));

        if !has_body {
            let name = match name {
                Some(n) => n,
                None => return self.unexpected(&format!("'{{' after '{}'", kw)),
            };
            match self.sess.symbols.lookup_tag(self.scope, &name) {
                Some(Tag::Struct(sid)) => {
                    if self.sess.types.struct_def(sid).is_union != is_union {
                        return Err(Error::semantic(
                            &loc,
                            format!("'{}' defined as wrong kind of tag", name),
                        ));
                    }
                    return Ok(self.sess.types.struct_type(sid));
                }
                Some(Tag::Enum(_)) => {
                    return Err(Error::semantic(
                        &loc,
                        format!("'{}' defined as wrong kind of tag", name),
                    ))
                }
                None => {
                    let (sid, ty) = self.sess.types.new_struct(&name, is_union, loc.clone());
                    self.sess
                        .symbols
                        .declare_tag(self.scope, &name, Tag::Struct(sid), loc);
                    return Ok(ty);
                }
            }
        }

        let name = match name {
            Some(n) => n,
            None => {
                self.anon += 1;
                format!("__anon{}", self.anon)
            }
        };
        let sid = match self.sess.symbols.lookup_tag_local(self.scope, &name) {
            Some((Tag::Struct(sid), prior)) => {
                let def = self.sess.types.struct_def(sid);
                if def.complete || def.is_union != is_union {
                    return Err(Error::redefinition(&loc, &name, &prior));
                }
                sid
            }
            Some((Tag::Enum(_), prior)) => return Err(Error::redefinition(&loc, &name, &prior)),
            None => {
                let (sid, _) = self.sess.types.new_struct(&name, is_union, loc.clone());
                self.sess
                    .symbols
                    .declare_tag(self.scope, &name, Tag::Struct(sid), loc.clone());
                sid
            }
        };

        let mut bases = Vec::new();
        if self.eat(Punct::Colon) {
            loop {
                self.tokens.eat_keyword(Keyword::Struct);
                let (bname, bloc) = self.tokens.expect_ident()?;
                match self.sess.symbols.lookup_tag(self.scope, &bname) {
                    Some(Tag::Struct(b)) => {
                        if bases.contains(&b) {
                            return Err(Error::semantic(&bloc, format!("duplicate base '{}'", bname)));
                        }
                        bases.push(b)
                    }
                    _ => {
                        return Err(Error::semantic(
                            &bloc,
                            format!("base '{}' is not a struct", bname),
                        ))
                    }
                }
                if !self.eat(Punct::Comma) {
                    break;
                }
            }
        }
        self.expect(Punct::LBrace)?;

        let outer = self.scope;
        let member_scope = self.enter_scope(ScopeKind::Member(sid));
        self.sess.types.struct_def_mut(sid).scope = Some(member_scope);
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        let mut deferred = Vec::new();
        let parsed = self.members(sid, &name, &mut fields, &mut methods, &mut deferred);
        self.scope = outer;
        parsed?;

        self.sess
            .types
            .layout_struct(sid, bases, fields, methods)
            .map_err(|m| Error::semantic(&loc, m))?;

        for d in deferred {
            self.parse_deferred(d)?;
        }
        Ok(self.sess.types.struct_type(sid))
    }

    fn members(
        &mut self,
        sid: StructId,
        sname: &str,
        fields: &mut Vec<Field>,
        methods: &mut Vec<Method>,
        deferred: &mut Vec<Deferred>,
    ) -> Result<()> {
        while !self.eat(Punct::RBrace) {
            if self.tokens.at_end() {
                return self.unexpected("'}'");
            }
            let spec = self.specifiers()?;
            if !matches!(spec.storage, Storage::None) {
                return Err(Error::syntax(&spec.loc, "storage class on struct member"));
            }
            if self.eat(Punct::Semi) {
                continue;
            }
            loop {
                let d = self.declarator()?;
                let (name, nloc) = match &d.name {
                    Some(n) => n.clone(),
                    None => return self.unexpected("member name"),
                };
                let (ty, params) = self.apply_declarator(spec.ty, &d)?;
                if self.sess.types.is_function(ty) {
                    let asm = self.asm_label()?;
                    let params = params.unwrap_or_default();
                    if (name == "__ctor" || name == "__dtor") && !params.is_empty() {
                        return Err(Error::semantic(
                            &nloc,
                            format!("'{}' takes no parameters", name),
                        ));
                    }
                    let label = asm.unwrap_or_else(|| format!("{}__{}", sname, name));
                    let is_pure = if self.eat(Punct::Assign) {
                        let tok = self.next();
                        if !matches!(tok.kind, TokenKind::Int { value: 0, .. }) {
                            return Err(Error::syntax(&tok.loc, "expected '0' in pure specifier"));
                        }
                        true
                    } else {
                        false
                    };
                    if is_pure && !spec.is_virtual {
                        return Err(Error::semantic(
                            &nloc,
                            format!("pure specifier on non-virtual '{}'", name),
                        ));
                    }
                    let decl = self.sess.symbols.declare(Decl {
                        name: name.clone(),
                        kind: DeclKind::Function {
                            ty,
                            storage: Storage::None,
                            label: label.clone(),
                            defined: false,
                            member_of: Some(sid),
                            params: params.iter().filter_map(|p| p.name.clone()).collect(),
                        },
                        scope: self.scope,
                        loc: nloc.clone(),
                    });
                    methods.push(Method {
                        name,
                        decl,
                        label,
                        fn_ty: ty,
                        is_virtual: spec.is_virtual,
                        is_pure,
                    });
                    if self.peek_punct(Punct::LBrace) {
                        let open = self.next();
                        let body = self.tokens.take_braced()?;
                        deferred.push(Deferred {
                            decl,
                            sid,
                            params,
                            body,
                            open,
                        });
                        break;
                    }
                } else {
                    if spec.is_virtual {
                        return Err(Error::semantic(&nloc, "'virtual' on a data member"));
                    }
                    if self.sess.types.size_of(ty).is_none() {
                        return Err(Error::semantic(
                            &nloc,
                            format!("field '{}' has incomplete type", name),
                        ));
                    }
                    let init = if self.eat(Punct::Assign) {
                        let e = self.assignment_expr()?;
                        Some(self.convert(e, ty)?)
                    } else {
                        None
                    };
                    fields.push(Field {
                        name,
                        ty,
                        offset: 0,
                        init,
                        loc: nloc,
                    });
                }
                if self.eat(Punct::Comma) {
                    continue;
                }
                self.expect(Punct::Semi)?;
                break;
            }
        }
        Ok(())
    }

    fn parse_deferred(&mut self, d: Deferred) -> Result<()> {
        let close_loc = d
            .body
            .last()
            .map(|t| t.loc.clone())
            .unwrap_or_else(|| d.open.loc.clone());
        let loc = d.open.loc.clone();
        let mut toks = Vec::with_capacity(d.body.len() + 2);
        toks.push(d.open);
        toks.extend(d.body);
        toks.push(Token::new(TokenKind::Punct(Punct::RBrace), close_loc));
        let saved = std::mem::replace(&mut self.tokens, TokenStream::new(toks));
        let saved_scope = self.scope;
        let result = self.function_body(d.decl, d.params, Some(d.sid), loc);
        self.tokens = saved;
        self.scope = saved_scope;
        result
    }

    fn enum_specifier(&mut self) -> Result<TypeId> {
        let loc = self.loc();
        let name = match &self.peek().kind {
            TokenKind::Ident(n) => {
                let n = n.clone();
                self.next();
                Some(n)
            }
            _ => None,
        };
        if !self.eat(Punct::LBrace) {
            return match name {
                Some(n) => match self.sess.symbols.lookup_tag(self.scope, &n) {
                    Some(Tag::Enum(ty)) => Ok(ty),
                    _ => Err(Error::semantic(&loc, format!("undefined enum '{}'", n))),
                },
                None => self.unexpected("'{' after 'enum'"),
            };
        }
        if let Some(n) = &name {
            if let Some((_, prior)) = self.sess.symbols.lookup_tag_local(self.scope, n) {
                return Err(Error::redefinition(&loc, n, &prior));
            }
            self.sess
                .symbols
                .declare_tag(self.scope, n, Tag::Enum(TypeId::INT), loc.clone());
        }
        let mut next = 0i64;
        while !self.eat(Punct::RBrace) {
            let (ename, eloc) = self.tokens.expect_ident()?;
            if self.eat(Punct::Assign) {
                let e = self.assignment_expr()?;
                next = self.const_int(&e)?;
            }
            if !self.sess.types.int_fits(TypeId::INT, next) {
                return Err(Error::semantic(&eloc, format!("enumerator '{}' out of range", ename)));
            }
            self.check_redefinition(&ename, &eloc)?;
            self.sess.symbols.declare(Decl {
                name: ename,
                kind: DeclKind::EnumConst { value: next },
                scope: self.scope,
                loc: eloc,
            });
            next += 1;
            if !self.eat(Punct::Comma) {
                self.expect(Punct::RBrace)?;
                break;
            }
        }
        Ok(TypeId::INT)
    }

    // ========================================================================
    // Declarators
    // ========================================================================

    pub(super) fn declarator(&mut self) -> Result<Declarator> {
        let mut pointers = Vec::new();
        while self.eat(Punct::Star) {
            let (mut is_const, mut is_volatile) = (false, false);
            loop {
                if self.tokens.eat_keyword(Keyword::Const) {
                    is_const = true;
                } else if self.tokens.eat_keyword(Keyword::Volatile) {
                    is_volatile = true;
                } else {
                    break;
                }
            }
            pointers.push(Modifier::Pointer {
                is_const,
                is_volatile,
            });
        }

        let mut d = Declarator::default();
        let mut inner = Vec::new();
        match self.peek().kind.clone() {
            TokenKind::Ident(name) => {
                let loc = self.next().loc;
                if self.eat(Punct::ColonColon) {
                    let member = self.tokens.expect_ident()?;
                    d.owner = Some((name, loc));
                    d.name = Some(member);
                } else {
                    d.name = Some((name, loc));
                }
            }
            TokenKind::Punct(Punct::LParen) => {
                let after = self.tokens.peek_nth(1);
                if after.is_punct(Punct::Star) || after.is_punct(Punct::LParen) {
                    self.next();
                    let nested = self.declarator()?;
                    self.expect(Punct::RParen)?;
                    d.name = nested.name;
                    d.owner = nested.owner;
                    inner = nested.mods;
                }
            }
            _ => {}
        }

        let mut suffixes = Vec::new();
        loop {
            if self.eat(Punct::LBracket) {
                if self.eat(Punct::RBracket) {
                    suffixes.push(Modifier::Array(None));
                    continue;
                }
                let e = self.assignment_expr()?;
                let loc = e.loc.clone();
                let n = self.const_int(&e)?;
                if n <= 0 || n > u16::MAX as i64 {
                    return Err(Error::semantic(&loc, format!("invalid array size {}", n)));
                }
                self.expect(Punct::RBracket)?;
                suffixes.push(Modifier::Array(Some(n as u32)));
            } else if self.eat(Punct::LParen) {
                let (params, varargs) = self.parameter_list()?;
                suffixes.push(Modifier::Function { params, varargs });
            } else {
                break;
            }
        }

        d.mods = pointers;
        d.mods.extend(suffixes.into_iter().rev());
        d.mods.extend(inner);
        Ok(d)
    }

    fn parameter_list(&mut self) -> Result<(Vec<ParamInfo>, bool)> {
        let mut params = Vec::new();
        if self.eat(Punct::RParen) {
            return Ok((params, false));
        }
        if self.peek_keyword(Keyword::Void) && self.tokens.peek_nth(1).is_punct(Punct::RParen) {
            self.next();
            self.next();
            return Ok((params, false));
        }
        loop {
            if self.eat(Punct::Ellipsis) {
                self.expect(Punct::RParen)?;
                return Ok((params, true));
            }
            let loc = self.loc();
            let spec = self.specifiers()?;
            if !matches!(spec.storage, Storage::None | Storage::Register) {
                return Err(Error::syntax(&loc, "invalid storage class for parameter"));
            }
            let d = self.declarator()?;
            let (ty, _) = self.apply_declarator(spec.ty, &d)?;
            let ty = self.adjust_param_type(ty);
            if self.sess.types.is_void(ty) {
                return Err(Error::semantic(&loc, "parameter has type void"));
            }
            params.push(ParamInfo {
                name: d.name.map(|n| n.0),
                ty,
                loc: spec.loc,
            });
            if self.eat(Punct::Comma) {
                continue;
            }
            self.expect(Punct::RParen)?;
            return Ok((params, false));
        }
    }

    fn adjust_param_type(&mut self, ty: TypeId) -> TypeId {
        let types = &mut self.sess.types;
        if let Some(elem) = types.element(ty) {
            types.pointer_to(elem)
        } else if types.is_function(ty) {
            types.pointer_to(ty)
        } else {
            ty
        }
    }

    /// Applies a declarator's modifiers; returns the parameters when the
    /// outermost modifier is a function
    pub(super) fn apply_declarator(
        &mut self,
        base: TypeId,
        d: &Declarator,
    ) -> Result<(TypeId, Option<Vec<ParamInfo>>)> {
        let loc = d.name.as_ref().map(|n| n.1.clone()).unwrap_or_else(|| self.loc());
        let mut ty = base;
        let mut params = None;
        for m in &d.mods {
            let types = &mut self.sess.types;
            params = None;
            match m {
                Modifier::Pointer {
                    is_const,
                    is_volatile,
                } => {
                    ty = types.pointer_to(ty);
                    ty = types.qualified(ty, *is_const, *is_volatile);
                }
                Modifier::Array(n) => {
                    if types.is_function(ty) {
                        return Err(Error::semantic(&loc, "array of functions"));
                    }
                    if types.is_void(ty) {
                        return Err(Error::semantic(&loc, "array of void"));
                    }
                    if let (Some(n), Some(elem)) = (n, types.size_of(ty)) {
                        let words = u64::from(elem) * u64::from(*n);
                        if words > u64::from(MAX_OBJECT_WORDS) {
                            return Err(Error::semantic(
                                &loc,
                                format!("array is too large ({} words)", words),
                            ));
                        }
                    }
                    ty = types.array_of(ty, *n);
                }
                Modifier::Function {
                    params: ps,
                    varargs,
                } => {
                    if types.is_function(ty) || types.is_array(ty) {
                        return Err(Error::semantic(
                            &loc,
                            "function cannot return a function or an array",
                        ));
                    }
                    let ret = types.unqualified(ty);
                    ty = types.function(ret, ps.iter().map(|p| p.ty).collect(), *varargs);
                    params = Some(ps.clone());
                }
            }
        }
        Ok((ty, params))
    }

    /// A type name as used by casts and `sizeof`
    pub(super) fn type_name(&mut self) -> Result<TypeId> {
        let spec = self.specifiers()?;
        if !matches!(spec.storage, Storage::None) {
            return Err(Error::syntax(&spec.loc, "storage class in type name"));
        }
        let d = self.declarator()?;
        if let Some((_, loc)) = &d.name {
            return Err(Error::syntax(loc, "unexpected name in type name"));
        }
        Ok(self.apply_declarator(spec.ty, &d)?.0)
    }

    // ========================================================================
    // Declaring names
    // ========================================================================

    pub(super) fn check_redefinition(&self, name: &str, loc: &SourceLoc) -> Result<()> {
        if let Some(prior) = self.sess.symbols.lookup_local(self.scope, name) {
            let prior = &self.sess.symbols.decl(prior).loc;
            return Err(Error::redefinition(loc, name, prior));
        }
        Ok(())
    }

    fn declare_function(
        &mut self,
        spec: &DeclSpec,
        d: &Declarator,
        ty: TypeId,
        params: Option<Vec<ParamInfo>>,
        asm: Option<String>,
    ) -> Result<(DeclId, Option<StructId>)> {
        let (name, loc) = match &d.name {
            Some(n) => n.clone(),
            None => return self.unexpected("function name"),
        };

        if let Some((owner, oloc)) = &d.owner {
            let sid = match self.sess.symbols.lookup_tag(self.scope, owner) {
                Some(Tag::Struct(sid)) if self.sess.types.struct_def(sid).complete => sid,
                _ => return Err(Error::semantic(oloc, format!("'{}' is not a struct", owner))),
            };
            let method = self
                .sess
                .types
                .struct_def(sid)
                .methods
                .iter()
                .find(|m| m.name == name)
                .cloned();
            return match method {
                Some(m) if m.fn_ty == ty => Ok((m.decl, Some(sid))),
                Some(_) => Err(Error::semantic(
                    &loc,
                    format!("conflicting types for '{}::{}'", owner, name),
                )),
                None => Err(Error::semantic(
                    &loc,
                    format!("no member function '{}' in '{}'", name, owner),
                )),
            };
        }

        if let Some(prior) = self.sess.symbols.lookup_local(self.scope, &name) {
            let pd = self.sess.symbols.decl(prior).clone();
            return match &pd.kind {
                DeclKind::Function { ty: pty, .. } if *pty == ty => {
                    if let (Some(params), DeclKind::Function { params: names, .. }) =
                        (params, &mut self.sess.symbols.decl_mut(prior).kind)
                    {
                        *names = params.iter().filter_map(|p| p.name.clone()).collect();
                    }
                    Ok((prior, None))
                }
                _ => {
                    let ploc = pd.loc.clone();
                    Err(Error::redefinition(&loc, &name, &ploc))
                }
            };
        }
        let label = asm.unwrap_or_else(|| name.clone());
        let decl = self.sess.symbols.declare(Decl {
            name,
            kind: DeclKind::Function {
                ty,
                storage: spec.storage,
                label,
                defined: false,
                member_of: None,
                params: params
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|p| p.name.clone())
                    .collect(),
            },
            scope: self.scope,
            loc,
        });
        Ok((decl, None))
    }

    /// Declares one declarator of a non-definition declaration. Returns the
    /// local initialization statement for automatic variables.
    pub(super) fn declare_object(
        &mut self,
        spec: &DeclSpec,
        d: &Declarator,
        ty: TypeId,
        params: Option<Vec<ParamInfo>>,
        asm: Option<String>,
        local: bool,
    ) -> Result<Option<(DeclId, Stmt)>> {
        let (name, loc) = match &d.name {
            Some(n) => n.clone(),
            None => return self.unexpected("identifier"),
        };
        if let Some((_, oloc)) = &d.owner {
            return Err(Error::syntax(oloc, "qualified name in declaration"));
        }

        if spec.storage == Storage::Typedef {
            if asm.is_some() {
                return Err(Error::syntax(&loc, "__asm on a typedef"));
            }
            if let Some(prior) = self.sess.symbols.lookup_local(self.scope, &name) {
                let pd = self.sess.symbols.decl(prior);
                if pd.kind == (DeclKind::Typedef { ty }) {
                    return Ok(None);
                }
                return Err(Error::redefinition(&loc, &name, &pd.loc.clone()));
            }
            self.sess.symbols.declare(Decl {
                name,
                kind: DeclKind::Typedef { ty },
                scope: self.scope,
                loc,
            });
            return Ok(None);
        }

        if self.sess.types.is_function(ty) {
            self.declare_function(spec, d, ty, params, asm)?;
            return Ok(None);
        }
        if self.sess.types.is_void(ty) {
            return Err(Error::semantic(&loc, format!("variable '{}' has type void", name)));
        }

        if let Some(label) = asm {
            self.check_redefinition(&name, &loc)?;
            self.sess.symbols.declare(Decl {
                name,
                kind: DeclKind::AsmLabel { ty, label },
                scope: self.scope,
                loc,
            });
            return Ok(None);
        }

        let is_static_storage = !local || matches!(spec.storage, Storage::Static | Storage::Extern);
        if is_static_storage {
            self.declare_static(spec, name, loc, ty, local)?;
            return Ok(None);
        }

        if let Some(sid) = self.array_struct_needing_init(ty) {
            let def = self.sess.types.struct_def(sid);
            return Err(Error::semantic(
                &loc,
                format!("arrays of '{}' need per-element construction; not supported", def.name),
            ));
        }
        self.check_redefinition(&name, &loc)?;
        let decl = self.sess.symbols.declare(Decl {
            name: name.clone(),
            kind: DeclKind::Variable {
                ty,
                storage: spec.storage,
                location: VarLocation::Local,
            },
            scope: self.scope,
            loc: loc.clone(),
        });
        let (ty, init) = self.local_initializer(ty, &loc)?;
        if let DeclKind::Variable { ty: dty, .. } = &mut self.sess.symbols.decl_mut(decl).kind {
            *dty = ty;
        }
        if self.sess.types.size_of(ty).is_none() {
            return Err(Error::semantic(
                &loc,
                format!("variable '{}' has incomplete type '{}'", name, self.sess.types.display(ty)),
            ));
        }
        if let Some(sid) = self.sess.types.as_struct(ty) {
            self.mark_struct_used(sid);
        }
        Ok(Some((
            decl,
            Stmt {
                kind: super::ast::StmtKind::Local { decl, init },
                scope: self.scope,
                loc,
            },
        )))
    }

    fn array_struct_needing_init(&self, ty: TypeId) -> Option<StructId> {
        let types = &self.sess.types;
        let mut t = ty;
        let mut is_array = false;
        while let Some(e) = types.element(t) {
            t = e;
            is_array = true;
        }
        let sid = types.as_struct(t)?;
        let def = types.struct_def(sid);
        (is_array && (def.needs_init || def.needs_term)).then_some(sid)
    }

    /// Globals, `static` and `extern` variables
    fn declare_static(
        &mut self,
        spec: &DeclSpec,
        name: String,
        loc: SourceLoc,
        ty: TypeId,
        local: bool,
    ) -> Result<()> {
        if let Some(sid) = self.array_struct_needing_init(ty) {
            let n = self.sess.types.struct_def(sid).name.clone();
            return Err(Error::semantic(
                &loc,
                format!("arrays of '{}' need per-element construction; not supported", n),
            ));
        }

        let prior = self.sess.symbols.lookup_local(self.scope, &name);
        let prior_label = match prior.map(|p| self.sess.symbols.decl(p).clone()) {
            Some(Decl {
                kind:
                    DeclKind::Variable {
                        ty: pty,
                        location: VarLocation::Global(label),
                        ..
                    },
                ..
            }) if self.compatible_redeclaration(pty, ty) => Some((prior, label)),
            Some(pd) => return Err(Error::redefinition(&loc, &name, &pd.loc)),
            None => None,
        };

        let has_init = self.peek_punct(Punct::Assign);
        if spec.storage == Storage::Extern {
            if has_init {
                return Err(Error::semantic(&loc, format!("extern '{}' has an initializer", name)));
            }
            if prior_label.is_none() {
                self.sess.symbols.declare(Decl {
                    name: name.clone(),
                    kind: DeclKind::Variable {
                        ty,
                        storage: Storage::Extern,
                        location: VarLocation::Global(name),
                    },
                    scope: self.scope,
                    loc,
                });
            }
            return Ok(());
        }

        let is_const = self.sess.types.is_const(ty)
            || self
                .sess
                .types
                .element(ty)
                .map(|e| self.sess.types.is_const(e))
                .unwrap_or(false);

        if spec.storage == Storage::Static && is_const && has_init && prior_label.is_none() {
            if self.sess.types.is_arith(ty) {
                self.next();
                let e = self.assignment_expr()?;
                let e = self.convert(e, ty)?;
                match super::fold::fold(&e, &self.sess.types, &self.sess.symbols) {
                    Some(value @ (Const::Int(_) | Const::Float(_))) => {
                        self.check_redefinition(&name, &loc)?;
                        self.sess.symbols.declare(Decl {
                            name,
                            kind: DeclKind::NumericConst { ty, value },
                            scope: self.scope,
                            loc,
                        });
                        return Ok(());
                    }
                    _ => return Err(Error::semantic(&e.loc, "initializer is not a constant")),
                }
            }
            let is_char_array = self
                .sess
                .types
                .element(ty)
                .map(|e| self.sess.types.size_of(e) == Some(1) && self.sess.types.is_integer(e))
                .unwrap_or(false);
            if is_char_array && matches!(self.tokens.peek_nth(1).kind, TokenKind::Str(_)) {
                self.next();
                let label = self.data_label();
                let (ty, words) = self.global_initializer(ty, &loc)?;
                let size = words.len() as u32;
                let mut item = DataItem::init(label.clone(), Section::Const, words, false);
                item.size = size;
                item.loc = Some(loc.clone());
                self.unit.data.push(item);
                self.sess.symbols.declare(Decl {
                    name,
                    kind: DeclKind::StringConst { ty, label },
                    scope: self.scope,
                    loc,
                });
                return Ok(());
            }
        }

        let (decl, label) = match prior_label {
            Some((Some(prior), label)) => (prior, label),
            _ => {
                let label = if local { self.data_label() } else { name.clone() };
                let decl = self.sess.symbols.declare(Decl {
                    name: name.clone(),
                    kind: DeclKind::Variable {
                        ty,
                        storage: spec.storage,
                        location: VarLocation::Global(label.clone()),
                    },
                    scope: self.scope,
                    loc: loc.clone(),
                });
                (decl, label)
            }
        };

        let exported = !local && spec.storage != Storage::Static;
        let existing = self.unit.data.iter().position(|d| d.label == label);
        if has_init {
            if let Some(i) = existing {
                if self.unit.data[i].section != Section::Bss {
                    let prior = self.sess.symbols.decl(decl).loc.clone();
                    return Err(Error::redefinition(&loc, &name, &prior));
                }
            }
            self.next();
            let (ty, words) = self.global_initializer(ty, &loc)?;
            if let DeclKind::Variable { ty: dty, .. } = &mut self.sess.symbols.decl_mut(decl).kind {
                *dty = ty;
            }
            let section = if is_const { Section::Const } else { Section::Data };
            let mut item = DataItem::init(label, section, words, exported);
            item.loc = Some(loc);
            match existing {
                Some(i) => self.unit.data[i] = item,
                None => self.unit.data.push(item),
            }
            return Ok(());
        }
        if existing.is_some() {
            return Ok(());
        }

        let size = match self.sess.types.size_of(ty) {
            Some(s) => s,
            None if !local && self.sess.types.is_array(ty) => {
                // Completed by a later definition or by the linker.
                return Ok(());
            }
            None => {
                return Err(Error::semantic(
                    &loc,
                    format!("variable '{}' has incomplete type '{}'", name, self.sess.types.display(ty)),
                ))
            }
        };
        let mut item = match self.sess.types.as_struct(ty) {
            Some(sid) if self.sess.types.struct_def(sid).needs_init => {
                let words = self.static_image(sid, &loc)?;
                let section = if is_const { Section::Const } else { Section::Data };
                DataItem::init(label, section, words, exported)
            }
            _ => DataItem::bss(label, size, exported),
        };
        item.loc = Some(loc);
        self.unit.data.push(item);
        Ok(())
    }

    fn compatible_redeclaration(&self, a: TypeId, b: TypeId) -> bool {
        if a == b {
            return true;
        }
        let t = &self.sess.types;
        match (t.element(a), t.element(b)) {
            (Some(ea), Some(eb)) => ea == eb,
            _ => false,
        }
    }

    /// Requests support code (init, term, vtables) for a struct and
    /// everything it embeds
    pub(super) fn mark_struct_used(&mut self, sid: StructId) {
        let def = self.sess.types.struct_def(sid);
        if def.used {
            return;
        }
        let nested: Vec<StructId> = def
            .bases
            .iter()
            .map(|b| b.sid)
            .chain(def.fields.iter().filter_map(|f| self.sess.types.as_struct(f.ty)))
            .collect();
        self.sess.types.struct_def_mut(sid).used = true;
        for n in nested {
            self.mark_struct_used(n);
        }
    }

    // ========================================================================
    // Function definitions
    // ========================================================================

    pub(super) fn function_body(
        &mut self,
        decl: DeclId,
        params: Vec<ParamInfo>,
        member: Option<StructId>,
        loc: SourceLoc,
    ) -> Result<()> {
        let d = self.sess.symbols.decl(decl).clone();
        let (fn_ty, label, exported) = match &d.kind {
            DeclKind::Function {
                ty,
                label,
                storage,
                defined,
                ..
            } => {
                if *defined {
                    return Err(Error::redefinition(&loc, &d.name, &d.loc));
                }
                (*ty, label.clone(), *storage != Storage::Static)
            }
            _ => return Err(Error::internal("function body for a non-function")),
        };
        let target = self.sess.symbols.decl_mut(decl);
        if let DeclKind::Function { defined, .. } = &mut target.kind {
            *defined = true;
        }
        target.loc = loc.clone();
        let ret = match self.sess.types.kind(fn_ty) {
            crate::types::Type::Function { ret, .. } => *ret,
            _ => return Err(Error::internal("function declaration without function type")),
        };
        if !self.sess.types.is_void(ret) && self.sess.types.size_of(ret).is_none() {
            return Err(Error::semantic(&loc, "function returns an incomplete type"));
        }

        let _span = tracing::debug_span!("function", label = %label).entered();
        let outer = self.scope;
        self.scope = member
            .and_then(|s| self.sess.types.struct_def(s).scope)
            .unwrap_or(ScopeId::GLOBAL);
        let param_scope = self.enter_scope(ScopeKind::Parameter);

        let result = self.function_params_and_body(decl, fn_ty, ret, params, member, param_scope, &label, exported, &loc);
        self.scope = outer;
        self.func = None;
        let def = result?;
        tracing::debug!(params = def.params.len(), tries = def.tries.len(), "parsed function");
        self.unit.functions.push(def);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn function_params_and_body(
        &mut self,
        decl: DeclId,
        fn_ty: TypeId,
        ret: TypeId,
        params: Vec<ParamInfo>,
        member: Option<StructId>,
        param_scope: ScopeId,
        label: &str,
        exported: bool,
        loc: &SourceLoc,
    ) -> Result<FunctionDef> {
        let hidden_ret = self.sess.types.returns_in_memory(ret);
        let mut offset = 0u32;
        let mut decls = Vec::new();
        if hidden_ret {
            let pty = self.sess.types.pointer_to(ret);
            decls.push(self.sess.symbols.declare_hidden(Decl {
                name: "__result".into(),
                kind: DeclKind::Variable {
                    ty: pty,
                    storage: Storage::None,
                    location: VarLocation::Param(offset),
                },
                scope: param_scope,
                loc: loc.clone(),
            }));
            offset += 1;
        }
        let this = match member {
            Some(sid) => {
                let sty = self.sess.types.struct_type(sid);
                let pty = self.sess.types.pointer_to(sty);
                let d = self.sess.symbols.declare(Decl {
                    name: "this".into(),
                    kind: DeclKind::Variable {
                        ty: pty,
                        storage: Storage::None,
                        location: VarLocation::Param(offset),
                    },
                    scope: param_scope,
                    loc: loc.clone(),
                });
                decls.push(d);
                offset += 1;
                Some((d, sid))
            }
            None => None,
        };
        for p in params {
            let name = match p.name {
                Some(n) => n,
                None => return Err(Error::syntax(&p.loc, "parameter name omitted")),
            };
            let size = match self.sess.types.size_of(p.ty) {
                Some(s) => s,
                None => {
                    return Err(Error::semantic(
                        &p.loc,
                        format!("parameter '{}' has incomplete type", name),
                    ))
                }
            };
            self.check_redefinition(&name, &p.loc)?;
            if let Some(sid) = self.sess.types.as_struct(p.ty) {
                self.mark_struct_used(sid);
            }
            decls.push(self.sess.symbols.declare(Decl {
                name,
                kind: DeclKind::Variable {
                    ty: p.ty,
                    storage: Storage::None,
                    location: VarLocation::Param(offset),
                },
                scope: param_scope,
                loc: p.loc,
            }));
            offset += size;
        }
        let _ = fn_ty;

        self.func = Some(FuncState::new(ret, this));
        let body = self.compound_statement()?;
        let state = self
            .func
            .take()
            .ok_or_else(|| Error::internal("function state lost"))?;

        for (name, scope, gloc) in &state.gotos {
            match state.labels.get(name) {
                None => {
                    return Err(Error::semantic(gloc, format!("label '{}' used but not defined", name)))
                }
                Some((lscope, _)) => {
                    if !self.sess.symbols.crossed_tries(*lscope, *scope).is_empty() {
                        return Err(Error::semantic(
                            gloc,
                            format!("goto '{}' jumps into a try block", name),
                        ));
                    }
                }
            }
        }

        Ok(FunctionDef {
            decl,
            label: label.to_string(),
            exported,
            ret,
            params: decls,
            hidden_ret,
            body,
            param_scope,
            tries: state.tries,
            cases: state.cases,
            loc: loc.clone(),
        })
    }
}
