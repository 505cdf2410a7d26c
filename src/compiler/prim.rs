//! Prim: the machine-independent flow-graph IR
//!
//! A function body is a [`List`] of [`Prim`] nodes. Values live in memory
//! (stack slots, parameters, globals) and every node reads its operands and
//! writes its result there; selection later loads operands into scratch
//! registers one node at a time.
//!
//! Each node reports the labels it references ([`Prim::targets`]) and
//! whether control can fall through to the next node
//! ([`Prim::falls_through`]); together these give the flow graph.

use super::list::List;
use crate::error::SourceLoc;
use crate::parser::BinaryOp;
use crate::types::{Type, TypeId, TypeTable};
use std::fmt;

/// Unit-wide local label (`L{n}`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Stack slot of the function being compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// A block of frame storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Size in words
    pub words: u32,
    /// Compiler temporary (candidate for forwarding and deletion)
    pub temp: bool,
}

/// Machine representation of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Repr {
    /// 8-bit integer kept normalized in a word
    Byte {
        /// Sign-extended rather than zero-extended
        signed: bool,
    },
    /// 16-bit integer or pointer
    Word {
        /// Signed
        signed: bool,
    },
    /// 32-bit integer, low word first
    Long {
        /// Signed
        signed: bool,
    },
    /// 32-bit float
    Float,
    /// 64-bit float
    Double,
    /// Struct or array of the given size
    Block(u32),
}

impl Repr {
    /// Representation of a type; void and functions map to a word
    pub fn of(types: &TypeTable, ty: TypeId) -> Repr {
        match types.kind(ty) {
            Type::Int { bits: 8, signed } => Repr::Byte { signed: *signed },
            Type::Int { bits: 32, signed } => Repr::Long { signed: *signed },
            Type::Int { signed, .. } => Repr::Word { signed: *signed },
            Type::Float { bits: 64 } => Repr::Double,
            Type::Float { .. } => Repr::Float,
            Type::Pointer(_) => Repr::Word { signed: false },
            Type::Struct(_) | Type::Array(..) => Repr::Block(types.size_of(ty).unwrap_or(0)),
            _ => Repr::Word { signed: true },
        }
    }

    /// Size in words
    pub fn words(self) -> u32 {
        match self {
            Repr::Byte { .. } | Repr::Word { .. } => 1,
            Repr::Long { .. } | Repr::Float => 2,
            Repr::Double => 4,
            Repr::Block(n) => n,
        }
    }

    /// Fits in one register
    pub fn is_word(self) -> bool {
        matches!(self, Repr::Byte { .. } | Repr::Word { .. })
    }

    /// Signed integer (floats count as signed)
    pub fn is_signed(self) -> bool {
        match self {
            Repr::Byte { signed } | Repr::Word { signed } | Repr::Long { signed } => signed,
            Repr::Float | Repr::Double => true,
            Repr::Block(_) => false,
        }
    }

    /// Floating point
    pub fn is_float(self) -> bool {
        matches!(self, Repr::Float | Repr::Double)
    }

    /// Suffix of the runtime helpers operating on this representation
    pub fn helper_suffix(self) -> &'static str {
        match self {
            Repr::Long { signed: true } => "l",
            Repr::Long { signed: false } => "ul",
            Repr::Float => "f",
            Repr::Double => "d",
            Repr::Byte { signed: true } | Repr::Word { signed: true } => "i",
            Repr::Byte { signed: false } | Repr::Word { signed: false } => "u",
            Repr::Block(_) => "b",
        }
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repr::Byte { signed: true } => write!(f, "b"),
            Repr::Byte { signed: false } => write!(f, "ub"),
            Repr::Word { signed: true } => write!(f, "w"),
            Repr::Word { signed: false } => write!(f, "uw"),
            Repr::Long { signed: true } => write!(f, "l"),
            Repr::Long { signed: false } => write!(f, "ul"),
            Repr::Float => write!(f, "f"),
            Repr::Double => write!(f, "d"),
            Repr::Block(n) => write!(f, "blk{}", n),
        }
    }
}

/// What an address is relative to
#[derive(Debug, Clone, PartialEq)]
pub enum Base {
    /// Stack slot
    Slot(SlotId),
    /// Incoming argument area
    Param,
    /// Assembly label
    Global(String),
}

/// A value consumed by a Prim
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Integer constant; wide values carry all their bits
    Imm(i64),
    /// Floating constant
    Float(f64),
    /// Address of a base plus a word offset
    Addr(Base, i32),
    /// Contents of a place
    Load(Box<Place>),
}

impl Operand {
    /// Contents of `place`
    pub fn load(place: Place) -> Operand {
        Operand::Load(Box::new(place))
    }

    /// Slots read by this operand, including through nested addresses
    pub fn slots(&self, out: &mut Vec<SlotId>) {
        match self {
            Operand::Addr(Base::Slot(s), _) => out.push(*s),
            Operand::Load(p) => p.slots(out),
            _ => {}
        }
    }

    /// Whether the operand takes the address of `slot`
    pub fn takes_address(&self, slot: SlotId) -> bool {
        match self {
            Operand::Addr(Base::Slot(s), _) => *s == slot,
            Operand::Load(p) => match p.as_ref() {
                Place::Indirect(op, _) => op.takes_address(slot),
                _ => false,
            },
            _ => false,
        }
    }

    /// Constant value, if any
    pub fn as_imm(&self) -> Option<i64> {
        match self {
            Operand::Imm(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Imm(v) => write!(f, "#{}", v),
            Operand::Float(v) => write!(f, "#{:?}", v),
            Operand::Addr(base, off) => {
                match base {
                    Base::Slot(s) => write!(f, "&{}", s)?,
                    Base::Param => write!(f, "&param")?,
                    Base::Global(l) => write!(f, "&{}", l)?,
                }
                if *off != 0 {
                    write!(f, "{:+}", off)?;
                }
                Ok(())
            }
            Operand::Load(p) => write!(f, "{}", p),
        }
    }
}

/// A memory location written or read by a Prim
#[derive(Debug, Clone, PartialEq)]
pub enum Place {
    /// Word offset into a stack slot
    Slot(SlotId, i32),
    /// Word offset into the incoming argument area
    Param(i32),
    /// Word offset from an assembly label
    Global(String, i32),
    /// Outgoing argument word
    Arg(u32),
    /// Memory at an address plus a word offset
    Indirect(Box<Operand>, i32),
}

impl Place {
    /// The same place moved by `words`
    pub fn offset(&self, words: i32) -> Place {
        match self {
            Place::Slot(s, off) => Place::Slot(*s, off + words),
            Place::Param(off) => Place::Param(off + words),
            Place::Global(l, off) => Place::Global(l.clone(), off + words),
            Place::Arg(i) => Place::Arg((*i as i32 + words) as u32),
            Place::Indirect(op, off) => Place::Indirect(op.clone(), off + words),
        }
    }

    /// Address of the place, if it has a static form
    pub fn address(&self) -> Option<Operand> {
        match self {
            Place::Slot(s, off) => Some(Operand::Addr(Base::Slot(*s), *off)),
            Place::Param(off) => Some(Operand::Addr(Base::Param, *off)),
            Place::Global(l, off) => Some(Operand::Addr(Base::Global(l.clone()), *off)),
            Place::Indirect(op, 0) => Some(op.as_ref().clone()),
            Place::Arg(_) | Place::Indirect(..) => None,
        }
    }

    /// Slots read when this place is used as a source
    pub fn slots(&self, out: &mut Vec<SlotId>) {
        match self {
            Place::Slot(s, _) => out.push(*s),
            Place::Indirect(op, _) => op.slots(out),
            _ => {}
        }
    }

    /// Slots read while computing the address of this place
    pub fn address_slots(&self, out: &mut Vec<SlotId>) {
        if let Place::Indirect(op, _) = self {
            op.slots(out);
        }
    }

    /// The slot written directly, if any
    pub fn slot(&self) -> Option<SlotId> {
        match self {
            Place::Slot(s, _) => Some(*s),
            _ => None,
        }
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, off) = match self {
            Place::Slot(s, off) => (s.to_string(), *off),
            Place::Param(off) => ("param".to_string(), *off),
            Place::Global(l, off) => (l.clone(), *off),
            Place::Arg(i) => return write!(f, "arg{}", i),
            Place::Indirect(op, off) => return write!(f, "[{}{:+}]", op, off),
        };
        if off == 0 {
            write!(f, "{}", name)
        } else {
            write!(f, "{}{:+}", name, off)
        }
    }
}

/// Branch conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl Cond {
    /// Condition of a comparison operator
    pub fn from_op(op: BinaryOp) -> Option<Cond> {
        Some(match op {
            BinaryOp::Eq => Cond::Eq,
            BinaryOp::Ne => Cond::Ne,
            BinaryOp::Lt => Cond::Lt,
            BinaryOp::Ge => Cond::Ge,
            BinaryOp::Gt => Cond::Gt,
            BinaryOp::Le => Cond::Le,
            _ => return None,
        })
    }

    /// True exactly when `self` is false
    pub fn negate(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
        }
    }

    /// The condition with its operands exchanged
    pub fn swap(self) -> Cond {
        match self {
            Cond::Lt => Cond::Gt,
            Cond::Gt => Cond::Lt,
            Cond::Le => Cond::Ge,
            Cond::Ge => Cond::Le,
            other => other,
        }
    }

    /// Mnemonic stem
    pub fn as_str(self) -> &'static str {
        match self {
            Cond::Eq => "eq",
            Cond::Ne => "ne",
            Cond::Lt => "lt",
            Cond::Ge => "ge",
            Cond::Gt => "gt",
            Cond::Le => "le",
        }
    }
}

/// Value-computing unary operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    /// Two's complement or float negation
    Neg,
    /// Bitwise complement
    Not,
}

/// Call destination
#[derive(Debug, Clone, PartialEq)]
pub enum CallTarget {
    /// Label (function, method or runtime helper)
    Direct(String),
    /// Address computed at run time
    Indirect(Operand),
}

/// One IR node
#[derive(Debug, Clone, PartialEq)]
pub enum Prim {
    /// Function entry; always first
    Entry,
    /// Jump target
    Label(LabelId),
    /// Unconditional jump
    Jump(LabelId),
    /// Branch to `target` when `lhs cond rhs`
    Compare {
        /// Condition
        cond: Cond,
        /// Operand representation
        repr: Repr,
        /// Left operand
        lhs: Operand,
        /// Right operand
        rhs: Operand,
        /// Taken target
        target: LabelId,
    },
    /// Branch to `target` when `value` is (non)zero
    Test {
        /// Branch on nonzero rather than zero
        nonzero: bool,
        /// Operand representation
        repr: Repr,
        /// Tested value
        value: Operand,
        /// Taken target
        target: LabelId,
    },
    /// Reserve outgoing argument words
    CallStart(u32),
    /// Call; releases the argument words and stores the register result
    Call {
        /// Destination
        target: CallTarget,
        /// Argument words reserved by the matching `CallStart`
        words: u32,
        /// Where the value returned in registers goes
        result: Option<(Place, Repr)>,
    },
    /// Conversion between representations
    Cast {
        /// Destination
        dst: Place,
        /// Destination representation
        to: Repr,
        /// Source
        src: Operand,
        /// Source representation
        from: Repr,
    },
    /// `dst = op src`
    Unary {
        /// Operation
        op: UnOp,
        /// Representation
        repr: Repr,
        /// Destination
        dst: Place,
        /// Source
        src: Operand,
    },
    /// `dst = lhs op rhs`
    Binary {
        /// Arithmetic or bitwise operator (never a comparison)
        op: BinaryOp,
        /// Representation of the result and the left operand
        repr: Repr,
        /// Destination
        dst: Place,
        /// Left operand
        lhs: Operand,
        /// Right operand (a word for shifts)
        rhs: Operand,
    },
    /// `dst = src`; for blocks `src` is the source address and `#0` clears
    Assign {
        /// Representation
        repr: Repr,
        /// Destination
        dst: Place,
        /// Source
        src: Operand,
    },
    /// Return, with the value passed in registers
    Return(Option<(Operand, Repr)>),
    /// Raise a one-word exception value
    Throw(Operand),
    /// Push an exception frame record
    TryBegin {
        /// Three-word record slot
        record: SlotId,
        /// Handler entry
        handler: LabelId,
    },
    /// Pop the exception frame record
    TryEnd {
        /// Record slot
        record: SlotId,
    },
    /// Start of a finally subroutine
    FinallyEntry {
        /// Entry label
        label: LabelId,
        /// Slot holding the return address
        link: SlotId,
    },
    /// Run a finally subroutine, continuing at `resume`
    FinallyCall {
        /// Finally entry
        entry: LabelId,
        /// Return address slot
        link: SlotId,
        /// Label following this call
        resume: LabelId,
    },
    /// Return from a finally subroutine to one of its callers
    FinallyReturn {
        /// Return address slot
        link: SlotId,
        /// Every resume label of the subroutine
        resumes: Vec<LabelId>,
    },
    /// Exception handler entry; the value arrives in the first register
    CatchEntry {
        /// Handler label
        label: LabelId,
        /// Where the value is stored
        dst: Option<Place>,
    },
}

impl Prim {
    /// Labels referenced by the node
    pub fn targets(&self) -> Vec<LabelId> {
        match self {
            Prim::Jump(l) => vec![*l],
            Prim::Compare { target, .. } | Prim::Test { target, .. } => vec![*target],
            Prim::TryBegin { handler, .. } => vec![*handler],
            Prim::FinallyCall { entry, resume, .. } => vec![*entry, *resume],
            Prim::FinallyReturn { resumes, .. } => resumes.clone(),
            _ => Vec::new(),
        }
    }

    /// Mutable references to the labels the node references
    pub fn targets_mut(&mut self) -> Vec<&mut LabelId> {
        match self {
            Prim::Jump(l) => vec![l],
            Prim::Compare { target, .. } | Prim::Test { target, .. } => vec![target],
            Prim::TryBegin { handler, .. } => vec![handler],
            Prim::FinallyCall { entry, resume, .. } => vec![entry, resume],
            Prim::FinallyReturn { resumes, .. } => resumes.iter_mut().collect(),
            _ => Vec::new(),
        }
    }

    /// Control transfers other than fallthrough
    pub fn successors(&self) -> Vec<LabelId> {
        match self {
            Prim::FinallyCall { entry, .. } => vec![*entry],
            Prim::TryBegin { .. } => Vec::new(),
            other => other.targets(),
        }
    }

    /// Whether control can continue with the next node
    pub fn falls_through(&self) -> bool {
        !matches!(
            self,
            Prim::Jump(_)
                | Prim::Return(_)
                | Prim::Throw(_)
                | Prim::FinallyCall { .. }
                | Prim::FinallyReturn { .. }
        )
    }

    /// Label defined by the node
    pub fn defined_label(&self) -> Option<LabelId> {
        match self {
            Prim::Label(l) => Some(*l),
            Prim::CatchEntry { label, .. } | Prim::FinallyEntry { label, .. } => Some(*label),
            _ => None,
        }
    }

    /// Place written with a computed value
    pub fn dst(&self) -> Option<&Place> {
        match self {
            Prim::Cast { dst, .. }
            | Prim::Unary { dst, .. }
            | Prim::Binary { dst, .. }
            | Prim::Assign { dst, .. } => Some(dst),
            Prim::Call {
                result: Some((dst, _)),
                ..
            } => Some(dst),
            Prim::CatchEntry { dst: Some(dst), .. } => Some(dst),
            _ => None,
        }
    }

    /// Mutable destination
    pub fn dst_mut(&mut self) -> Option<&mut Place> {
        match self {
            Prim::Cast { dst, .. }
            | Prim::Unary { dst, .. }
            | Prim::Binary { dst, .. }
            | Prim::Assign { dst, .. } => Some(dst),
            Prim::Call {
                result: Some((dst, _)),
                ..
            } => Some(dst),
            Prim::CatchEntry { dst: Some(dst), .. } => Some(dst),
            _ => None,
        }
    }

    /// Representation of the stored result
    pub fn dst_repr(&self) -> Option<Repr> {
        match self {
            Prim::Cast { to, .. } => Some(*to),
            Prim::Unary { repr, .. } | Prim::Binary { repr, .. } | Prim::Assign { repr, .. } => {
                Some(*repr)
            }
            Prim::Call {
                result: Some((_, repr)),
                ..
            } => Some(*repr),
            Prim::CatchEntry { dst: Some(_), .. } => Some(Repr::Word { signed: true }),
            _ => None,
        }
    }

    /// Operands read by the node
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Prim::Compare { lhs, rhs, .. } | Prim::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Prim::Test { value, .. } | Prim::Throw(value) => vec![value],
            Prim::Call {
                target: CallTarget::Indirect(op),
                ..
            } => vec![op],
            Prim::Cast { src, .. } | Prim::Unary { src, .. } | Prim::Assign { src, .. } => vec![src],
            Prim::Return(Some((op, _))) => vec![op],
            _ => Vec::new(),
        }
    }

    /// Slots the node reads, including slots used to form the destination
    /// address and the fixed slots of exception records
    pub fn read_slots(&self) -> Vec<SlotId> {
        let mut out = Vec::new();
        for op in self.operands() {
            op.slots(&mut out);
        }
        if let Some(dst) = self.dst() {
            dst.address_slots(&mut out);
        }
        match self {
            Prim::TryBegin { record, .. } | Prim::TryEnd { record } => out.push(*record),
            Prim::FinallyEntry { link, .. }
            | Prim::FinallyCall { link, .. }
            | Prim::FinallyReturn { link, .. } => out.push(*link),
            _ => {}
        }
        out
    }

    /// Whether removing the node when its result is unused keeps behavior
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            Prim::Cast { .. } | Prim::Unary { .. } | Prim::Binary { .. } | Prim::Assign { .. }
        )
    }

    /// Inverts a conditional branch
    pub fn invert(&mut self) {
        match self {
            Prim::Compare { cond, .. } => *cond = cond.negate(),
            Prim::Test { nonzero, .. } => *nonzero = !*nonzero,
            _ => {}
        }
    }

    /// Whether the node is a conditional branch
    pub fn is_branch(&self) -> bool {
        matches!(self, Prim::Compare { .. } | Prim::Test { .. })
    }
}

impl fmt::Display for Prim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prim::Entry => write!(f, "    entry"),
            Prim::Label(l) => write!(f, "{}:", l),
            Prim::Jump(l) => write!(f, "    jump {}", l),
            Prim::Compare {
                cond,
                repr,
                lhs,
                rhs,
                target,
            } => write!(f, "    if {}.{} {}, {} goto {}", cond.as_str(), repr, lhs, rhs, target),
            Prim::Test {
                nonzero,
                repr,
                value,
                target,
            } => {
                let op = if *nonzero { "nz" } else { "z" };
                write!(f, "    if {}.{} {} goto {}", op, repr, value, target)
            }
            Prim::CallStart(n) => write!(f, "    callstart {}", n),
            Prim::Call {
                target,
                words,
                result,
            } => {
                write!(f, "    ")?;
                if let Some((place, repr)) = result {
                    write!(f, "{}.{} = ", place, repr)?;
                }
                match target {
                    CallTarget::Direct(l) => write!(f, "call {}", l)?,
                    CallTarget::Indirect(op) => write!(f, "call *{}", op)?,
                }
                write!(f, " ({})", words)
            }
            Prim::Cast { dst, to, src, from } => write!(f, "    {}.{} = ({}) {}.{}", dst, to, to, src, from),
            Prim::Unary { op, repr, dst, src } => {
                let name = match op {
                    UnOp::Neg => "neg",
                    UnOp::Not => "not",
                };
                write!(f, "    {}.{} = {} {}", dst, repr, name, src)
            }
            Prim::Binary {
                op,
                repr,
                dst,
                lhs,
                rhs,
            } => write!(f, "    {}.{} = {} {} {}", dst, repr, lhs, op.as_str(), rhs),
            Prim::Assign { repr, dst, src } => write!(f, "    {}.{} = {}", dst, repr, src),
            Prim::Return(None) => write!(f, "    return"),
            Prim::Return(Some((op, repr))) => write!(f, "    return {}.{}", op, repr),
            Prim::Throw(op) => write!(f, "    throw {}", op),
            Prim::TryBegin { record, handler } => write!(f, "    try {} -> {}", record, handler),
            Prim::TryEnd { record } => write!(f, "    endtry {}", record),
            Prim::FinallyEntry { label, link } => write!(f, "{}: finally {}", label, link),
            Prim::FinallyCall { entry, link, resume } => {
                write!(f, "    callfinally {} via {} resume {}", entry, link, resume)
            }
            Prim::FinallyReturn { link, resumes } => {
                let names: Vec<String> = resumes.iter().map(|l| l.to_string()).collect();
                write!(f, "    retfinally {} [{}]", link, names.join(", "))
            }
            Prim::CatchEntry { label, dst } => match dst {
                Some(d) => write!(f, "{}: catch -> {}", label, d),
                None => write!(f, "{}: catch", label),
            },
        }
    }
}

/// A lowered function
#[derive(Debug, Clone)]
pub struct PrimFunc {
    /// Assembly label
    pub label: String,
    /// Emit `.global`
    pub exported: bool,
    /// Body
    pub prims: List<Prim>,
    /// Frame slots
    pub slots: Vec<Slot>,
    /// Definition site
    pub loc: SourceLoc,
}

impl PrimFunc {
    /// Creates an empty function
    pub fn new(label: impl Into<String>, exported: bool, loc: SourceLoc) -> Self {
        PrimFunc {
            label: label.into(),
            exported,
            prims: List::new(),
            slots: Vec::new(),
            loc,
        }
    }

    /// Adds a slot
    pub fn new_slot(&mut self, words: u32, temp: bool) -> SlotId {
        let id = SlotId(self.slots.len() as u32);
        self.slots.push(Slot {
            words: words.max(1),
            temp,
        });
        id
    }

    /// Whether a slot is a compiler temporary
    pub fn is_temp(&self, slot: SlotId) -> bool {
        self.slots
            .get(slot.0 as usize)
            .map(|s| s.temp)
            .unwrap_or(false)
    }
}

impl fmt::Display for PrimFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.label)?;
        for (_, prim) in self.prims.iter() {
            writeln!(f, "{}", prim)?;
        }
        Ok(())
    }
}
