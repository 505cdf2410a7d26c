//! Typed syntax trees produced by the parser
//!
//! Every expression carries its type and the source location of the token
//! that introduced it; every statement carries its scope.

use super::decl::DeclId;
use super::scope::{ScopeId, TryId};
use crate::compiler::data::DataItem;
use crate::error::SourceLoc;
use crate::types::{StructId, TypeId};

/// Unary operators that compute a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `~x`
    BitNot,
    /// `!x`
    LogNot,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    /// Comparison operators yield `int`
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    /// The comparison that is true exactly when this one is false
    pub fn negate(self) -> BinaryOp {
        match self {
            BinaryOp::Eq => BinaryOp::Ne,
            BinaryOp::Ne => BinaryOp::Eq,
            BinaryOp::Lt => BinaryOp::Ge,
            BinaryOp::Ge => BinaryOp::Lt,
            BinaryOp::Gt => BinaryOp::Le,
            BinaryOp::Le => BinaryOp::Gt,
            other => other,
        }
    }

    /// Source spelling
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
        }
    }
}

/// What a call invokes
#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    /// Known label
    Direct(String),
    /// Function pointer value
    Indirect(Box<Expr>),
    /// Vtable slot; `receiver` points at the subobject holding the vptr and
    /// is passed as `this`
    Virtual {
        /// Pointer to the vptr-owning subobject
        receiver: Box<Expr>,
        /// Slot index
        slot: u32,
    },
}

/// Expression node
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    /// Node kind
    pub kind: ExprKind,
    /// Result type
    pub ty: TypeId,
    /// Source location
    pub loc: SourceLoc,
}

/// Expression kinds
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Integer constant
    Int(i64),
    /// Floating constant
    Float(f64),
    /// Address of an assembly label (function, string, vtable, asm label)
    Symbol(String),
    /// Variable reference
    Var(DeclId),
    /// Value-computing unary operator
    Unary(UnaryOp, Box<Expr>),
    /// `*p`
    Deref(Box<Expr>),
    /// `&lvalue`, also used for array decay
    AddrOf(Box<Expr>),
    /// `++`/`--`, prefix or postfix; `step` is already scaled for pointers
    IncDec {
        /// Prefix form
        pre: bool,
        /// Increment rather than decrement
        inc: bool,
        /// Lvalue operand
        operand: Box<Expr>,
        /// Amount added or subtracted
        step: i64,
    },
    /// Binary operator over operands already converted to a common type
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// `&&` or `||`
    Logical {
        /// `&&` rather than `||`
        and: bool,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
    /// `lhs = rhs`, right side already converted
    Assign(Box<Expr>, Box<Expr>),
    /// `lhs op= rhs`, computed in `op_ty`
    CompoundAssign {
        /// Operator
        op: BinaryOp,
        /// Lvalue
        lhs: Box<Expr>,
        /// Right side, converted to `op_ty`
        rhs: Box<Expr>,
        /// Type the operation is performed in
        op_ty: TypeId,
    },
    /// Function call
    Call {
        /// Target
        callee: Callee,
        /// Arguments after conversion, `this` first for methods
        args: Vec<Expr>,
    },
    /// Member at a word offset of a struct-typed base
    Member {
        /// Struct-valued expression
        base: Box<Expr>,
        /// Word offset
        offset: u32,
    },
    /// Conversion to the node's type
    Cast(Box<Expr>),
    /// Pointer plus a word offset (derived to base); null stays null when
    /// `null_check` is set
    BaseAdjust {
        /// Pointer operand
        operand: Box<Expr>,
        /// Offset in words
        offset: i32,
        /// Preserve null
        null_check: bool,
    },
    /// `c ? a : b`
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    /// `a, b`
    Comma(Box<Expr>, Box<Expr>),
    /// `({ ... })`; value of the last expression statement
    StmtExpr(Box<Stmt>),
}

impl Expr {
    /// Creates a node
    pub fn new(kind: ExprKind, ty: TypeId, loc: SourceLoc) -> Self {
        Expr { kind, ty, loc }
    }

    /// Integer constant of type `int`
    pub fn int(value: i64, loc: SourceLoc) -> Self {
        Expr::new(ExprKind::Int(value), TypeId::INT, loc)
    }

    /// Whether the node designates an object
    pub fn is_lvalue(&self) -> bool {
        match &self.kind {
            ExprKind::Var(_) | ExprKind::Deref(_) => true,
            ExprKind::Member { base, .. } => base.is_lvalue(),
            _ => false,
        }
    }
}

/// Statement node
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    /// Node kind
    pub kind: StmtKind,
    /// Scope the statement belongs to
    pub scope: ScopeId,
    /// Source location
    pub loc: SourceLoc,
}

/// Statement kinds
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `{ ... }`
    Block(Vec<Stmt>),
    /// Expression statement
    Expr(Expr),
    /// `if`
    If {
        /// Condition
        cond: Expr,
        /// Taken branch
        then: Box<Stmt>,
        /// `else` branch
        otherwise: Option<Box<Stmt>>,
    },
    /// `while`
    While {
        /// Condition
        cond: Expr,
        /// Body
        body: Box<Stmt>,
    },
    /// `do ... while`
    DoWhile {
        /// Body
        body: Box<Stmt>,
        /// Condition
        cond: Expr,
    },
    /// `for`
    For {
        /// Initialization clause
        init: Option<Box<Stmt>>,
        /// Condition; absent means forever
        cond: Option<Expr>,
        /// Step expression
        step: Option<Expr>,
        /// Body
        body: Box<Stmt>,
    },
    /// `switch`; case markers in the body refer to `cases` by index
    Switch {
        /// Controlling value
        value: Expr,
        /// Body
        body: Box<Stmt>,
        /// Case values and their marker indices
        cases: Vec<(i64, usize)>,
        /// Marker index of `default`
        default: Option<usize>,
    },
    /// `case`/`default` marker
    Case(usize),
    /// `break`
    Break,
    /// `continue`
    Continue,
    /// `goto label`
    Goto(String),
    /// `label: stmt`
    Label(String, Box<Stmt>),
    /// `return`
    Return(Option<Expr>),
    /// Local variable definition
    Local {
        /// Variable
        decl: DeclId,
        /// Initialization
        init: LocalInit,
    },
    /// `try`/`catch`/`finally`
    Try {
        /// Try id within the function
        id: TryId,
        /// Protected body
        body: Box<Stmt>,
        /// Handler
        catch: Option<Catch>,
        /// Cleanup run on every exit
        finally: Option<Box<Stmt>>,
    },
    /// `throw expr;` or rethrow
    Throw(Expr),
    /// `;`
    Empty,
}

/// A catch clause
#[derive(Debug, Clone, PartialEq)]
pub struct Catch {
    /// Variable receiving the thrown value
    pub var: DeclId,
    /// Handler body
    pub body: Box<Stmt>,
}

/// How a local variable starts out
#[derive(Debug, Clone, PartialEq)]
pub enum LocalInit {
    /// Left uninitialized
    None,
    /// Scalar or struct copy
    Expr(Expr),
    /// Call the struct's synthesized init
    Construct(StructId),
    /// Zero-fill, then vtable pointers, member constructions and items
    Aggregate {
        /// `(offset, label)` vtable pointer stores
        vptrs: Vec<(u32, String)>,
        /// `(offset, struct)` members constructed by their init
        constructs: Vec<(u32, StructId)>,
        /// `(offset, value)` assignments, values converted to member types
        items: Vec<(u32, Expr)>,
    },
}

/// Per-try facts recorded while parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryInfo {
    /// A `finally` clause exists
    pub has_finally: bool,
}

/// A parsed function definition
#[derive(Debug, Clone)]
pub struct FunctionDef {
    /// Declaration
    pub decl: DeclId,
    /// Assembly label
    pub label: String,
    /// Visible to the linker
    pub exported: bool,
    /// Return type
    pub ret: TypeId,
    /// Parameters in order, `this` first for methods
    pub params: Vec<DeclId>,
    /// Result returned through a hidden pointer argument
    pub hidden_ret: bool,
    /// Body
    pub body: Stmt,
    /// Parameter scope
    pub param_scope: ScopeId,
    /// Try statements by id
    pub tries: Vec<TryInfo>,
    /// Number of case markers
    pub cases: usize,
    /// Definition site
    pub loc: SourceLoc,
}

/// Everything parsed from one source file
#[derive(Debug, Default)]
pub struct Unit {
    /// Function definitions in source order
    pub functions: Vec<FunctionDef>,
    /// Static data: globals, string literals, named constants
    pub data: Vec<DataItem>,
}
