//! AST types for the Tabula scripting language.
//!
//! Tabula is dynamically typed with tables as the only compound value, so
//! the tree is small: statements, expressions, table literals and function
//! literals. Every node carries the source line it started on; the compiler
//! forwards those lines into the chunk's position table.

use std::fmt;

/// A source position, as reported by the external parser.
///
/// The VM's position table is line-granular, so a line number is all the
/// compiler needs to carry through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: u32,
}

impl Position {
    pub fn new(line: u32) -> Self {
        Self { line }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}", self.line)
    }
}

/// A named reference or binding site.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub pos: Position,
}

impl Ident {
    pub fn new(name: impl Into<String>, line: u32) -> Self {
        Self { name: name.into(), pos: Position::new(line) }
    }
}

/// A complete compilation unit (one source file or one eval string).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub body: Vec<Stmt>,
}

impl Program {
    pub fn new(body: Vec<Stmt>) -> Self {
        Self { body }
    }
}

/// Statements.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `var name = expr` / `const name = expr`
    Var {
        name: Ident,
        init: Expr,
        mutable: bool,
    },
    /// `target = expr` or `target[i][j] = expr`
    Assign {
        target: AssignTarget,
        value: Expr,
        pos: Position,
    },
    /// Expression evaluated for effect; result is discarded.
    Expr(Expr),
    /// `if cond { ... } else { ... }` — the else branch may be empty.
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
        pos: Position,
    },
    /// `while cond { ... }`
    While {
        cond: Expr,
        body: Vec<Stmt>,
        pos: Position,
    },
    /// `return expr` / bare `return`
    Return {
        value: Option<Expr>,
        pos: Position,
    },
    /// A bare block, opening a fresh lexical scope.
    Block(Vec<Stmt>, Position),
    /// `function name(params) { ... }` — a named declaration binding into
    /// the enclosing scope (global at top level, local otherwise).
    Function(FnDecl),
}

/// Assignment left-hand sides.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    /// Plain variable.
    Name(Ident),
    /// Indexed slot, possibly several levels deep: `t["a"][0] = v`.
    Index { target: Expr, indexes: Vec<Expr> },
}

/// A named function declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    pub name: Ident,
    pub params: Vec<Ident>,
    pub body: Vec<Stmt>,
    pub pos: Position,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
        };
        f.write_str(s)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    /// Arithmetic negation, numeric operands only.
    Neg,
    /// Boolean negation.
    Not,
}

/// Expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null(Position),
    Bool(bool, Position),
    Int(i64, Position),
    Float(f64, Position),
    Char(char, Position),
    Str(String, Position),
    /// Variable reference; resolved by the compiler to a local, upvalue or
    /// global load.
    Name(Ident),
    Unary {
        op: UnOp,
        operand: Box<Expr>,
        pos: Position,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        pos: Position,
    },
    /// `callee(args...)`
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        pos: Position,
    },
    /// Chained indexed read: `t[i][j]...` in one node.
    Index {
        target: Box<Expr>,
        indexes: Vec<Expr>,
        pos: Position,
    },
    /// Method-style call `recv.name(args...)`: looks `name` up on the
    /// receiver and passes the receiver as the implicit first argument.
    Method {
        recv: Box<Expr>,
        name: String,
        args: Vec<Expr>,
        pos: Position,
    },
    /// Table literal `[...]`.
    Table {
        entries: Vec<TableEntry>,
        pos: Position,
    },
    /// Anonymous function literal.
    Function {
        params: Vec<Ident>,
        body: Vec<Stmt>,
        pos: Position,
    },
}

impl Expr {
    /// The source position this expression starts at.
    pub fn pos(&self) -> Position {
        match self {
            Expr::Null(p)
            | Expr::Bool(_, p)
            | Expr::Int(_, p)
            | Expr::Float(_, p)
            | Expr::Char(_, p)
            | Expr::Str(_, p)
            | Expr::Table { pos: p, .. }
            | Expr::Function { pos: p, .. }
            | Expr::Unary { pos: p, .. }
            | Expr::Binary { pos: p, .. }
            | Expr::Call { pos: p, .. }
            | Expr::Index { pos: p, .. }
            | Expr::Method { pos: p, .. } => *p,
            Expr::Name(id) => id.pos,
        }
    }
}

/// One entry of a table literal.
///
/// Bare items take the next free dense index; keyed entries whose key is an
/// integer literal matching the running dense counter are folded into the
/// dense part by the compiler, everything else lands in the associative map.
#[derive(Debug, Clone, PartialEq)]
pub enum TableEntry {
    Item(Expr),
    Pair { key: Expr, value: Expr },
}

impl Stmt {
    /// The source position this statement starts at.
    pub fn pos(&self) -> Position {
        match self {
            Stmt::Var { name, .. } => name.pos,
            Stmt::Assign { pos, .. }
            | Stmt::If { pos, .. }
            | Stmt::While { pos, .. }
            | Stmt::Return { pos, .. }
            | Stmt::Block(_, pos) => *pos,
            Stmt::Expr(e) => e.pos(),
            Stmt::Function(decl) => decl.pos,
        }
    }
}
