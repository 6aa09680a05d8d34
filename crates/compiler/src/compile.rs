//! AST to bytecode compiler.
//!
//! Single pass over the tree: names resolve against a scope stack as code
//! is emitted, function bodies are compiled inline and sliced back out of
//! the instruction stream, and literals are interned into the unit's
//! shared constant pool.
//!
//! Diagnostics accumulate in a list; the first error stops code
//! generation at the next statement boundary (so one bad expression can
//! still report every name it fails to resolve), and no chunk is produced
//! once the list is non-empty.

use std::fmt;

use tabula_syntax::ast::{
    AssignTarget, BinOp, Expr, FnDecl, Ident, Position, Program, Stmt, TableEntry, UnOp,
};
use tabula_vm::chunk::{Chunk, Instruction};
use tabula_vm::value::{FunctionValue, Unit, UpvalueDesc};

/// Compilation errors with source location information.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    #[error("unknown variable `{name}`")]
    UnknownVariable { name: String, pos: Position },

    #[error("`{name}` is declared twice in the same scope")]
    DuplicateLocal { name: String, pos: Position },

    #[error("global `{name}` is already defined")]
    DuplicateGlobal { name: String, pos: Position },

    #[error("cannot assign to constant `{name}`")]
    AssignToConst { name: String, pos: Position },

    #[error("`return` outside a function body")]
    ReturnOutsideFunction { pos: Position },

    #[error("too many {what} (limit {limit})")]
    LimitExceeded {
        what: &'static str,
        limit: usize,
        pos: Position,
    },
}

impl CompileError {
    pub fn pos(&self) -> Position {
        match self {
            CompileError::UnknownVariable { pos, .. }
            | CompileError::DuplicateLocal { pos, .. }
            | CompileError::DuplicateGlobal { pos, .. }
            | CompileError::AssignToConst { pos, .. }
            | CompileError::ReturnOutsideFunction { pos }
            | CompileError::LimitExceeded { pos, .. } => *pos,
        }
    }
}

/// Everything collected before the compiler aborted. No chunk exists when
/// this is returned.
#[derive(Debug, Clone)]
pub struct CompileFailure {
    pub diagnostics: Vec<CompileError>,
}

impl fmt::Display for CompileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, diag) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}: {diag}", diag.pos())?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileFailure {}

/// A successfully compiled unit: the chunk plus the global names assigned
/// during compilation, prelude entries first.
#[derive(Debug)]
pub struct CompiledUnit {
    pub chunk: Chunk,
    pub global_names: Vec<String>,
}

/// Compile a program against a prelude of pre-registered global names.
///
/// The same names, in the same order, must be registered on the VM that
/// runs the chunk; global operands are indices into that shared ordering.
/// A trailing expression statement becomes the program result (and a
/// module's exported value); otherwise the program results in null.
pub fn compile(program: &Program, prelude: &[String]) -> Result<CompiledUnit, CompileFailure> {
    let mut compiler = Compiler::new(prelude);
    let last_line = program.body.last().map(|s| s.pos().line).unwrap_or(1);

    let (body, tail) = match program.body.split_last() {
        Some((Stmt::Expr(expr), rest)) => (rest, Some(expr)),
        _ => (&program.body[..], None),
    };
    compiler.compile_body(body);
    if compiler.diagnostics.is_empty() {
        match tail {
            Some(expr) => compiler.compile_expr(expr),
            None => {
                compiler.chunk.emit(Instruction::LoadNull, last_line);
            }
        }
    }
    compiler.chunk.emit(Instruction::Exit, last_line);

    if compiler.diagnostics.is_empty() {
        Ok(CompiledUnit {
            chunk: compiler.chunk,
            global_names: compiler.globals.into_iter().map(|g| g.name).collect(),
        })
    } else {
        Err(CompileFailure {
            diagnostics: compiler.diagnostics,
        })
    }
}

struct GlobalBinding {
    name: String,
    mutable: bool,
}

struct LocalBinding {
    name: String,
    mutable: bool,
}

/// One lexical scope inside a function; maps to one environment frame at
/// runtime.
#[derive(Default)]
struct Scope {
    bindings: Vec<LocalBinding>,
    /// Some closure compiled inside this scope captured one of its slots,
    /// so the scope must close with upvalue capture.
    captured: bool,
}

struct UpvalueBinding {
    name: String,
    mutable: bool,
    desc: UpvalueDesc,
}

/// Per-function compilation state. `ctxs[0]` is the top level, whose base
/// "scope" is the global table rather than an environment frame.
struct FunctionCtx {
    scopes: Vec<Scope>,
    upvalues: Vec<UpvalueBinding>,
}

enum Resolved {
    Local { slot: u16, depth: u16, mutable: bool },
    Upvalue { index: u8, mutable: bool },
    Global { index: u16, mutable: bool },
}

struct Compiler {
    chunk: Chunk,
    globals: Vec<GlobalBinding>,
    ctxs: Vec<FunctionCtx>,
    diagnostics: Vec<CompileError>,
}

impl Compiler {
    fn new(prelude: &[String]) -> Self {
        let globals = prelude
            .iter()
            .map(|name| GlobalBinding {
                name: name.clone(),
                mutable: false,
            })
            .collect();
        Self {
            chunk: Chunk::new(),
            globals,
            ctxs: vec![FunctionCtx {
                scopes: Vec::new(),
                upvalues: Vec::new(),
            }],
            diagnostics: Vec::new(),
        }
    }

    /// `var` at the top level, outside any block, declares a global.
    fn at_global_scope(&self) -> bool {
        self.ctxs.len() == 1 && self.ctxs[0].scopes.is_empty()
    }

    fn error(&mut self, err: CompileError) {
        self.diagnostics.push(err);
    }

    fn intern(&mut self, value: Unit, pos: Position) -> u16 {
        let idx = self.chunk.pool.intern(value);
        if self.chunk.pool.len() > u16::MAX as usize {
            self.error(CompileError::LimitExceeded {
                what: "constants",
                limit: u16::MAX as usize,
                pos,
            });
        }
        idx
    }

    /// Append a fresh pool slot, with the same limit check as `intern`.
    /// Function prototypes must not dedup, so they go through here.
    fn add_const(&mut self, value: Unit, pos: Position) -> u16 {
        let idx = self.chunk.pool.add(value);
        if self.chunk.pool.len() > u16::MAX as usize {
            self.error(CompileError::LimitExceeded {
                what: "constants",
                limit: u16::MAX as usize,
                pos,
            });
        }
        idx
    }

    // === Statements ===

    /// Compile statements in order, stopping at the first one after which
    /// a diagnostic exists.
    fn compile_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            if !self.diagnostics.is_empty() {
                return;
            }
            self.compile_stmt(stmt);
        }
    }

    /// A block in its own environment frame.
    fn compile_scope(&mut self, body: &[Stmt], line: u32) {
        self.chunk.emit(Instruction::PushEnv, line);
        self.ctx_mut().scopes.push(Scope::default());
        self.compile_body(body);
        let end_line = body.last().map(|s| s.pos().line).unwrap_or(line);
        let scope = self.ctx_mut().scopes.pop().unwrap_or_default();
        let close = if scope.captured {
            Instruction::CloseEnv
        } else {
            Instruction::PopEnv
        };
        self.chunk.emit(close, end_line);
    }

    fn compile_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Var {
                name,
                init,
                mutable,
            } => {
                if self.at_global_scope() {
                    if self.globals.iter().any(|g| g.name == name.name) {
                        self.error(CompileError::DuplicateGlobal {
                            name: name.name.clone(),
                            pos: name.pos,
                        });
                        return;
                    }
                    // the name is not visible to its own initializer
                    self.compile_expr(init);
                    let index = self.declare_global(&name.name, *mutable, name.pos);
                    self.chunk
                        .emit(Instruction::DeclareGlobal(index), name.pos.line);
                } else {
                    self.compile_expr(init);
                    self.chunk.emit(Instruction::DeclareLocal, name.pos.line);
                    self.declare_local(&name.name, *mutable, name.pos);
                }
            }

            Stmt::Assign { target, value, pos } => match target {
                AssignTarget::Name(id) => {
                    self.compile_expr(value);
                    self.compile_store(id);
                }
                AssignTarget::Index { target, indexes } => {
                    self.compile_expr(target);
                    for index in indexes {
                        self.compile_expr(index);
                    }
                    self.compile_expr(value);
                    let count = self.check_u8(indexes.len(), "index keys", *pos);
                    self.chunk.emit(Instruction::SetIndex(count), pos.line);
                }
            },

            Stmt::Expr(expr) => {
                self.compile_expr(expr);
                self.chunk.emit(Instruction::Pop, expr.pos().line);
            }

            Stmt::If {
                cond,
                then_body,
                else_body,
                pos,
            } => {
                self.compile_expr(cond);
                let to_else = self.chunk.emit_jump(Instruction::JumpIfFalse(0), pos.line);
                self.compile_scope(then_body, pos.line);
                if else_body.is_empty() {
                    self.chunk.patch_jump(to_else);
                } else {
                    let to_end = self.chunk.emit_jump(Instruction::Jump(0), pos.line);
                    self.chunk.patch_jump(to_else);
                    self.compile_scope(else_body, pos.line);
                    self.chunk.patch_jump(to_end);
                }
            }

            Stmt::While { cond, body, pos } => {
                let loop_start = self.chunk.code.len();
                self.compile_expr(cond);
                let exit = self.chunk.emit_jump(Instruction::JumpIfFalse(0), pos.line);
                self.compile_scope(body, pos.line);
                self.chunk.emit_jump_back(loop_start, pos.line);
                self.chunk.patch_jump(exit);
            }

            Stmt::Return { value, pos } => {
                if self.ctxs.len() == 1 {
                    self.error(CompileError::ReturnOutsideFunction { pos: *pos });
                    return;
                }
                match value {
                    Some(expr) => self.compile_expr(expr),
                    None => {
                        self.chunk.emit(Instruction::LoadNull, pos.line);
                    }
                }
                self.chunk.emit(Instruction::Return, pos.line);
            }

            Stmt::Block(body, pos) => self.compile_scope(body, pos.line),

            Stmt::Function(decl) => self.compile_fn_decl(decl),
        }
    }

    /// Named declarations bind before their body compiles so the function
    /// can call itself.
    fn compile_fn_decl(&mut self, decl: &FnDecl) {
        let FnDecl {
            name,
            params,
            body,
            pos,
        } = decl;
        if self.at_global_scope() {
            if self.globals.iter().any(|g| g.name == name.name) {
                self.error(CompileError::DuplicateGlobal {
                    name: name.name.clone(),
                    pos: name.pos,
                });
                return;
            }
            let index = self.declare_global(&name.name, false, name.pos);
            self.compile_function(Some(&name.name), params, body, *pos);
            self.chunk.emit(Instruction::DeclareGlobal(index), pos.line);
        } else {
            // the binding's slot is reserved before the value exists;
            // recursive captures read it once the declaration has run
            self.declare_local(&name.name, false, name.pos);
            self.compile_function(Some(&name.name), params, body, *pos);
            self.chunk.emit(Instruction::DeclareLocal, pos.line);
        }
    }

    // === Expressions ===

    fn compile_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Null(pos) => {
                self.chunk.emit(Instruction::LoadNull, pos.line);
            }
            Expr::Bool(true, pos) => {
                self.chunk.emit(Instruction::LoadTrue, pos.line);
            }
            Expr::Bool(false, pos) => {
                self.chunk.emit(Instruction::LoadFalse, pos.line);
            }
            Expr::Int(value, pos) => self.emit_const(Unit::Int(*value), *pos),
            Expr::Float(value, pos) => self.emit_const(Unit::Float(*value), *pos),
            Expr::Char(value, pos) => self.emit_const(Unit::Char(*value), *pos),
            Expr::Str(value, pos) => self.emit_const(Unit::from(value.as_str()), *pos),

            Expr::Name(id) => self.compile_load(id),

            Expr::Unary { op, operand, pos } => {
                self.compile_expr(operand);
                let instr = match op {
                    UnOp::Neg => Instruction::Negate,
                    UnOp::Not => Instruction::Not,
                };
                self.chunk.emit(instr, pos.line);
            }

            Expr::Binary { op, lhs, rhs, pos } => {
                self.compile_expr(lhs);
                self.compile_expr(rhs);
                self.chunk.emit(binop_instruction(*op), pos.line);
            }

            Expr::Call { callee, args, pos } => {
                self.compile_expr(callee);
                for arg in args {
                    self.compile_expr(arg);
                }
                let argc = self.check_u8(args.len(), "call arguments", *pos);
                self.chunk.emit(Instruction::Call(argc), pos.line);
            }

            Expr::Index {
                target,
                indexes,
                pos,
            } => {
                self.compile_expr(target);
                for index in indexes {
                    self.compile_expr(index);
                }
                let count = self.check_u8(indexes.len(), "index keys", *pos);
                self.chunk.emit(Instruction::GetIndex(count), pos.line);
            }

            Expr::Method {
                recv,
                name,
                args,
                pos,
            } => {
                // the receiver is evaluated once, parked in the stash, and
                // reused as both lookup target and implicit first argument
                self.compile_expr(recv);
                self.chunk.emit(Instruction::StashStore, pos.line);
                self.chunk.emit(Instruction::StashLoad, pos.line);
                self.emit_const(Unit::from(name.as_str()), *pos);
                self.chunk.emit(Instruction::GetIndex(1), pos.line);
                self.chunk.emit(Instruction::StashLoad, pos.line);
                for arg in args {
                    self.compile_expr(arg);
                }
                let argc = self.check_u8(args.len() + 1, "call arguments", *pos);
                self.chunk.emit(Instruction::Call(argc), pos.line);
            }

            Expr::Table { entries, pos } => self.compile_table(entries, *pos),

            Expr::Function { params, body, pos } => {
                self.compile_function(None, params, body, *pos)
            }
        }
    }

    /// Table literal desugaring: an entry keyed by an integer literal that
    /// equals the running dense counter joins the dense elements; every
    /// other keyed entry goes to the associative part, whatever the source
    /// order.
    fn compile_table(&mut self, entries: &[TableEntry], pos: Position) {
        let mut dense: Vec<&Expr> = Vec::new();
        let mut assoc: Vec<(&Expr, &Expr)> = Vec::new();
        for entry in entries {
            match entry {
                TableEntry::Item(value) => dense.push(value),
                TableEntry::Pair { key, value } => match key {
                    Expr::Int(i, _) if *i == dense.len() as i64 => dense.push(value),
                    _ => assoc.push((key, value)),
                },
            }
        }
        if dense.len() > u16::MAX as usize || assoc.len() > u16::MAX as usize {
            self.error(CompileError::LimitExceeded {
                what: "table literal entries",
                limit: u16::MAX as usize,
                pos,
            });
            return;
        }
        for value in &dense {
            self.compile_expr(value);
        }
        for (key, value) in &assoc {
            self.compile_expr(key);
            self.compile_expr(value);
        }
        self.chunk.emit(
            Instruction::NewTable(dense.len() as u16, assoc.len() as u16),
            pos.line,
        );
    }

    /// Compile a function literal: its body goes inline into the chunk,
    /// then gets sliced out and attached to a pool constant. The constant
    /// slot is reserved up front (as null) and replaced in place once the
    /// body, and therefore the capture list, is known.
    fn compile_function(
        &mut self,
        name: Option<&str>,
        params: &[Ident],
        body: &[Stmt],
        pos: Position,
    ) {
        let arity = self.check_u8(params.len(), "parameters", pos);
        let const_idx = self.add_const(Unit::Null, pos);
        self.chunk
            .emit(Instruction::DeclareFunction(const_idx), pos.line);

        let mut base = Scope::default();
        for param in params {
            if base.bindings.iter().any(|b| b.name == param.name) {
                self.error(CompileError::DuplicateLocal {
                    name: param.name.clone(),
                    pos: param.pos,
                });
            }
            base.bindings.push(LocalBinding {
                name: param.name.clone(),
                mutable: true,
            });
        }
        self.ctxs.push(FunctionCtx {
            scopes: vec![base],
            upvalues: Vec::new(),
        });

        let start = self.chunk.code.len();
        self.compile_body(body);
        let end_line = body.last().map(|s| s.pos().line).unwrap_or(pos.line);
        self.chunk.emit(Instruction::LoadNull, end_line);
        self.chunk.emit(Instruction::Return, end_line);

        let ctx = self.ctxs.pop().unwrap_or_else(|| FunctionCtx {
            scopes: Vec::new(),
            upvalues: Vec::new(),
        });
        let code: Vec<Instruction> = self.chunk.code.split_off(start);
        let positions = self.chunk.positions.slice(start..start + code.len());
        self.chunk.positions.truncate(start);

        let function = FunctionValue {
            name: name.unwrap_or("<anonymous>").to_string(),
            arity,
            code: code.into(),
            pool: self.chunk.pool.clone(),
            positions,
            module: None,
            line: pos.line,
            upvalues: ctx.upvalues.into_iter().map(|u| u.desc).collect(),
        };
        self.chunk.pool.replace(const_idx, Unit::function(function));
    }

    // === Name resolution ===

    fn ctx_mut(&mut self) -> &mut FunctionCtx {
        self.ctxs
            .last_mut()
            .expect("function context stack is never empty")
    }

    fn declare_global(&mut self, name: &str, mutable: bool, pos: Position) -> u16 {
        if self.globals.len() >= u16::MAX as usize {
            self.error(CompileError::LimitExceeded {
                what: "globals",
                limit: u16::MAX as usize,
                pos,
            });
        }
        let index = self.globals.len() as u16;
        self.globals.push(GlobalBinding {
            name: name.to_string(),
            mutable,
        });
        index
    }

    fn declare_local(&mut self, name: &str, mutable: bool, pos: Position) {
        let Some(scope) = self.ctx_mut().scopes.last_mut() else {
            // top level outside a block is handled by the global path
            return;
        };
        if scope.bindings.iter().any(|b| b.name == name) {
            self.error(CompileError::DuplicateLocal {
                name: name.to_string(),
                pos,
            });
            return;
        }
        scope.bindings.push(LocalBinding {
            name: name.to_string(),
            mutable,
        });
    }

    fn compile_load(&mut self, id: &Ident) {
        match self.resolve(&id.name, id.pos) {
            Some(Resolved::Local { slot, depth, .. }) => {
                self.chunk
                    .emit(Instruction::LoadLocal(slot, depth), id.pos.line);
            }
            Some(Resolved::Upvalue { index, .. }) => {
                self.chunk.emit(Instruction::LoadUpvalue(index), id.pos.line);
            }
            Some(Resolved::Global { index, .. }) => {
                self.chunk.emit(Instruction::LoadGlobal(index), id.pos.line);
            }
            // keep the stack shape sane while diagnostics drain
            None => {
                self.chunk.emit(Instruction::LoadNull, id.pos.line);
            }
        }
    }

    fn compile_store(&mut self, id: &Ident) {
        let resolved = self.resolve(&id.name, id.pos);
        let mutable = match &resolved {
            Some(
                Resolved::Local { mutable, .. }
                | Resolved::Upvalue { mutable, .. }
                | Resolved::Global { mutable, .. },
            ) => *mutable,
            None => return,
        };
        if !mutable {
            self.error(CompileError::AssignToConst {
                name: id.name.clone(),
                pos: id.pos,
            });
            return;
        }
        match resolved {
            Some(Resolved::Local { slot, depth, .. }) => {
                self.chunk
                    .emit(Instruction::StoreLocal(slot, depth), id.pos.line);
            }
            Some(Resolved::Upvalue { index, .. }) => {
                self.chunk
                    .emit(Instruction::StoreUpvalue(index), id.pos.line);
            }
            Some(Resolved::Global { index, .. }) => {
                self.chunk
                    .emit(Instruction::StoreGlobal(index), id.pos.line);
            }
            None => {}
        }
    }

    /// Resolve a name: locals of the current function, then captures from
    /// enclosing functions, then globals.
    fn resolve(&mut self, name: &str, pos: Position) -> Option<Resolved> {
        let top = self.ctxs.len() - 1;
        if let Some((slot, scope_idx, mutable)) = self.find_local(top, name) {
            let depth = (self.ctxs[top].scopes.len() - 1 - scope_idx) as u16;
            return Some(Resolved::Local {
                slot,
                depth,
                mutable,
            });
        }
        if let Some((index, mutable)) = self.resolve_upvalue(top, name, pos) {
            return Some(Resolved::Upvalue { index, mutable });
        }
        if let Some(index) = self.globals.iter().position(|g| g.name == name) {
            let mutable = self.globals[index].mutable;
            return Some(Resolved::Global {
                index: index as u16,
                mutable,
            });
        }
        self.error(CompileError::UnknownVariable {
            name: name.to_string(),
            pos,
        });
        None
    }

    /// Innermost-first search of one function's scopes.
    fn find_local(&self, ctx: usize, name: &str) -> Option<(u16, usize, bool)> {
        for (scope_idx, scope) in self.ctxs[ctx].scopes.iter().enumerate().rev() {
            if let Some((slot, binding)) = scope
                .bindings
                .iter()
                .enumerate()
                .rev()
                .find(|(_, b)| b.name == name)
            {
                return Some((slot as u16, scope_idx, binding.mutable));
            }
        }
        None
    }

    /// Capture a variable from an enclosing function. Walks outward until
    /// the declaring function is found, threading the capture through each
    /// intermediate closure so the cell stays reachable after intermediate
    /// frames die.
    fn resolve_upvalue(&mut self, ctx: usize, name: &str, pos: Position) -> Option<(u8, bool)> {
        if let Some(index) = self.ctxs[ctx].upvalues.iter().position(|u| u.name == name) {
            let mutable = self.ctxs[ctx].upvalues[index].mutable;
            return Some((index as u8, mutable));
        }
        if ctx == 0 {
            return None;
        }
        let parent = ctx - 1;
        if let Some((slot, scope_idx, mutable)) = self.find_local(parent, name) {
            let depth = (self.ctxs[parent].scopes.len() - 1 - scope_idx) as u16;
            self.ctxs[parent].scopes[scope_idx].captured = true;
            let desc = UpvalueDesc::Local { slot, depth };
            let index = self.add_upvalue(ctx, name, mutable, desc, pos)?;
            return Some((index, mutable));
        }
        if let Some((parent_index, mutable)) = self.resolve_upvalue(parent, name, pos) {
            let desc = UpvalueDesc::Enclosing(parent_index);
            let index = self.add_upvalue(ctx, name, mutable, desc, pos)?;
            return Some((index, mutable));
        }
        None
    }

    fn add_upvalue(
        &mut self,
        ctx: usize,
        name: &str,
        mutable: bool,
        desc: UpvalueDesc,
        pos: Position,
    ) -> Option<u8> {
        let upvalues = &mut self.ctxs[ctx].upvalues;
        if upvalues.len() > u8::MAX as usize {
            self.error(CompileError::LimitExceeded {
                what: "captured variables",
                limit: u8::MAX as usize + 1,
                pos,
            });
            return None;
        }
        upvalues.push(UpvalueBinding {
            name: name.to_string(),
            mutable,
            desc,
        });
        Some((upvalues.len() - 1) as u8)
    }

    // === Helpers ===

    fn emit_const(&mut self, value: Unit, pos: Position) {
        let idx = self.intern(value, pos);
        self.chunk.emit(Instruction::LoadConst(idx), pos.line);
    }

    fn check_u8(&mut self, count: usize, what: &'static str, pos: Position) -> u8 {
        if count > u8::MAX as usize {
            self.error(CompileError::LimitExceeded {
                what,
                limit: u8::MAX as usize,
                pos,
            });
            return u8::MAX;
        }
        count as u8
    }
}

fn binop_instruction(op: BinOp) -> Instruction {
    match op {
        BinOp::Add => Instruction::Add,
        BinOp::Sub => Instruction::Sub,
        BinOp::Mul => Instruction::Mul,
        BinOp::Div => Instruction::Div,
        BinOp::Eq => Instruction::Equal,
        BinOp::Ne => Instruction::NotEqual,
        BinOp::Lt => Instruction::Less,
        BinOp::Le => Instruction::LessEqual,
        BinOp::Gt => Instruction::Greater,
        BinOp::Ge => Instruction::GreaterEqual,
        BinOp::And => Instruction::And,
        BinOp::Or => Instruction::Or,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_vm::value::HeapRef;

    fn int(v: i64, line: u32) -> Expr {
        Expr::Int(v, Position::new(line))
    }

    fn name(n: &str, line: u32) -> Expr {
        Expr::Name(Ident::new(n, line))
    }

    fn var(n: &str, init: Expr, line: u32) -> Stmt {
        Stmt::Var {
            name: Ident::new(n, line),
            init,
            mutable: true,
        }
    }

    fn program(body: Vec<Stmt>) -> Program {
        Program::new(body)
    }

    #[test]
    fn duplicate_global_yields_exactly_one_diagnostic() {
        let failure = compile(
            &program(vec![
                var("x", int(1, 1), 1),
                var("x", int(2, 2), 2),
                var("y", int(3, 3), 3),
            ]),
            &[],
        )
        .unwrap_err();
        assert_eq!(failure.diagnostics.len(), 1);
        assert!(matches!(
            &failure.diagnostics[0],
            CompileError::DuplicateGlobal { name, .. } if name == "x"
        ));
    }

    #[test]
    fn unknown_variable_is_reported_with_its_line() {
        let failure = compile(&program(vec![Stmt::Expr(name("missing", 7))]), &[]).unwrap_err();
        assert_eq!(failure.diagnostics.len(), 1);
        assert_eq!(failure.diagnostics[0].pos().line, 7);
    }

    #[test]
    fn return_at_top_level_is_rejected() {
        let failure = compile(
            &program(vec![Stmt::Return {
                value: None,
                pos: Position::new(2),
            }]),
            &[],
        )
        .unwrap_err();
        assert!(matches!(
            failure.diagnostics[0],
            CompileError::ReturnOutsideFunction { .. }
        ));
    }

    #[test]
    fn const_assignment_is_rejected() {
        let body = vec![
            Stmt::Var {
                name: Ident::new("k", 1),
                init: int(1, 1),
                mutable: false,
            },
            Stmt::Assign {
                target: AssignTarget::Name(Ident::new("k", 2)),
                value: int(2, 2),
                pos: Position::new(2),
            },
        ];
        let failure = compile(&program(body), &[]).unwrap_err();
        assert!(matches!(
            &failure.diagnostics[0],
            CompileError::AssignToConst { name, .. } if name == "k"
        ));
    }

    #[test]
    fn function_prototype_slots_respect_the_pool_limit() {
        // prototype slots never dedup, so each literal takes a fresh pool
        // entry; one past the index limit must be a diagnostic, not a
        // truncated operand
        let body: Vec<Stmt> = (0..=u16::MAX as usize)
            .map(|_| {
                Stmt::Expr(Expr::Function {
                    params: vec![],
                    body: vec![],
                    pos: Position::new(1),
                })
            })
            .collect();
        let failure = compile(&program(body), &[]).unwrap_err();
        assert!(matches!(
            &failure.diagnostics[0],
            CompileError::LimitExceeded {
                what: "constants",
                ..
            }
        ));
    }

    #[test]
    fn table_literal_desugars_by_running_dense_counter() {
        // [10, 20, "x": 1, 30] => dense 10,20,30 and assoc "x": 1
        let entries = vec![
            TableEntry::Item(int(10, 1)),
            TableEntry::Item(int(20, 1)),
            TableEntry::Pair {
                key: Expr::Str("x".to_string(), Position::new(1)),
                value: int(1, 1),
            },
            TableEntry::Item(int(30, 1)),
        ];
        let unit = compile(
            &program(vec![Stmt::Expr(Expr::Table {
                entries,
                pos: Position::new(1),
            })]),
            &[],
        )
        .unwrap();
        assert!(unit.chunk.code.contains(&Instruction::NewTable(3, 1)));
    }

    #[test]
    fn sequential_integer_keys_fold_into_the_dense_part() {
        // [0: "a", 1: "b", 5: "c"] => dense a,b and assoc 5: c
        let entries = vec![
            TableEntry::Pair {
                key: int(0, 1),
                value: Expr::Str("a".into(), Position::new(1)),
            },
            TableEntry::Pair {
                key: int(1, 1),
                value: Expr::Str("b".into(), Position::new(1)),
            },
            TableEntry::Pair {
                key: int(5, 1),
                value: Expr::Str("c".into(), Position::new(1)),
            },
        ];
        let unit = compile(
            &program(vec![Stmt::Expr(Expr::Table {
                entries,
                pos: Position::new(1),
            })]),
            &[],
        )
        .unwrap();
        assert!(unit.chunk.code.contains(&Instruction::NewTable(2, 1)));
    }

    #[test]
    fn shadowed_local_resolves_to_the_innermost_scope() {
        // { var x = 1; { var x = 2; x; } x; }
        let inner = Stmt::Block(
            vec![var("x", int(2, 3), 3), Stmt::Expr(name("x", 4))],
            Position::new(2),
        );
        let outer = Stmt::Block(
            vec![var("x", int(1, 2), 2), inner, Stmt::Expr(name("x", 6))],
            Position::new(1),
        );
        let unit = compile(&program(vec![outer]), &[]).unwrap();
        let loads: Vec<&Instruction> = unit
            .chunk
            .code
            .iter()
            .filter(|i| matches!(i, Instruction::LoadLocal(..)))
            .collect();
        // both reads hit their own innermost frame
        assert_eq!(
            loads,
            vec![&Instruction::LoadLocal(0, 0), &Instruction::LoadLocal(0, 0)]
        );
    }

    #[test]
    fn closure_captures_are_described_not_inlined() {
        // function outer() { var n = 0; function inc() { n = n + 1; return n; } return inc; }
        let inc = Stmt::Function(FnDecl {
            name: Ident::new("inc", 3),
            params: vec![],
            body: vec![
                Stmt::Assign {
                    target: AssignTarget::Name(Ident::new("n", 4)),
                    value: Expr::Binary {
                        op: BinOp::Add,
                        lhs: Box::new(name("n", 4)),
                        rhs: Box::new(int(1, 4)),
                        pos: Position::new(4),
                    },
                    pos: Position::new(4),
                },
                Stmt::Return {
                    value: Some(name("n", 5)),
                    pos: Position::new(5),
                },
            ],
            pos: Position::new(3),
        });
        let outer = Stmt::Function(FnDecl {
            name: Ident::new("outer", 1),
            params: vec![],
            body: vec![
                var("n", int(0, 2), 2),
                inc,
                Stmt::Return {
                    value: Some(name("inc", 6)),
                    pos: Position::new(6),
                },
            ],
            pos: Position::new(1),
        });
        let unit = compile(&program(vec![outer]), &[]).unwrap();
        let constants = unit.chunk.pool.snapshot();
        let inner = constants
            .iter()
            .find_map(|c| match c {
                Unit::Heap(HeapRef::Function(f)) if f.name == "inc" => Some(f.clone()),
                _ => None,
            })
            .expect("inc prototype in pool");
        assert_eq!(inner.upvalues.len(), 1);
        assert!(matches!(
            inner.upvalues[0],
            UpvalueDesc::Local { slot: 0, depth: 0 }
        ));
        let outer = constants
            .iter()
            .find_map(|c| match c {
                Unit::Heap(HeapRef::Function(f)) if f.name == "outer" => Some(f.clone()),
                _ => None,
            })
            .expect("outer prototype in pool");
        assert!(outer.upvalues.is_empty());
    }

    #[test]
    fn method_calls_route_the_receiver_through_the_stash() {
        let unit = compile(
            &program(vec![
                var(
                    "t",
                    Expr::Table {
                        entries: vec![],
                        pos: Position::new(1),
                    },
                    1,
                ),
                Stmt::Expr(Expr::Method {
                    recv: Box::new(name("t", 2)),
                    name: "visit".to_string(),
                    args: vec![int(9, 2)],
                    pos: Position::new(2),
                }),
            ]),
            &[],
        )
        .unwrap();
        let code = &unit.chunk.code;
        let stash_store = code
            .iter()
            .position(|i| matches!(i, Instruction::StashStore))
            .expect("receiver stashed");
        assert_eq!(code[stash_store + 1], Instruction::StashLoad);
        assert!(matches!(code[stash_store + 3], Instruction::GetIndex(1)));
        assert_eq!(code[stash_store + 4], Instruction::StashLoad);
        // one explicit argument plus the implicit receiver
        assert!(code.contains(&Instruction::Call(2)));
    }

    #[test]
    fn trailing_expression_becomes_the_program_result() {
        let unit = compile(
            &program(vec![var("x", int(5, 1), 1), Stmt::Expr(name("x", 2))]),
            &[],
        )
        .unwrap();
        let code = &unit.chunk.code;
        assert_eq!(code[code.len() - 1], Instruction::Exit);
        // the trailing expression is not popped
        assert!(matches!(code[code.len() - 2], Instruction::LoadGlobal(0)));
    }

    #[test]
    fn prelude_names_occupy_the_first_global_slots() {
        let unit = compile(
            &program(vec![var("mine", int(1, 1), 1)]),
            &["require".to_string(), "len".to_string()],
        )
        .unwrap();
        assert_eq!(
            unit.global_names,
            vec!["require".to_string(), "len".to_string(), "mine".to_string()]
        );
        assert!(unit.chunk.code.contains(&Instruction::DeclareGlobal(2)));
    }
}
