// AST node types for NMODL statement blocks.
//
// Covers the statement dialect found inside model blocks: assignments,
// control flow, calls, WATCH, FOR_NETCON, VERBATIM and derivimplicit
// callbacks. Every node carries a `SimpleSpan` for error reporting.
//
// Preconditions: produced by the parser from a valid or partially-valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use std::fmt;

use chumsky::span::SimpleSpan;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

/// Identifier with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

// ── Blocks ──

/// A braced (or top-level) sequence of statements.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementBlock {
    pub statements: Vec<Stmt>,
    pub span: Span,
}

// ── Statements ──

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Local(Vec<LocalVar>, Span),
    Assign {
        target: Expr,
        value: Expr,
        span: Span,
    },
    Expr(Expr),
    If(IfStmt),
    While {
        cond: Expr,
        body: StatementBlock,
        span: Span,
    },
    From {
        var: Ident,
        from: Expr,
        to: Expr,
        by: Option<Expr>,
        body: StatementBlock,
        span: Span,
    },
    Watch(WatchStmt),
    ForNetcon {
        params: Vec<Ident>,
        body: StatementBlock,
        span: Span,
    },
    Verbatim(String, Span),
    /// Callback into the named derivimplicit Newton solve.
    DerivImplicit(Ident),
    /// INITIAL nested inside NET_RECEIVE (handled by `net_init`).
    Initial(StatementBlock),
}

/// `LOCAL name` or `LOCAL name[n]`.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVar {
    pub name: Ident,
    pub length: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfStmt {
    pub cond: Expr,
    pub then_block: StatementBlock,
    pub else_ifs: Vec<(Expr, StatementBlock)>,
    pub else_block: Option<StatementBlock>,
    pub span: Span,
}

/// `WATCH (cond) flag [, (cond) flag ...]`
#[derive(Debug, Clone, PartialEq)]
pub struct WatchStmt {
    pub clauses: Vec<WatchClause>,
    pub span: Span,
    /// `watch{n}` slot, numbered across the model by `model::build`.
    pub slot: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchClause {
    pub cond: Expr,
    pub flag: Expr,
}

// ── Expressions ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub name: Ident,
    pub args: Vec<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Integer(i64, Span),
    /// Real literal, lexeme kept exactly as written.
    Real(String, Span),
    Str(String, Span),
    Name(Ident),
    Indexed(Ident, Box<Expr>),
    Call(Call),
    Unary(UnaryOp, Box<Expr>, Span),
    Binary(Box<Expr>, BinaryOp, Box<Expr>, Span),
    Paren(Box<Expr>, Span),
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Integer(_, s) | Expr::Real(_, s) | Expr::Str(_, s) => *s,
            Expr::Name(id) => id.span,
            Expr::Indexed(id, idx) => (id.span.start..idx.span().end + 1).into(),
            Expr::Call(c) => c.span,
            Expr::Unary(_, _, s) | Expr::Binary(_, _, _, s) | Expr::Paren(_, s) => *s,
        }
    }

    /// Build a binary node whose span covers both operands.
    pub fn binary(lhs: Expr, op: BinaryOp, rhs: Expr) -> Expr {
        let span: Span = (lhs.span().start..rhs.span().end).into();
        Expr::Binary(Box::new(lhs), op, Box::new(rhs), span)
    }

    /// Name of the variable an assignment target writes.
    pub fn target_name(&self) -> Option<&str> {
        match self {
            Expr::Name(id) | Expr::Indexed(id, _) => Some(&id.name),
            Expr::Integer(..)
            | Expr::Real(..)
            | Expr::Str(..)
            | Expr::Call(_)
            | Expr::Unary(..)
            | Expr::Binary(..)
            | Expr::Paren(..) => None,
        }
    }

    /// Visit this expression and all sub-expressions, pre-order.
    pub fn walk(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Integer(..) | Expr::Real(..) | Expr::Str(..) | Expr::Name(_) => {}
            Expr::Indexed(_, idx) => idx.walk(f),
            Expr::Call(c) => {
                for a in &c.args {
                    a.walk(f);
                }
            }
            Expr::Unary(_, e, _) | Expr::Paren(e, _) => e.walk(f),
            Expr::Binary(l, _, r, _) => {
                l.walk(f);
                r.walk(f);
            }
        }
    }
}

impl Stmt {
    /// Direct expressions of this statement (not those of nested blocks).
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Stmt::Local(..) | Stmt::Verbatim(..) | Stmt::DerivImplicit(_) | Stmt::Initial(_) => {
                Vec::new()
            }
            Stmt::Assign { target, value, .. } => vec![target, value],
            Stmt::Expr(e) => vec![e],
            Stmt::If(s) => {
                let mut out = vec![&s.cond];
                out.extend(s.else_ifs.iter().map(|(c, _)| c));
                out
            }
            Stmt::While { cond, .. } => vec![cond],
            Stmt::From { from, to, by, .. } => {
                let mut out = vec![from, to];
                out.extend(by.iter());
                out
            }
            Stmt::Watch(w) => w.clauses.iter().flat_map(|c| [&c.cond, &c.flag]).collect(),
            Stmt::ForNetcon { .. } => Vec::new(),
        }
    }

    /// Nested blocks of this statement.
    pub fn blocks(&self) -> Vec<&StatementBlock> {
        match self {
            Stmt::If(s) => {
                let mut out = vec![&s.then_block];
                out.extend(s.else_ifs.iter().map(|(_, b)| b));
                out.extend(s.else_block.iter());
                out
            }
            Stmt::While { body, .. } | Stmt::From { body, .. } | Stmt::ForNetcon { body, .. } => {
                vec![body]
            }
            Stmt::Initial(b) => vec![b],
            Stmt::Local(..)
            | Stmt::Assign { .. }
            | Stmt::Expr(_)
            | Stmt::Watch(_)
            | Stmt::Verbatim(..)
            | Stmt::DerivImplicit(_) => Vec::new(),
        }
    }

    fn blocks_mut(&mut self) -> Vec<&mut StatementBlock> {
        match self {
            Stmt::If(s) => {
                let mut out = vec![&mut s.then_block];
                out.extend(s.else_ifs.iter_mut().map(|(_, b)| b));
                out.extend(s.else_block.iter_mut());
                out
            }
            Stmt::While { body, .. } | Stmt::From { body, .. } | Stmt::ForNetcon { body, .. } => {
                vec![body]
            }
            Stmt::Initial(b) => vec![b],
            Stmt::Local(..)
            | Stmt::Assign { .. }
            | Stmt::Expr(_)
            | Stmt::Watch(_)
            | Stmt::Verbatim(..)
            | Stmt::DerivImplicit(_) => Vec::new(),
        }
    }
}

impl StatementBlock {
    pub fn empty(span: Span) -> Self {
        Self {
            statements: Vec::new(),
            span,
        }
    }

    /// Visit every statement in this block and nested blocks, pre-order.
    pub fn walk_stmts(&self, f: &mut impl FnMut(&Stmt)) {
        for stmt in &self.statements {
            f(stmt);
            for block in stmt.blocks() {
                block.walk_stmts(f);
            }
        }
    }

    /// Mutable pre-order walk, same order as `walk_stmts`.
    pub fn walk_stmts_mut(&mut self, f: &mut impl FnMut(&mut Stmt)) {
        for stmt in &mut self.statements {
            f(stmt);
            for block in stmt.blocks_mut() {
                block.walk_stmts_mut(f);
            }
        }
    }

    /// Visit every expression in this block and nested blocks.
    pub fn walk_exprs(&self, f: &mut impl FnMut(&Expr)) {
        self.walk_stmts(&mut |stmt| {
            for e in stmt.exprs() {
                e.walk(f);
            }
        });
    }
}

// ── Re-printing ──

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Pow => "^",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Integer(v, _) => write!(f, "{v}"),
            Expr::Real(s, _) => write!(f, "{s}"),
            Expr::Str(s, _) => write!(f, "\"{s}\""),
            Expr::Name(id) => write!(f, "{}", id.name),
            Expr::Indexed(id, idx) => write!(f, "{}[{}]", id.name, idx),
            Expr::Call(c) => {
                write!(f, "{}(", c.name.name)?;
                for (i, a) in c.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Expr::Unary(UnaryOp::Neg, e, _) => write!(f, "-{e}"),
            Expr::Unary(UnaryOp::Not, e, _) => write!(f, "!{e}"),
            Expr::Binary(l, op, r, _) => write!(f, "{} {} {}", l, op.symbol(), r),
            Expr::Paren(e, _) => write!(f, "({e})"),
        }
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, block: &StatementBlock, depth: usize) -> fmt::Result {
    writeln!(f, "{{")?;
    for stmt in &block.statements {
        write_stmt(f, stmt, depth + 1)?;
    }
    write!(f, "{}}}", "    ".repeat(depth))
}

fn write_stmt(f: &mut fmt::Formatter<'_>, stmt: &Stmt, depth: usize) -> fmt::Result {
    let pad = "    ".repeat(depth);
    write!(f, "{pad}")?;
    match stmt {
        Stmt::Local(vars, _) => {
            let names: Vec<String> = vars
                .iter()
                .map(|v| match v.length {
                    Some(n) => format!("{}[{}]", v.name.name, n),
                    None => v.name.name.clone(),
                })
                .collect();
            write!(f, "LOCAL {}", names.join(", "))?;
        }
        Stmt::Assign { target, value, .. } => write!(f, "{target} = {value}")?,
        Stmt::Expr(e) => write!(f, "{e}")?,
        Stmt::If(s) => {
            write!(f, "IF ({}) ", s.cond)?;
            write_block(f, &s.then_block, depth)?;
            for (c, b) in &s.else_ifs {
                write!(f, " ELSE IF ({c}) ")?;
                write_block(f, b, depth)?;
            }
            if let Some(b) = &s.else_block {
                write!(f, " ELSE ")?;
                write_block(f, b, depth)?;
            }
        }
        Stmt::While { cond, body, .. } => {
            write!(f, "WHILE ({cond}) ")?;
            write_block(f, body, depth)?;
        }
        Stmt::From {
            var,
            from,
            to,
            by,
            body,
            ..
        } => {
            write!(f, "FROM {} = {} TO {} ", var.name, from, to)?;
            if let Some(by) = by {
                write!(f, "BY {by} ")?;
            }
            write_block(f, body, depth)?;
        }
        Stmt::Watch(w) => {
            let clauses: Vec<String> = w
                .clauses
                .iter()
                .map(|c| format!("({}) {}", c.cond, c.flag))
                .collect();
            write!(f, "WATCH {}", clauses.join(", "))?;
        }
        Stmt::ForNetcon { params, body, .. } => {
            let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
            write!(f, "FOR_NETCON({}) ", names.join(", "))?;
            write_block(f, body, depth)?;
        }
        Stmt::Verbatim(text, _) => write!(f, "VERBATIM{text}ENDVERBATIM")?,
        Stmt::DerivImplicit(name) => write!(f, "DERIVIMPLICIT {}", name.name)?,
        Stmt::Initial(b) => {
            write!(f, "INITIAL ")?;
            write_block(f, b, depth)?;
        }
    }
    writeln!(f)
}

impl fmt::Display for StatementBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_block(f, self, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sp(start: usize, end: usize) -> Span {
        (start..end).into()
    }

    fn name(n: &str, start: usize) -> Expr {
        Expr::Name(Ident {
            name: n.to_string(),
            span: sp(start, start + n.len()),
        })
    }

    #[test]
    fn binary_span_covers_operands() {
        let e = Expr::binary(name("a", 0), BinaryOp::Add, name("bc", 4));
        assert_eq!(e.span(), sp(0, 6));
        assert_eq!(e.to_string(), "a + bc");
    }

    #[test]
    fn walk_visits_call_arguments() {
        let call = Expr::Call(Call {
            name: Ident {
                name: "f".into(),
                span: sp(0, 1),
            },
            args: vec![name("x", 2), name("y", 5)],
            span: sp(0, 7),
        });
        let mut seen = Vec::new();
        call.walk(&mut |e| {
            if let Expr::Name(id) = e {
                seen.push(id.name.clone());
            }
        });
        assert_eq!(seen, vec!["x", "y"]);
    }

    #[test]
    fn target_name_of_indexed_assignment() {
        let e = Expr::Indexed(
            Ident {
                name: "m".into(),
                span: sp(0, 1),
            },
            Box::new(Expr::Integer(2, sp(2, 3))),
        );
        assert_eq!(e.target_name(), Some("m"));
        assert_eq!(Expr::Integer(1, sp(0, 1)).target_name(), None);
    }
}
