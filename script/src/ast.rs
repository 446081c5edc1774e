//! Syntax tree produced by the parser.

use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
    Name(String),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        target: Box<Expr>,
        args: Vec<Expr>,
        line: u32,
    },
}

/// A function definition; shared between the defining statement and the
/// value it binds.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Rc<Vec<Stmt>>,
    pub filename: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign {
        line: u32,
        name: String,
        value: Expr,
    },
    AssignIndex {
        line: u32,
        target: Expr,
        index: Expr,
        value: Expr,
    },
    Expr {
        line: u32,
        expr: Expr,
    },
    If {
        line: u32,
        condition: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    While {
        line: u32,
        condition: Expr,
        body: Vec<Stmt>,
    },
    Def {
        line: u32,
        func: Rc<FunctionDef>,
    },
    Return {
        line: u32,
        value: Option<Expr>,
    },
    Raise {
        line: u32,
        value: Expr,
    },
    Pass {
        line: u32,
    },
}

impl Stmt {
    pub fn line(&self) -> u32 {
        match self {
            Stmt::Assign { line, .. }
            | Stmt::AssignIndex { line, .. }
            | Stmt::Expr { line, .. }
            | Stmt::If { line, .. }
            | Stmt::While { line, .. }
            | Stmt::Def { line, .. }
            | Stmt::Return { line, .. }
            | Stmt::Raise { line, .. }
            | Stmt::Pass { line } => *line,
        }
    }
}

/// A parsed script, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub filename: String,
    pub body: Vec<Stmt>,
}

impl Program {
    /// Names defined by the program (at any nesting depth) that shadow
    /// built-in or prelude names. Reported to the user at debug startup,
    /// since calls hit the shadowing definition.
    pub fn shadowed_names(&self, reserved: &[&str]) -> Vec<String> {
        let mut found = Vec::new();
        collect_defs(&self.body, &mut found);
        found.retain(|name| reserved.contains(&name.as_str()));
        found.sort();
        found.dedup();
        found
    }
}

fn collect_defs(body: &[Stmt], out: &mut Vec<String>) {
    for stmt in body {
        match stmt {
            Stmt::Def { func, .. } => {
                out.push(func.name.clone());
                collect_defs(&func.body, out);
            }
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                collect_defs(then_body, out);
                collect_defs(else_body, out);
            }
            Stmt::While { body, .. } => collect_defs(body, out),
            _ => {}
        }
    }
}

/// A single expression compiled from text, reusable across evaluations.
///
/// Breakpoint and watch conditions compile through this, so their semantics
/// are exactly the language's expression semantics.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpr {
    pub source: String,
    pub expr: Expr,
}

/// A compiled statement sequence, as accepted by `executeStatement`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledBlock {
    pub source: String,
    pub body: Vec<Stmt>,
}
