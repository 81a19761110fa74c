//! Typed syntax tree consumed by the native backend
//!
//! The front end (lexer, parser, semantic analysis) lives elsewhere. It hands
//! over a fully resolved tree: every expression carries its static type and
//! every variable reference points into a symbol table that fixes the
//! variable's storage (a frame slot or a global index).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CompileError, Result};

/// A complete program: top-level statements plus the symbol table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub symbols: Vec<Symbol>,
    pub items: Vec<Stmt>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the JSON form of a typed program
    pub fn from_json(source: &str) -> Result<Self> {
        serde_json::from_str(source).map_err(|e| CompileError::InvalidInput {
            message: e.to_string(),
        })
    }

    /// Serialize to the JSON form accepted by [`Program::from_json`]
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| CompileError::InvalidInput {
            message: e.to_string(),
        })
    }

    /// Register a symbol and return its identity
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        ty: ValueType,
        storage: Storage,
    ) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(Symbol {
            name: name.into(),
            ty,
            storage,
        });
        id
    }

    /// Look up a symbol by identity
    pub fn symbol(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id.0 as usize)
    }
}

/// Static value kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int,
    Float,
    Text,
    Bool,
    Void,
}

impl ValueType {
    /// Number of 8-byte words a value of this type occupies
    pub fn words(self) -> u32 {
        match self {
            ValueType::Text => 2,
            ValueType::Void => 0,
            _ => 1,
        }
    }

    /// Int and Bool share the integer register path
    pub fn is_integral(self) -> bool {
        matches!(self, ValueType::Int | ValueType::Bool)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Int => write!(f, "int"),
            ValueType::Float => write!(f, "float"),
            ValueType::Text => write!(f, "text"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::Void => write!(f, "void"),
        }
    }
}

/// Stable identity of a symbol (index into [`Program::symbols`])
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolId(pub u32);

/// Where a variable lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Storage {
    /// Frame slot of the enclosing function
    Local { slot: u32 },
    /// Index into the program's global variables
    Global { index: u32 },
}

/// A resolved variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub ty: ValueType,
    pub storage: Storage,
}

/// An expression with its static type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: ValueType,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Null,
    Var(SymbolId),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call {
        callee: Callee,
        args: Vec<Expr>,
    },
    Assign {
        target: SymbolId,
        value: Box<Expr>,
    },
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Logical
    And,
    Or,

    // Bitwise
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
        };
        write!(f, "{}", s)
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

/// Call target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    Builtin(Builtin),
    Function(String),
}

/// Builtins lowered to runtime helpers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Builtin {
    Print,
}

/// A statement with its source location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StmtKind {
    Let {
        var: SymbolId,
        #[serde(default)]
        init: Option<Expr>,
    },
    Expr(Expr),
    If {
        branches: Vec<CondBranch>,
        #[serde(default)]
        else_body: Option<Vec<Stmt>>,
    },
    While {
        #[serde(default)]
        label: Option<String>,
        cond: Expr,
        body: Vec<Stmt>,
    },
    /// Counted loop: `var` runs from `start` towards `end` by `step` (default 1)
    For {
        #[serde(default)]
        label: Option<String>,
        var: SymbolId,
        start: Expr,
        end: Expr,
        #[serde(default)]
        step: Option<Expr>,
        #[serde(default)]
        inclusive: bool,
        body: Vec<Stmt>,
    },
    Break {
        #[serde(default)]
        label: Option<String>,
    },
    Continue {
        #[serde(default)]
        label: Option<String>,
    },
    Return(Option<Expr>),
    Block(Vec<Stmt>),
    Function(FunctionDecl),
}

/// One `if` / `else if` arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondBranch {
    pub cond: Expr,
    pub body: Vec<Stmt>,
}

/// A top-level function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<SymbolId>,
    pub ret: ValueType,
    pub body: Vec<Stmt>,
}

/// Source location span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(start: usize, end: usize, line: usize, column: usize) -> Self {
        Self {
            start,
            end,
            line,
            column,
        }
    }
}

// Builders for hand-assembled trees (tests, demos)
impl Expr {
    pub fn new(kind: ExprKind, ty: ValueType) -> Self {
        Self {
            kind,
            ty,
            span: Span::default(),
        }
    }

    pub fn int(value: i64) -> Self {
        Self::new(ExprKind::Int(value), ValueType::Int)
    }

    pub fn float(value: f64) -> Self {
        Self::new(ExprKind::Float(value), ValueType::Float)
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::new(ExprKind::Text(value.into()), ValueType::Text)
    }

    pub fn boolean(value: bool) -> Self {
        Self::new(ExprKind::Bool(value), ValueType::Bool)
    }

    pub fn var(id: SymbolId, ty: ValueType) -> Self {
        Self::new(ExprKind::Var(id), ty)
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr, ty: ValueType) -> Self {
        Self::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
        )
    }

    pub fn unary(op: UnaryOp, operand: Expr, ty: ValueType) -> Self {
        Self::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
        )
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>, ty: ValueType) -> Self {
        Self::new(
            ExprKind::Call {
                callee: Callee::Function(name.into()),
                args,
            },
            ty,
        )
    }

    pub fn print(arg: Expr) -> Self {
        Self::new(
            ExprKind::Call {
                callee: Callee::Builtin(Builtin::Print),
                args: vec![arg],
            },
            ValueType::Void,
        )
    }

    pub fn assign(target: SymbolId, value: Expr) -> Self {
        let ty = value.ty;
        Self::new(
            ExprKind::Assign {
                target,
                value: Box::new(value),
            },
            ty,
        )
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        Self {
            kind,
            span: Span::default(),
        }
    }

    pub fn expr(expr: Expr) -> Self {
        Self::new(StmtKind::Expr(expr))
    }

    pub fn print(arg: Expr) -> Self {
        Self::expr(Expr::print(arg))
    }

    pub fn let_(var: SymbolId, init: Option<Expr>) -> Self {
        Self::new(StmtKind::Let { var, init })
    }

    pub fn ret(value: Option<Expr>) -> Self {
        Self::new(StmtKind::Return(value))
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_display() {
        assert_eq!(ValueType::Int.to_string(), "int");
        assert_eq!(ValueType::Text.to_string(), "text");
    }

    #[test]
    fn test_type_words() {
        assert_eq!(ValueType::Text.words(), 2);
        assert_eq!(ValueType::Float.words(), 1);
        assert_eq!(ValueType::Void.words(), 0);
    }

    #[test]
    fn test_op_display() {
        assert_eq!(BinaryOp::Shl.to_string(), "<<");
        assert!(BinaryOp::Le.is_comparison());
        assert!(!BinaryOp::And.is_comparison());
    }

    #[test]
    fn test_declare_assigns_sequential_ids() {
        let mut program = Program::new();
        let a = program.declare("a", ValueType::Int, Storage::Local { slot: 0 });
        let b = program.declare("b", ValueType::Text, Storage::Global { index: 0 });
        assert_eq!(a, SymbolId(0));
        assert_eq!(b, SymbolId(1));
        assert_eq!(program.symbol(b).map(|s| s.ty), Some(ValueType::Text));
        assert!(program.symbol(SymbolId(7)).is_none());
    }

    #[test]
    fn test_json_shape() {
        let json = r#"{
            "symbols": [{"name": "x", "ty": "int", "storage": {"local": {"slot": 0}}}],
            "items": [
                {"kind": {"let": {"var": 0, "init": {"kind": {"int": 2}, "ty": "int"}}}},
                {"kind": {"expr": {
                    "kind": {"call": {"callee": {"builtin": "print"}, "args": [
                        {"kind": {"var": 0}, "ty": "int"}
                    ]}},
                    "ty": "void"
                }}}
            ]
        }"#;
        let program = Program::from_json(json).unwrap();
        assert_eq!(program.items.len(), 2);
        assert_eq!(program.items[1], Stmt::print(Expr::var(SymbolId(0), ValueType::Int)));
    }

    #[test]
    fn test_json_round_trip() {
        let mut program = Program::new();
        let x = program.declare("x", ValueType::Float, Storage::Global { index: 0 });
        program.items.push(Stmt::let_(x, Some(Expr::float(1.5))));
        let json = program.to_json().unwrap();
        let back = Program::from_json(&json).unwrap();
        assert_eq!(back.items, program.items);
        assert_eq!(back.symbols, program.symbols);
    }

    #[test]
    fn test_malformed_json_is_input_error() {
        let err = Program::from_json("{\"items\": 3}").unwrap_err();
        assert!(matches!(err, CompileError::InvalidInput { .. }));
    }
}
