//! The Flap abstract syntax tree.
//!
//! Represented as an explicit sum type rather than runtime-checked
//! interface dispatch: `Stmt` and
//! `Expr` are exhaustively matched everywhere a traversal needs to touch
//! every variant (closure analysis, inlining, the symbol collector, the
//! expression/statement compilers), so adding a new variant is a
//! compile-time omission error rather than a silently-skipped case.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutKind {
    /// `=` — immutable definition.
    Immutable,
    /// `:=` — mutable definition.
    Mutable,
    /// `<-` — update of an existing mutable binding.
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign {
        name: String,
        value: Expr,
        kind: MutKind,
        compound_op: Option<CompoundOp>,
        precision: Option<String>,
        hot: bool,
        is_update: bool,
        line: usize,
    },
    ExpressionStmt(Expr),
    Loop {
        iterator: String,
        iterable: Expr,
        body: Vec<Stmt>,
        max_iterations: Option<MaxClause>,
        needs_runtime_max_check: bool,
        thread_count: Option<ThreadCount>,
        reducer: Option<Reducer>,
        base_stack_offset: i32,
        label: u32,
        line: usize,
    },
    ReceiveLoop {
        msg_var: String,
        sender_var: String,
        address: Expr,
        body: Vec<Stmt>,
        base_stack_offset: i32,
        line: usize,
    },
    Jump {
        is_break: bool,
        loop_label: Option<u32>,
        value: Option<Expr>,
        line: usize,
    },
    Arena {
        body: Vec<Stmt>,
        line: usize,
    },
    Defer {
        call: Expr,
        line: usize,
    },
    Spawn {
        expr: Expr,
        pipe_params: Option<Vec<String>>,
        pipe_block: Option<Vec<Stmt>>,
        line: usize,
    },
    Alias {
        new_name: String,
        target_kind: crate::token::TokenKind,
        line: usize,
    },
    Import {
        url_or_lib: String,
        version: Option<String>,
        alias: Option<String>,
        is_c_library: bool,
        so_path: Option<String>,
        line: usize,
    },
    CStructDecl {
        name: String,
        fields: Vec<CStructField>,
        packed: bool,
        alignment: Option<u32>,
        computed_size: u32,
        line: usize,
    },
    Use {
        path: String,
        line: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaxClause {
    Literal(u64),
    Inf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThreadCount {
    CpuCount,
    Literal(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reducer {
    pub params: (String, String),
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CStructField {
    pub name: String,
    pub type_name: String,
    pub size: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    FusedMulAdd,
    Shl,
    Shr,
    Rol,
    Ror,
    BitOr,
    BitAnd,
    BitXor,
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    NotEq,
    And,
    Or,
    Xor,
    In,
    Cons,
    ErrorPropagate, // or!
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
    PreIncr,
    PreDecr,
    Head, // ^
    Tail, // &
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOp {
    Incr,
    Decr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Literal(Expr),
    Bind(String),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatternClause {
    pub patterns: Vec<Pattern>,
    pub body: Box<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchClause {
    pub guard: Option<Expr>,
    pub result: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FStringPart {
    pub literal: String,
    pub expr: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Box<Expr>,
    pub captured_vars: Vec<String>,
    pub is_nested: bool,
    pub is_pure: bool,
    pub hot: bool,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsafeArch {
    X86_64,
    Arm64,
    RiscV64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnsafeStmt {
    RegisterAssign { register: String, rhs: Box<Expr> },
    MemoryLoad { size: u8, base_register: String, offset: i32 },
    MemoryStore { size: u8, base_register: String, offset: i32, value: Box<Expr> },
    RegisterOp { lhs: String, op: BinOp, rhs: String },
    Syscall,
    UnsafeReturn { register: String, as_type: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnsafeBlock {
    pub per_arch: BTreeMap<UnsafeArch, Vec<UnsafeStmt>>,
    pub per_arch_return_register: BTreeMap<UnsafeArch, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    String(String),
    FString(Vec<FStringPart>),
    Ident(String),
    NamespacedIdent(String, String),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Unary(UnOp, Box<Expr>),
    Postfix(PostOp, Box<Expr>),
    Cast(Box<Expr>, String),
    Range(Box<Expr>, Box<Expr>, bool /* inclusive */),
    List(Vec<Expr>),
    Map(Vec<Expr>, Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Slice {
        collection: Box<Expr>,
        start: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
    },
    Length(Box<Expr>),
    Lambda(Lambda),
    PatternLambda(Vec<PatternClause>),
    MultiLambda(Vec<Lambda>),
    DirectCall {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        recursion_limit: Option<MaxClause>,
        needs_recursion_check: bool,
        line: usize,
    },
    Match {
        condition: Box<Expr>,
        clauses: Vec<MatchClause>,
        default_expr: Box<Expr>,
        default_is_explicit: bool,
    },
    Block(Vec<Stmt>),
    Pipe(Box<Expr>, Box<Expr>),
    Parallel(Box<Expr>, Box<Expr>),
    ConcurrentGather(Box<Expr>, Box<Expr>),
    Send(Box<Expr>, Box<Expr>),
    Unsafe(UnsafeBlock),
    Vector(Vec<Expr>, u8),
    LoopState(LoopStateKind, u32),
    JumpExpr {
        label: Option<u32>,
        value: Option<Box<Expr>>,
        is_break: bool,
    },
    In(Box<Expr>, Box<Expr>),
    StructLiteral {
        name: String,
        fields: Vec<(String, Expr)>,
    },
    ArenaExpr(Vec<Stmt>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStateKind {
    First,
    Last,
    Counter,
    I,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }
}
