//! Token kinds.

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Eof,
    Ident,
    Number,
    String,
    FString,

    // Arithmetic
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    StarStar, // **
    StarPlus, // *+  fused multiply-add

    // Bitwise
    PipeB,       // |b
    AmpB,        // &b
    CaretB,      // ^b
    TildeB,      // ~b
    ShlB,        // <<b
    ShrB,        // >>b

    // Comparison
    Lt,
    Lte,
    Gt,
    Gte,
    EqEq,
    NotEq,

    // Logical (word keywords also map here)
    // handled via keyword table: and, or, xor, not

    // Shift/rotate word-ops: shl shr rol ror (word keywords)

    // Range
    DotDotLt, // ..<
    DotDotEq, // ..=

    // Cons
    ColonColon, // ::

    // Assignment
    Eq,          // =
    ColonEq,     // :=
    LArrow,      // <-
    EqEqArrow,   // ==>
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    StarStarEq,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,

    // Pipe family
    Pipe,    // |
    PipePipe, // ||
    PipePipePipe, // |||

    // At-markers
    At,       // @
    AtAt,     // @@
    AtPlusPlus, // @++
    AtI(u32),     // @i1..@i9 (level)
    AtLabel(u32), // @1..@9 bare continue/break target
    AtFirst,
    AtLast,
    AtCounter,

    // Arrows
    Arrow,    // -> (match guard/result separator)
    FatArrow, // =>
    TildeArrow, // ~>
    LEqEq,    // <==  send

    // Hash length
    Hash,
    // Head/tail
    Amp,   // & tail
    Caret, // ^ head
    PlusPlus,   // ++ (prefix/postfix)
    MinusMinus, // --
    Not,        // unary `not`
    Dot,        // .

    // Newline / separator
    Newline,

    // or! error propagation
    OrBang,

    // Contextual keywords
    KwIn,
    KwFor,
    KwBreak,
    KwContinue,
    KwAnd,
    KwOr,
    KwXor,
    KwNot,
    KwShl,
    KwShr,
    KwRol,
    KwRor,
    KwMax,
    KwInf,
    KwImport,
    KwUse,
    KwAs,
    KwAlias,
    KwArena,
    KwDefer,
    KwSpawn,
    KwUnsafe,
    KwCstruct,
    KwPacked,
    KwAligned,
    KwRet,
    KwErr,
    KwHot,
    KwFrom,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, line: usize) -> Self {
        Token { kind, text: text.into(), line }
    }
}

/// The fixed keyword table identifiers are promoted against.
pub fn lookup_keyword(ident: &str) -> Option<TokenKind> {
    use TokenKind::*;
    Some(match ident {
        "in" => KwIn,
        "for" => KwFor,
        "break" => KwBreak,
        "continue" => KwContinue,
        "and" => KwAnd,
        "or" => KwOr,
        "xor" => KwXor,
        "not" => KwNot,
        "shl" => KwShl,
        "shr" => KwShr,
        "rol" => KwRol,
        "ror" => KwRor,
        "max" => KwMax,
        "inf" => KwInf,
        "import" => KwImport,
        "use" => KwUse,
        "as" => KwAs,
        "alias" => KwAlias,
        "arena" => KwArena,
        "defer" => KwDefer,
        "spawn" => KwSpawn,
        "unsafe" => KwUnsafe,
        "cstruct" => KwCstruct,
        "packed" => KwPacked,
        "aligned" => KwAligned,
        "ret" => KwRet,
        "err" => KwErr,
        "hot" => KwHot,
        "from" => KwFrom,
        _ => return None,
    })
}
