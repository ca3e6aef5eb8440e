//! Recursive-descent parser with explicit operator-precedence climbing.
//!
//! Precedence, lowest to highest: `or!` propagation, `|||` concurrent
//! gather, `|` pipe, `<==` send, `||` parallel-map, `or`/`xor`, `and`,
//! `in`/comparisons, range, `::` cons (right-assoc), additive, bitwise,
//! multiplicative, `**` power (right-assoc), unary, postfix. Each level
//! is one method that calls down to the next-tighter level before
//! looking for its own operator.

use crate::ast::*;
use crate::error::{ParseError, SourceError};
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: PathBuf,
    source: String,
    loop_depth: u32,
    next_label: u32,
    /// Uppercase-named immutable literal bindings, substituted at every
    /// reference point.
    constants: HashMap<String, Expr>,
    /// `alias foo = @` makes `foo` behave as `@` in subsequent parses.
    aliases: HashMap<String, TokenKind>,
    in_lambda_name: Vec<String>,
}

/// A restorable position, used by speculative-mode lambda disambiguation.
struct Checkpoint {
    pos: usize,
}

impl Parser {
    pub fn from_source(source: &str, file: &Path) -> Result<Self, ParseError> {
        let tokens = Lexer::new(source, file)
            .tokenize()
            .map_err(|e| ParseError(e.0))?;
        Ok(Parser {
            tokens,
            pos: 0,
            file: file.to_path_buf(),
            source: source.to_string(),
            loop_depth: 0,
            next_label: 1,
            constants: HashMap::new(),
            aliases: HashMap::new(),
            in_lambda_name: Vec::new(),
        })
    }

    fn from_tokens(tokens: Vec<Token>, file: PathBuf, source: String) -> Self {
        Parser {
            tokens,
            pos: 0,
            file,
            source,
            loop_depth: 0,
            next_label: 1,
            constants: HashMap::new(),
            aliases: HashMap::new(),
            in_lambda_name: Vec::new(),
        }
    }

    pub fn parse_program(&mut self) -> Result<Program, ParseError> {
        let mut statements = Vec::new();
        self.skip_separators();
        while !self.at_end() {
            statements.push(self.parse_statement()?);
            self.skip_separators();
        }
        Ok(Program { statements })
    }

    // ---- token plumbing ----

    fn at_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.effective_kind(self.peek())
    }

    fn peek_at(&self, offset: usize) -> TokenKind {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        self.effective_kind(&self.tokens[idx])
    }

    /// Resolves an `alias`-table indirection: an `Ident` token whose text
    /// was aliased to another token kind is treated as that kind.
    fn effective_kind(&self, tok: &Token) -> TokenKind {
        if tok.kind == TokenKind::Ident {
            if let Some(aliased) = self.aliases.get(&tok.text) {
                return aliased.clone();
            }
        }
        tok.kind.clone()
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if self.check(kind.clone()) {
            Ok(self.advance())
        } else {
            Err(self.err(format!(
                "expected {:?}, found {:?} ('{}')",
                kind,
                self.peek_kind(),
                self.peek().text
            )))
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn skip_one_separator_or_comma(&mut self) {
        if matches!(
            self.peek_kind(),
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::Comma
        ) {
            self.advance();
        }
        self.skip_separators();
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint { pos: self.pos }
    }

    fn restore(&mut self, cp: Checkpoint) {
        self.pos = cp.pos;
    }

    fn current_line(&self) -> usize {
        self.peek().line
    }

    fn source_line(&self, line: usize) -> String {
        self.source.lines().nth(line).unwrap_or("").to_string()
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        ParseError(SourceError {
            file: self.file.clone(),
            line: self.current_line(),
            column: 0,
            source_line: self.source_line(self.current_line()),
            message: message.into(),
        })
    }

    // ---- statements ----

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        match self.peek_kind() {
            TokenKind::KwHot => {
                self.advance();
                self.parse_assignment(true)
            }
            TokenKind::KwBreak => {
                self.advance();
                Ok(Stmt::Jump { is_break: true, loop_label: None, value: None, line })
            }
            TokenKind::KwContinue => {
                self.advance();
                Ok(Stmt::Jump { is_break: false, loop_label: None, value: None, line })
            }
            TokenKind::AtLabel(n) => {
                self.advance();
                let value = self.maybe_parse_jump_value()?;
                Ok(Stmt::Jump { is_break: false, loop_label: Some(n), value, line })
            }
            TokenKind::KwRet => {
                self.advance();
                let loop_label = if let TokenKind::AtLabel(n) = self.peek_kind() {
                    self.advance();
                    Some(n)
                } else {
                    None
                };
                let value = self.maybe_parse_jump_value()?;
                Ok(Stmt::Jump { is_break: true, loop_label, value, line })
            }
            TokenKind::KwArena => {
                self.advance();
                let body = self.parse_block_body()?;
                Ok(Stmt::Arena { body, line })
            }
            TokenKind::KwDefer => {
                self.advance();
                let call = self.parse_expr()?;
                Ok(Stmt::Defer { call, line })
            }
            TokenKind::KwSpawn => {
                self.advance();
                let expr = self.parse_expr()?;
                Ok(Stmt::Spawn { expr, pipe_params: None, pipe_block: None, line })
            }
            TokenKind::KwAlias => {
                self.advance();
                let new_name = self.expect(TokenKind::Ident)?.text;
                self.expect(TokenKind::Eq)?;
                let target_kind = self.peek_kind();
                self.advance();
                self.aliases.insert(new_name.clone(), target_kind.clone());
                Ok(Stmt::Alias { new_name, target_kind, line })
            }
            TokenKind::KwImport => self.parse_import(line),
            TokenKind::KwUse => {
                self.advance();
                let path = self.expect(TokenKind::String)?.text;
                Ok(Stmt::Use { path, line })
            }
            TokenKind::KwCstruct => self.parse_cstruct(line),
            TokenKind::At | TokenKind::AtAt => self.parse_loop(line),
            TokenKind::Number
                if matches!(self.peek_at(1), TokenKind::At) =>
            {
                self.parse_loop(line)
            }
            TokenKind::Ident
                if matches!(
                    self.peek_at(1),
                    TokenKind::Eq
                        | TokenKind::ColonEq
                        | TokenKind::LArrow
                        | TokenKind::PlusEq
                        | TokenKind::MinusEq
                        | TokenKind::StarEq
                        | TokenKind::SlashEq
                        | TokenKind::PercentEq
                        | TokenKind::StarStarEq
                ) =>
            {
                self.parse_assignment(false)
            }
            _ => Ok(Stmt::ExpressionStmt(self.parse_expr()?)),
        }
    }

    fn maybe_parse_jump_value(&mut self) -> Result<Option<Expr>, ParseError> {
        if matches!(
            self.peek_kind(),
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::Eof | TokenKind::RBrace
        ) {
            Ok(None)
        } else {
            Ok(Some(self.parse_expr()?))
        }
    }

    fn parse_assignment(&mut self, hot: bool) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        let name_tok = self.expect(TokenKind::Ident)?;
        let name = name_tok.text;
        let (kind, compound_op, is_update) = match self.peek_kind() {
            TokenKind::Eq => {
                self.advance();
                (MutKind::Immutable, None, false)
            }
            TokenKind::ColonEq => {
                self.advance();
                (MutKind::Mutable, None, false)
            }
            TokenKind::LArrow => {
                self.advance();
                (MutKind::Update, None, true)
            }
            TokenKind::PlusEq => {
                self.advance();
                (MutKind::Update, Some(CompoundOp::Add), true)
            }
            TokenKind::MinusEq => {
                self.advance();
                (MutKind::Update, Some(CompoundOp::Sub), true)
            }
            TokenKind::StarEq => {
                self.advance();
                (MutKind::Update, Some(CompoundOp::Mul), true)
            }
            TokenKind::SlashEq => {
                self.advance();
                (MutKind::Update, Some(CompoundOp::Div), true)
            }
            TokenKind::PercentEq => {
                self.advance();
                (MutKind::Update, Some(CompoundOp::Mod), true)
            }
            TokenKind::StarStarEq => {
                self.advance();
                (MutKind::Update, Some(CompoundOp::Pow), true)
            }
            other => return Err(self.err(format!("expected assignment operator, found {:?}", other))),
        };

        if kind == MutKind::Immutable {
            self.in_lambda_name.push(name.clone());
        }
        let mut value = self.parse_expr()?;
        if kind == MutKind::Immutable {
            self.in_lambda_name.pop();
            name_lambda(&mut value, &name);
        }

        if kind == MutKind::Immutable && hot {
            name_hot(&mut value);
        }

        if kind == MutKind::Immutable && is_uppercase_name(&name) && is_literal_value(&value) {
            self.constants.insert(name.clone(), value.clone());
        }

        Ok(Stmt::Assign {
            name,
            value,
            kind,
            compound_op,
            precision: None,
            hot,
            is_update,
            line,
        })
    }

    fn parse_import(&mut self, line: usize) -> Result<Stmt, ParseError> {
        self.advance(); // `import`
        let is_c_library = self.check(TokenKind::Ident) && self.peek().text == "c";
        if is_c_library {
            self.advance();
        }
        let url_or_lib = self.expect(TokenKind::String)?.text;
        let mut version = None;
        let mut alias = None;
        let mut so_path = None;
        loop {
            match self.peek_kind() {
                TokenKind::KwAs => {
                    self.advance();
                    alias = Some(self.expect(TokenKind::Ident)?.text);
                }
                TokenKind::KwFrom => {
                    self.advance();
                    so_path = Some(self.expect(TokenKind::String)?.text);
                }
                TokenKind::String => {
                    version = Some(self.advance().text);
                }
                _ => break,
            }
        }
        Ok(Stmt::Import { url_or_lib, version, alias, is_c_library, so_path, line })
    }

    fn parse_cstruct(&mut self, line: usize) -> Result<Stmt, ParseError> {
        self.advance(); // `cstruct`
        let name = self.expect(TokenKind::Ident)?.text;
        let mut packed = false;
        let mut alignment = None;
        loop {
            match self.peek_kind() {
                TokenKind::KwPacked => {
                    self.advance();
                    packed = true;
                }
                TokenKind::KwAligned => {
                    self.advance();
                    self.expect(TokenKind::LParen)?;
                    let n = self.expect(TokenKind::Number)?.text;
                    alignment = Some(n.parse().unwrap_or(8));
                    self.expect(TokenKind::RParen)?;
                }
                _ => break,
            }
        }
        self.expect(TokenKind::LBrace)?;
        self.skip_separators();
        let mut fields = Vec::new();
        let mut offset = 0u32;
        while !self.check(TokenKind::RBrace) {
            let fname = self.expect(TokenKind::Ident)?.text;
            self.expect(TokenKind::Colon)?;
            let type_name = self.expect(TokenKind::Ident)?.text;
            let size = type_size(&type_name);
            fields.push(CStructField { name: fname, type_name, size, offset });
            offset += size;
            self.skip_one_separator_or_comma();
        }
        self.expect(TokenKind::RBrace)?;
        let computed_size = offset;
        Ok(Stmt::CStructDecl { name, fields, packed, alignment, computed_size, line })
    }

    fn parse_loop(&mut self, line: usize) -> Result<Stmt, ParseError> {
        let thread_count = match self.peek_kind() {
            TokenKind::Number => {
                let n = self.advance().text.parse().unwrap_or(1);
                self.expect(TokenKind::At)?;
                Some(ThreadCount::Literal(n))
            }
            TokenKind::AtAt => {
                self.advance();
                Some(ThreadCount::CpuCount)
            }
            TokenKind::At => {
                self.advance();
                None
            }
            _ => unreachable!("parse_loop called on a non-loop token"),
        };

        let first_ident = self.expect(TokenKind::Ident)?.text;
        if thread_count.is_none() && self.check(TokenKind::Comma) {
            self.advance();
            let sender_var = self.expect(TokenKind::Ident)?.text;
            self.expect(TokenKind::KwIn)?;
            let address = self.parse_expr()?;
            let body = self.parse_block_body()?;
            return Ok(Stmt::ReceiveLoop {
                msg_var: first_ident,
                sender_var,
                address,
                body,
                base_stack_offset: 0,
                line,
            });
        }

        self.expect(TokenKind::KwIn)?;
        let iterable = self.parse_expr()?;
        self.loop_depth += 1;
        let label = self.next_label;
        self.next_label += 1;
        let body = self.parse_block_body()?;
        self.loop_depth -= 1;

        let max_iterations = if self.check(TokenKind::KwMax) {
            self.advance();
            if self.eat(TokenKind::KwInf) {
                Some(MaxClause::Inf)
            } else {
                let n = self.expect(TokenKind::Number)?.text;
                Some(MaxClause::Literal(n.parse().unwrap_or(0)))
            }
        } else {
            None
        };
        let needs_runtime_max_check = !is_literal_range(&iterable);
        if needs_runtime_max_check && max_iterations.is_none() {
            return Err(self.err(format!(
                "loop over a non-literal range needs an explicit 'max N' or 'max inf' clause (iterator '{first_ident}')"
            )));
        }

        let reducer = if self.check(TokenKind::Pipe) {
            self.advance();
            let a = self.expect(TokenKind::Ident)?.text;
            self.expect(TokenKind::Comma)?;
            let b = self.expect(TokenKind::Ident)?.text;
            self.expect(TokenKind::Pipe)?;
            let body = self.parse_block_body()?;
            Some(Reducer { params: (a, b), body })
        } else {
            None
        };

        Ok(Stmt::Loop {
            iterator: first_ident,
            iterable,
            body,
            max_iterations,
            needs_runtime_max_check,
            thread_count,
            reducer,
            base_stack_offset: 0,
            label,
            line,
        })
    }

    fn parse_block_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect(TokenKind::LBrace)?;
        self.skip_separators();
        let mut stmts = Vec::new();
        while !self.check(TokenKind::RBrace) {
            stmts.push(self.parse_statement()?);
            self.skip_separators();
        }
        self.expect(TokenKind::RBrace)?;
        Ok(stmts)
    }

    // ---- expressions: precedence climbing ----

    pub fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        if let Some(lambda) = self.try_parse_lambda()? {
            return Ok(lambda);
        }
        self.parse_error_propagate()
    }

    fn parse_error_propagate(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_concurrent_gather()?;
        if self.check(TokenKind::OrBang) {
            self.advance();
            let rhs = self.parse_error_propagate()?;
            return Ok(Expr::Binary(BinOp::ErrorPropagate, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_concurrent_gather(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_pipe()?;
        while self.check(TokenKind::PipePipePipe) {
            self.advance();
            let rhs = self.parse_pipe()?;
            lhs = Expr::ConcurrentGather(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_pipe(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_send()?;
        while self.check(TokenKind::Pipe) {
            self.advance();
            let rhs = self.parse_send()?;
            lhs = Expr::Pipe(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_send(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_parallel_map()?;
        while self.check(TokenKind::LEqEq) {
            self.advance();
            let rhs = self.parse_parallel_map()?;
            lhs = Expr::Send(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_parallel_map(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_or_xor()?;
        while self.check(TokenKind::PipePipe) {
            self.advance();
            let rhs = self.parse_or_xor()?;
            lhs = Expr::Parallel(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_or_xor(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::KwOr => BinOp::Or,
                TokenKind::KwXor => BinOp::Xor,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_comparison()?;
        while self.check(TokenKind::KwAnd) {
            self.advance();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_range()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Lte => BinOp::Lte,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Gte => BinOp::Gte,
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::NotEq => BinOp::NotEq,
                TokenKind::KwIn => BinOp::In,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_range()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_range(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_cons()?;
        let inclusive = match self.peek_kind() {
            TokenKind::DotDotLt => false,
            TokenKind::DotDotEq => true,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_cons()?;
        Ok(Expr::Range(Box::new(lhs), Box::new(rhs), inclusive))
    }

    fn parse_cons(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_additive()?;
        if self.check(TokenKind::ColonColon) {
            self.advance();
            let rhs = self.parse_cons()?; // right-associative
            return Ok(Expr::Binary(BinOp::Cons, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_bitwise()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_bitwise()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_bitwise(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::KwShl => BinOp::Shl,
                TokenKind::KwShr => BinOp::Shr,
                TokenKind::KwRol => BinOp::Rol,
                TokenKind::KwRor => BinOp::Ror,
                TokenKind::PipeB => BinOp::BitOr,
                TokenKind::AmpB => BinOp::BitAnd,
                TokenKind::CaretB => BinOp::BitXor,
                TokenKind::ShlB => BinOp::Shl,
                TokenKind::ShrB => BinOp::Shr,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_power()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                TokenKind::StarPlus => BinOp::FusedMulAdd,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_power()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_unary()?;
        if self.check(TokenKind::StarStar) {
            self.advance();
            let rhs = self.parse_power()?; // right-associative
            return Ok(Expr::Binary(BinOp::Pow, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek_kind() {
            TokenKind::Minus => Some(UnOp::Neg),
            TokenKind::KwNot => Some(UnOp::Not),
            TokenKind::TildeB => Some(UnOp::BitNot),
            TokenKind::PlusPlus => Some(UnOp::PreIncr),
            TokenKind::MinusMinus => Some(UnOp::PreDecr),
            TokenKind::Caret => Some(UnOp::Head),
            TokenKind::Amp => Some(UnOp::Tail),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary(op, Box::new(operand)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_kind() {
                TokenKind::LBracket => {
                    self.advance();
                    expr = self.parse_index_or_slice(expr)?;
                }
                TokenKind::LParen => {
                    self.advance();
                    let args = self.parse_call_args()?;
                    expr = self.finish_call(expr, args)?;
                }
                TokenKind::Dot => {
                    self.advance();
                    let field = self.expect(TokenKind::Ident)?.text;
                    if let Expr::Ident(ns) = &expr {
                        expr = Expr::NamespacedIdent(ns.clone(), field);
                    } else {
                        expr = Expr::Index(Box::new(expr), Box::new(Expr::String(field)));
                    }
                }
                TokenKind::KwAs => {
                    self.advance();
                    let ty = self.expect(TokenKind::Ident)?.text;
                    expr = Expr::Cast(Box::new(expr), ty);
                }
                TokenKind::PlusPlus => {
                    self.advance();
                    expr = Expr::Postfix(PostOp::Incr, Box::new(expr));
                }
                TokenKind::MinusMinus => {
                    self.advance();
                    expr = Expr::Postfix(PostOp::Decr, Box::new(expr));
                }
                TokenKind::LBrace if is_match_subject(&expr) => {
                    expr = self.parse_match_block(expr)?;
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_index_or_slice(&mut self, collection: Expr) -> Result<Expr, ParseError> {
        if self.check(TokenKind::Colon) {
            return self.parse_slice_tail(collection, None);
        }
        let first = self.parse_expr()?;
        if self.check(TokenKind::Colon) {
            return self.parse_slice_tail(collection, Some(first));
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::Index(Box::new(collection), Box::new(first)))
    }

    fn parse_slice_tail(&mut self, collection: Expr, start: Option<Expr>) -> Result<Expr, ParseError> {
        self.expect(TokenKind::Colon)?;
        let end = if self.check(TokenKind::Colon) || self.check(TokenKind::RBracket) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        let step = if self.eat(TokenKind::Colon) {
            if self.check(TokenKind::RBracket) {
                None
            } else {
                Some(self.parse_expr()?)
            }
        } else {
            None
        };
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::Slice {
            collection: Box::new(collection),
            start: start.map(Box::new),
            end: end.map(Box::new),
            step: step.map(Box::new),
        })
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.check(TokenKind::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat(TokenKind::Comma) {
                continue;
            }
            break;
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    fn finish_call(&mut self, callee: Expr, args: Vec<Expr>) -> Result<Expr, ParseError> {
        let line = self.current_line();
        let recursion_limit = if self.check(TokenKind::KwMax) {
            self.advance();
            if self.eat(TokenKind::KwInf) {
                Some(MaxClause::Inf)
            } else {
                let n = self.expect(TokenKind::Number)?.text;
                Some(MaxClause::Literal(n.parse().unwrap_or(0)))
            }
        } else {
            None
        };
        match callee {
            Expr::Ident(name) => {
                let needs_recursion_check =
                    self.in_lambda_name.last().map(|n| n == &name).unwrap_or(false);
                Ok(Expr::Call { name, args, recursion_limit, needs_recursion_check, line })
            }
            Expr::NamespacedIdent(ns, fname) => Ok(Expr::Call {
                name: format!("{}.{}", ns, fname),
                args,
                recursion_limit,
                needs_recursion_check: false,
                line,
            }),
            other => Ok(Expr::DirectCall { callee: Box::new(other), args }),
        }
    }

    fn parse_match_block(&mut self, condition: Expr) -> Result<Expr, ParseError> {
        self.expect(TokenKind::LBrace)?;
        self.skip_separators();
        let mut clauses = Vec::new();
        let mut default_expr: Option<Expr> = None;
        let mut default_is_explicit = false;
        while !self.check(TokenKind::RBrace) {
            if self.check(TokenKind::TildeArrow) {
                if default_is_explicit {
                    return Err(self.err("match block may have at most one explicit default"));
                }
                self.advance();
                default_expr = Some(self.parse_expr()?);
                default_is_explicit = true;
                self.skip_one_separator_or_comma();
                continue;
            }
            let head = self.parse_expr()?;
            if self.check(TokenKind::Arrow) || self.check(TokenKind::FatArrow) {
                self.advance();
                let result = self.parse_expr()?;
                clauses.push(MatchClause { guard: Some(head), result });
            } else {
                // `condition { result ~> default }` sugar: a bare clause
                // with no `->`/`=>` separator tests `condition` itself for
                // truthiness rather than comparing it against a literal.
                clauses.push(MatchClause { guard: None, result: head });
            }
            self.skip_one_separator_or_comma();
        }
        self.expect(TokenKind::RBrace)?;
        let default_expr = default_expr.unwrap_or(Expr::Number(0.0));
        Ok(Expr::Match {
            condition: Box::new(condition),
            clauses,
            default_expr: Box::new(default_expr),
            default_is_explicit,
        })
    }

    // ---- primary & lambda ----

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let line = self.current_line();
        match self.peek_kind() {
            TokenKind::Number => {
                let text = self.advance().text;
                Ok(Expr::Number(parse_number_literal(&text)))
            }
            TokenKind::String => Ok(Expr::String(self.advance().text)),
            TokenKind::FString => {
                let text = self.advance().text;
                let parts = self.parse_fstring_parts(&text, line)?;
                Ok(Expr::FString(parts))
            }
            TokenKind::Hash => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr::Length(Box::new(operand)))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => self.parse_list_literal(),
            TokenKind::LBrace => self.parse_map_literal(),
            TokenKind::KwArena => {
                self.advance();
                let body = self.parse_block_body()?;
                Ok(Expr::ArenaExpr(body))
            }
            TokenKind::KwUnsafe => self.parse_unsafe_block(),
            TokenKind::AtI(level) => {
                self.advance();
                Ok(Expr::LoopState(LoopStateKind::I, level))
            }
            TokenKind::AtFirst => {
                self.advance();
                Ok(Expr::LoopState(LoopStateKind::First, 0))
            }
            TokenKind::AtLast => {
                self.advance();
                Ok(Expr::LoopState(LoopStateKind::Last, 0))
            }
            TokenKind::AtCounter => {
                self.advance();
                Ok(Expr::LoopState(LoopStateKind::Counter, 0))
            }
            TokenKind::AtLabel(n) => {
                self.advance();
                let value = self.maybe_parse_jump_value()?;
                Ok(Expr::JumpExpr { label: Some(n), value: value.map(Box::new), is_break: false })
            }
            TokenKind::KwRet => {
                self.advance();
                let label = if let TokenKind::AtLabel(n) = self.peek_kind() {
                    self.advance();
                    Some(n)
                } else {
                    None
                };
                let value = self.maybe_parse_jump_value()?;
                Ok(Expr::JumpExpr { label, value: value.map(Box::new), is_break: true })
            }
            TokenKind::Ident => {
                let name = self.advance().text;
                if let Some(literal) = self.constants.get(&name) {
                    return Ok(literal.clone());
                }
                Ok(Expr::Ident(name))
            }
            other => Err(self.err(format!("unexpected token {:?} in expression position", other))),
        }
    }

    fn parse_list_literal(&mut self) -> Result<Expr, ParseError> {
        self.advance(); // `[`
        self.skip_separators();
        let mut elements = Vec::new();
        while !self.check(TokenKind::RBracket) {
            elements.push(self.parse_expr()?);
            self.skip_one_separator_or_comma();
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Expr::List(elements))
    }

    fn parse_map_literal(&mut self) -> Result<Expr, ParseError> {
        self.advance(); // `{`
        self.skip_separators();
        let mut keys = Vec::new();
        let mut values = Vec::new();
        while !self.check(TokenKind::RBrace) {
            let key = self.parse_expr()?;
            self.expect(TokenKind::Colon)?;
            let value = self.parse_expr()?;
            keys.push(key);
            values.push(value);
            self.skip_one_separator_or_comma();
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::Map(keys, values))
    }

    fn parse_unsafe_block(&mut self) -> Result<Expr, ParseError> {
        self.advance(); // `unsafe`
        self.expect(TokenKind::LBrace)?;
        self.skip_separators();
        let mut per_arch = std::collections::BTreeMap::new();
        let mut per_arch_return_register = std::collections::BTreeMap::new();
        while !self.check(TokenKind::RBrace) {
            let arch_name = self.expect(TokenKind::Ident)?.text;
            let arch = match arch_name.as_str() {
                "x86_64" => UnsafeArch::X86_64,
                "arm64" => UnsafeArch::Arm64,
                "riscv64" => UnsafeArch::RiscV64,
                other => return Err(self.err(format!("unknown unsafe target architecture '{}'", other))),
            };
            let (stmts, ret) = self.parse_unsafe_arch_body()?;
            per_arch.insert(arch, stmts);
            if let Some(r) = ret {
                per_arch_return_register.insert(arch, r);
            }
            self.skip_separators();
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Expr::Unsafe(UnsafeBlock { per_arch, per_arch_return_register }))
    }

    fn parse_unsafe_arch_body(&mut self) -> Result<(Vec<UnsafeStmt>, Option<String>), ParseError> {
        self.expect(TokenKind::LBrace)?;
        self.skip_separators();
        let mut stmts = Vec::new();
        let mut ret_register = None;
        while !self.check(TokenKind::RBrace) {
            if self.check(TokenKind::KwRet) {
                self.advance();
                let register = self.expect(TokenKind::Ident)?.text;
                let as_type = if self.eat(TokenKind::KwAs) {
                    Some(self.expect(TokenKind::Ident)?.text)
                } else {
                    None
                };
                ret_register = Some(register.clone());
                stmts.push(UnsafeStmt::UnsafeReturn { register, as_type });
                self.skip_separators();
                continue;
            }
            if self.peek().text == "syscall" && self.check(TokenKind::Ident) {
                self.advance();
                stmts.push(UnsafeStmt::Syscall);
                self.skip_separators();
                continue;
            }
            let reg = self.expect(TokenKind::Ident)?.text;
            if self.eat(TokenKind::Eq) {
                let rhs = self.parse_expr()?;
                stmts.push(UnsafeStmt::RegisterAssign { register: reg, rhs: Box::new(rhs) });
            } else {
                return Err(self.err(format!("unrecognized unsafe statement starting with '{}'", reg)));
            }
            self.skip_separators();
        }
        self.expect(TokenKind::RBrace)?;
        Ok((stmts, ret_register))
    }

    fn parse_fstring_parts(&self, raw: &str, line: usize) -> Result<Vec<FStringPart>, ParseError> {
        let chars: Vec<char> = raw.chars().collect();
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut i = 0;
        while i < chars.len() {
            match (chars[i], chars.get(i + 1)) {
                ('{', Some('{')) => {
                    literal.push('{');
                    i += 2;
                }
                ('}', Some('}')) => {
                    literal.push('}');
                    i += 2;
                }
                ('{', _) => {
                    let mut depth = 1;
                    let start = i + 1;
                    let mut j = start;
                    while j < chars.len() && depth > 0 {
                        match chars[j] {
                            '{' => depth += 1,
                            '}' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                        j += 1;
                    }
                    if depth != 0 {
                        return Err(ParseError(SourceError {
                            file: self.file.clone(),
                            line,
                            column: 0,
                            source_line: self.source_line(line),
                            message: "unterminated interpolation in f-string".to_string(),
                        }));
                    }
                    let fragment: String = chars[start..j].iter().collect();
                    let mut sub = Parser::from_tokens(
                        Lexer::new(&fragment, &self.file)
                            .tokenize()
                            .map_err(|e| ParseError(e.0))?,
                        self.file.clone(),
                        fragment.clone(),
                    );
                    let expr = sub.parse_expr()?;
                    parts.push(FStringPart { literal: std::mem::take(&mut literal), expr: Some(expr) });
                    i = j + 1;
                }
                (c, _) => {
                    literal.push(c);
                    i += 1;
                }
            }
        }
        parts.push(FStringPart { literal, expr: None });
        Ok(parts)
    }

    /// Probe for one of the three lambda forms. Returns `Ok(None)` (after
    /// restoring position) when the upcoming tokens do not look like a
    /// lambda at all, so the caller falls through to ordinary expression
    /// parsing.
    fn try_parse_lambda(&mut self) -> Result<Option<Expr>, ParseError> {
        if self.check(TokenKind::Ident)
            && matches!(self.peek_at(1), TokenKind::FatArrow | TokenKind::Comma)
        {
            if let Some(lambda) = self.try_bare_param_lambda()? {
                return Ok(Some(lambda));
            }
        }
        if self.check(TokenKind::LParen) {
            if let Some(pattern_lambda) = self.try_pattern_lambda()? {
                return Ok(Some(pattern_lambda));
            }
            if let Some(paren_lambda) = self.try_paren_lambda()? {
                return Ok(Some(paren_lambda));
            }
        }
        Ok(None)
    }

    fn try_bare_param_lambda(&mut self) -> Result<Option<Expr>, ParseError> {
        let cp = self.checkpoint();
        let mut params = Vec::new();
        loop {
            if !self.check(TokenKind::Ident) {
                self.restore(cp);
                return Ok(None);
            }
            params.push(self.advance().text);
            if self.eat(TokenKind::Comma) {
                continue;
            }
            break;
        }
        if !self.eat(TokenKind::FatArrow) {
            self.restore(cp);
            return Ok(None);
        }
        let body = self.parse_expr()?;
        Ok(Some(Expr::Lambda(Lambda {
            params,
            body: Box::new(body),
            captured_vars: Vec::new(),
            is_nested: false,
            is_pure: false,
            hot: false,
            name: None,
        })))
    }

    /// `(pat1) => b1, (pat2) => b2, ...` speculative form; restores and
    /// returns `None` if the second comma-separated clause never appears.
    fn try_pattern_lambda(&mut self) -> Result<Option<Expr>, ParseError> {
        let cp = self.checkpoint();
        let mut clauses = Vec::new();
        loop {
            if !self.check(TokenKind::LParen) {
                break;
            }
            let before_clause = self.checkpoint();
            self.advance(); // `(`
            let mut patterns = Vec::new();
            let mut ok = true;
            loop {
                match self.try_parse_pattern() {
                    Some(p) => patterns.push(p),
                    None => {
                        ok = false;
                        break;
                    }
                }
                if self.eat(TokenKind::Comma) {
                    continue;
                }
                break;
            }
            if !ok || !self.eat(TokenKind::RParen) || !self.eat(TokenKind::FatArrow) {
                self.restore(before_clause);
                break;
            }
            let body = match self.parse_expr() {
                Ok(b) => b,
                Err(_) => {
                    self.restore(cp);
                    return Ok(None);
                }
            };
            clauses.push(PatternClause { patterns, body: Box::new(body) });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        if clauses.len() < 2 {
            self.restore(cp);
            return Ok(None);
        }
        Ok(Some(Expr::PatternLambda(clauses)))
    }

    fn try_parse_pattern(&mut self) -> Option<Pattern> {
        match self.peek_kind() {
            TokenKind::Ident if self.peek().text == "_" => {
                self.advance();
                Some(Pattern::Wildcard)
            }
            TokenKind::Ident => {
                let name = self.advance().text;
                Some(Pattern::Bind(name))
            }
            TokenKind::Number => {
                let text = self.advance().text;
                Some(Pattern::Literal(Expr::Number(parse_number_literal(&text))))
            }
            TokenKind::String => Some(Pattern::Literal(Expr::String(self.advance().text))),
            _ => None,
        }
    }

    /// `() => body`, `(x) => body`, `(x, y) => body`. Also covers the
    /// "multi-lambda" shape: several of these joined by commas at the
    /// same arity-dispatch position, distinguished from a pattern-lambda
    /// because every clause binds (no literal/wildcard patterns).
    fn try_paren_lambda(&mut self) -> Result<Option<Expr>, ParseError> {
        let cp = self.checkpoint();
        let mut lambdas = Vec::new();
        loop {
            if !self.check(TokenKind::LParen) {
                break;
            }
            let before = self.checkpoint();
            self.advance();
            let mut params = Vec::new();
            let mut ok = true;
            while !self.check(TokenKind::RParen) {
                if !self.check(TokenKind::Ident) {
                    ok = false;
                    break;
                }
                params.push(self.advance().text);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            if !ok || !self.eat(TokenKind::RParen) || !self.eat(TokenKind::FatArrow) {
                self.restore(before);
                break;
            }
            let body = self.parse_expr()?;
            lambdas.push(Lambda {
                params,
                body: Box::new(body),
                captured_vars: Vec::new(),
                is_nested: false,
                is_pure: false,
                hot: false,
                name: None,
            });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        if lambdas.is_empty() {
            self.restore(cp);
            return Ok(None);
        }
        if lambdas.len() == 1 {
            return Ok(Some(Expr::Lambda(lambdas.into_iter().next().unwrap())));
        }
        Ok(Some(Expr::MultiLambda(lambdas)))
    }
}

fn is_match_subject(expr: &Expr) -> bool {
    !matches!(expr, Expr::Block(_) | Expr::Match { .. })
}

fn is_uppercase_name(name: &str) -> bool {
    name.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false)
        && name.chars().all(|c| !c.is_ascii_lowercase())
}

fn is_literal_value(expr: &Expr) -> bool {
    match expr {
        Expr::Number(_) | Expr::String(_) => true,
        Expr::List(elems) => elems.iter().all(is_literal_value),
        _ => false,
    }
}

fn is_literal_range(expr: &Expr) -> bool {
    matches!(expr, Expr::Range(start, end, _) if matches!(**start, Expr::Number(_)) && matches!(**end, Expr::Number(_)))
}

/// Pattern-dispatch lambdas have no single `Lambda` to stamp a name onto;
/// recursion-limit checking keys off `in_lambda_name` instead, so only the
/// plain and multi- forms need this.
fn name_lambda(expr: &mut Expr, name: &str) {
    match expr {
        Expr::Lambda(l) => l.name = Some(name.to_string()),
        Expr::MultiLambda(lambdas) => {
            for l in lambdas {
                l.name = Some(name.to_string());
            }
        }
        _ => {}
    }
}

fn name_hot(expr: &mut Expr) {
    match expr {
        Expr::Lambda(l) => l.hot = true,
        Expr::MultiLambda(lambdas) => {
            for l in lambdas {
                l.hot = true;
            }
        }
        _ => {}
    }
}

fn type_size(type_name: &str) -> u32 {
    match type_name {
        "i8" | "u8" => 1,
        "i16" | "u16" => 2,
        "i32" | "u32" | "f32" => 4,
        "i64" | "u64" | "f64" | "ptr" => 8,
        _ => 8,
    }
}

fn parse_number_literal(text: &str) -> f64 {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(&hex.replace('_', ""), 16).unwrap_or(0) as f64;
    }
    if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        return u64::from_str_radix(&bin.replace('_', ""), 2).unwrap_or(0) as f64;
    }
    text.replace('_', "").parse().unwrap_or(0.0)
}

/// Parses a single, complete expression from source text too small to
/// warrant a whole `Parser` (used by f-string interpolation sites that
/// need a fresh token stream over a sub-slice of the original source).
#[allow(dead_code)]
pub fn parse_expr_fragment(source: &str, file: &Path) -> Result<Expr, ParseError> {
    let mut parser = Parser::from_source(source, file)?;
    parser.parse_expr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn parse(src: &str) -> Program {
        Parser::from_source(src, Path::new("<test>"))
            .unwrap()
            .parse_program()
            .unwrap()
    }

    #[test]
    fn parses_simple_assignment_and_arithmetic() {
        let prog = parse("x = 2 + 3 * 4");
        assert_eq!(prog.statements.len(), 1);
        match &prog.statements[0] {
            Stmt::Assign { name, kind, value, .. } => {
                assert_eq!(name, "x");
                assert_eq!(*kind, MutKind::Immutable);
                assert_eq!(
                    *value,
                    Expr::Binary(
                        BinOp::Add,
                        Box::new(Expr::Number(2.0)),
                        Box::new(Expr::Binary(
                            BinOp::Mul,
                            Box::new(Expr::Number(3.0)),
                            Box::new(Expr::Number(4.0))
                        ))
                    )
                );
            }
            other => panic!("expected Assign, got {:?}", other),
        }
    }

    #[test]
    fn parses_bare_param_lambda() {
        let prog = parse("double = x => x * 2");
        match &prog.statements[0] {
            Stmt::Assign { value: Expr::Lambda(l), .. } => {
                assert_eq!(l.params, vec!["x".to_string()]);
                assert_eq!(l.name.as_deref(), Some("double"));
            }
            other => panic!("expected lambda assign, got {:?}", other),
        }
    }

    #[test]
    fn parses_pattern_lambda_dispatch() {
        let prog = parse("f = (0) => 1, (n) => n");
        match &prog.statements[0] {
            Stmt::Assign { value: Expr::PatternLambda(clauses), .. } => {
                assert_eq!(clauses.len(), 2);
                assert_eq!(clauses[0].patterns, vec![Pattern::Literal(Expr::Number(0.0))]);
                assert_eq!(clauses[1].patterns, vec![Pattern::Bind("n".to_string())]);
            }
            other => panic!("expected pattern lambda, got {:?}", other),
        }
    }

    #[test]
    fn parses_range_loop_with_max_clause() {
        let prog = parse("@ i in 0..<10 { println(i) }");
        match &prog.statements[0] {
            Stmt::Loop { iterator, needs_runtime_max_check, .. } => {
                assert_eq!(iterator, "i");
                assert!(!needs_runtime_max_check);
            }
            other => panic!("expected Loop, got {:?}", other),
        }
    }

    #[test]
    fn loop_over_non_literal_range_without_max_is_rejected() {
        let err = Parser::from_source("n = 10\n@ i in 0..<n { println(i) }", Path::new("<test>"))
            .and_then(|mut p| p.parse_program());
        assert!(err.is_err(), "expected a parse error for a missing max clause");
    }

    #[test]
    fn loop_over_non_literal_range_with_max_is_accepted() {
        let prog = parse("n = 10\n@ i in 0..<n max 5 { println(i) }");
        match &prog.statements[1] {
            Stmt::Loop { needs_runtime_max_check, .. } => assert!(needs_runtime_max_check),
            other => panic!("expected Loop, got {:?}", other),
        }
    }

    #[test]
    fn parses_match_block_with_guard_and_default() {
        let prog = parse("x { 0 => 1 ~> 2 }");
        match &prog.statements[0] {
            Stmt::ExpressionStmt(Expr::Match { clauses, default_is_explicit, .. }) => {
                assert_eq!(clauses.len(), 1);
                assert!(default_is_explicit);
            }
            other => panic!("expected Match, got {:?}", other),
        }
    }

    #[test]
    fn parses_match_block_with_thin_arrow_guard() {
        let prog = parse("n { 0 -> 1 ~> n * 2 }");
        match &prog.statements[0] {
            Stmt::ExpressionStmt(Expr::Match { clauses, default_is_explicit, .. }) => {
                assert_eq!(clauses.len(), 1);
                assert_eq!(clauses[0].guard, Some(Expr::Number(0.0)));
                assert_eq!(clauses[0].result, Expr::Number(1.0));
                assert!(default_is_explicit);
            }
            other => panic!("expected Match, got {:?}", other),
        }
    }

    #[test]
    fn parses_bare_clause_sugar_as_a_guardless_truthiness_clause() {
        let prog = parse(r#"ok { "yes" ~> "no" }"#);
        match &prog.statements[0] {
            Stmt::ExpressionStmt(Expr::Match { clauses, .. }) => {
                assert_eq!(clauses.len(), 1);
                assert!(clauses[0].guard.is_none());
                assert_eq!(clauses[0].result, Expr::String("yes".to_string()));
            }
            other => panic!("expected Match, got {:?}", other),
        }
    }

    #[test]
    fn parses_fstring_interpolation() {
        let prog = parse(r#"println(f"x={x} {{lit}}")"#);
        match &prog.statements[0] {
            Stmt::ExpressionStmt(Expr::Call { args, .. }) => match &args[0] {
                Expr::FString(parts) => {
                    assert_eq!(parts[0].literal, "x=");
                    assert_eq!(parts[0].expr, Some(Expr::Ident("x".to_string())));
                    assert_eq!(parts[1].literal, " {lit}");
                }
                other => panic!("expected FString, got {:?}", other),
            },
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn rejects_update_of_nothing() {
        // Not a real error case at the parser level (undefined vs update is
        // a compile-time check), but the update operator must still parse.
        let prog = parse("x <- x + 1");
        match &prog.statements[0] {
            Stmt::Assign { kind: MutKind::Update, is_update: true, .. } => {}
            other => panic!("expected update assign, got {:?}", other),
        }
    }
}
