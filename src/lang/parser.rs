use std::collections::HashSet;
use std::sync::Arc;

use super::ast::*;
use super::lexer::{self, Keyword as Kw, Op, Tok, Token};
use super::{MAX_NESTING, ParseError, Span};

/// Parse toolscript source into a [`Program`].
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let tokens = lexer::tokenize(source)?;
    Parser::new(tokens).program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nesting: usize,
    functions: usize,
    loops: usize,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            nesting: 0,
            functions: 0,
            loops: 0,
        }
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn token_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[(self.pos + offset).min(last)]
    }

    fn peek(&self) -> &Tok {
        &self.token_at(0).tok
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        &self.token_at(offset).tok
    }

    fn span(&self) -> Span {
        self.token_at(0).span
    }

    fn advance(&mut self) -> Token {
        let token = self.token_at(0).clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn at_op(&self, op: Op) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn at_kw(&self, kw: Kw) -> bool {
        matches!(self.peek(), Tok::Kw(k) if *k == kw)
    }

    fn eat_op(&mut self, op: Op) -> bool {
        if self.at_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: Kw) -> bool {
        if self.at_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.span())
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        self.error(format!("expected {expected}, found {}", self.peek().describe()))
    }

    fn expect_op(&mut self, op: Op) -> PResult<Span> {
        if self.at_op(op) {
            Ok(self.advance().span)
        } else {
            Err(self.unexpected(&format!("'{}'", op.as_str())))
        }
    }

    fn expect_kw(&mut self, kw: Kw) -> PResult<Span> {
        if self.at_kw(kw) {
            Ok(self.advance().span)
        } else {
            Err(self.unexpected(&format!("'{}'", kw.as_str())))
        }
    }

    fn expect_name(&mut self) -> PResult<(String, Span)> {
        match self.peek().clone() {
            Tok::Name(name) => {
                let span = self.advance().span;
                Ok((name, span))
            }
            _ => Err(self.unexpected("a name")),
        }
    }

    fn at_line_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent)
    }

    fn expect_line_end(&mut self) -> PResult<()> {
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(())
            }
            Tok::Eof | Tok::Dedent => Ok(()),
            _ => Err(self.unexpected("end of line")),
        }
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.nesting >= MAX_NESTING {
            return Err(self.error("too many nested blocks or expressions"));
        }
        self.nesting += 1;
        let result = f(self);
        self.nesting -= 1;
        result
    }

    fn unsupported(&self, what: &str) -> ParseError {
        self.error(format!("{what} is not supported"))
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn program(mut self) -> PResult<Program> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => {
                    self.advance();
                }
                _ => body.push(self.statement()?),
            }
        }
        Ok(Program { body })
    }

    fn statement(&mut self) -> PResult<Stmt> {
        match self.peek() {
            Tok::Kw(Kw::Def) => self.function_def(),
            Tok::Kw(Kw::If) => self.if_stmt(),
            Tok::Kw(Kw::While) => self.while_stmt(),
            Tok::Kw(Kw::For) => self.for_stmt(),
            Tok::Kw(Kw::Try) => self.try_stmt(),
            Tok::Indent => Err(self.error("unexpected indent")),
            _ => {
                let stmt = self.simple_statement()?;
                if self.at_op(Op::Semicolon) {
                    return Err(self.unsupported("';' between statements"));
                }
                self.expect_line_end()?;
                Ok(stmt)
            }
        }
    }

    fn block(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_op(Op::Colon)?;
        self.nested(|p| {
            if !matches!(p.peek(), Tok::Newline) {
                let stmt = p.simple_statement()?;
                p.expect_line_end()?;
                return Ok(vec![stmt]);
            }
            p.advance();
            if !matches!(p.peek(), Tok::Indent) {
                return Err(p.error("expected an indented block"));
            }
            p.advance();
            let mut body = Vec::new();
            loop {
                match p.peek() {
                    Tok::Dedent => {
                        p.advance();
                        break;
                    }
                    Tok::Eof => break,
                    Tok::Newline => {
                        p.advance();
                    }
                    _ => body.push(p.statement()?),
                }
            }
            Ok(body)
        })
    }

    fn function_def(&mut self) -> PResult<Stmt> {
        let span = self.advance().span;
        let (name, _) = self.expect_name()?;
        self.expect_op(Op::LParen)?;

        let mut params: Vec<Param> = Vec::new();
        let mut seen = HashSet::new();
        loop {
            if self.eat_op(Op::RParen) {
                break;
            }
            if self.at_op(Op::Star) || self.at_op(Op::DoubleStar) {
                return Err(self.unsupported("variadic parameters"));
            }
            let (pname, pspan) = self.expect_name()?;
            if !seen.insert(pname.clone()) {
                return Err(ParseError::new(
                    format!("duplicate parameter '{pname}'"),
                    pspan,
                ));
            }
            let default = if self.eat_op(Op::Assign) {
                Some(self.expr()?)
            } else {
                if params.iter().any(|p| p.default.is_some()) {
                    return Err(ParseError::new(
                        "parameter without a default follows parameter with a default",
                        pspan,
                    ));
                }
                None
            };
            params.push(Param {
                name: pname,
                default,
                span: pspan,
            });
            if !self.eat_op(Op::Comma) {
                self.expect_op(Op::RParen)?;
                break;
            }
        }

        let saved_loops = self.loops;
        self.functions += 1;
        self.loops = 0;
        let body = self.block();
        self.functions -= 1;
        self.loops = saved_loops;
        let body = body?;

        Ok(Stmt {
            kind: StmtKind::FunctionDef(Arc::new(FunctionDef {
                name,
                params,
                body,
                span,
            })),
            span,
        })
    }

    fn if_stmt(&mut self) -> PResult<Stmt> {
        // Entered on `if` or `elif`.
        let span = self.advance().span;
        let test = self.expr()?;
        let body = self.block()?;
        let orelse = if self.at_kw(Kw::Elif) {
            vec![self.if_stmt()?]
        } else if self.eat_kw(Kw::Else) {
            self.block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::If { test, body, orelse },
            span,
        })
    }

    fn loop_body(&mut self) -> PResult<Vec<Stmt>> {
        self.loops += 1;
        let body = self.block();
        self.loops -= 1;
        body
    }

    fn while_stmt(&mut self) -> PResult<Stmt> {
        let span = self.advance().span;
        let test = self.expr()?;
        let body = self.loop_body()?;
        if self.at_kw(Kw::Else) {
            return Err(self.unsupported("'else' after a loop"));
        }
        Ok(Stmt {
            kind: StmtKind::While { test, body },
            span,
        })
    }

    fn for_stmt(&mut self) -> PResult<Stmt> {
        let span = self.advance().span;
        let target = self.target_list()?;
        self.expect_kw(Kw::In)?;
        let iter = self.expr_list()?;
        let body = self.loop_body()?;
        if self.at_kw(Kw::Else) {
            return Err(self.unsupported("'else' after a loop"));
        }
        Ok(Stmt {
            kind: StmtKind::For { target, iter, body },
            span,
        })
    }

    fn try_stmt(&mut self) -> PResult<Stmt> {
        let span = self.advance().span;
        let body = self.block()?;

        let mut handlers = Vec::new();
        while self.at_kw(Kw::Except) {
            let hspan = self.advance().span;
            let kind = if self.at_op(Op::Colon) {
                None
            } else {
                Some(self.expr()?)
            };
            let name = if self.eat_kw(Kw::As) {
                Some(self.expect_name()?.0)
            } else {
                None
            };
            let hbody = self.block()?;
            handlers.push(ExceptHandler {
                kind,
                name,
                body: hbody,
                span: hspan,
            });
        }

        let orelse = if !handlers.is_empty() && self.eat_kw(Kw::Else) {
            self.block()?
        } else {
            Vec::new()
        };
        let finalbody = if self.eat_kw(Kw::Finally) {
            self.block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.unexpected("'except' or 'finally'"));
        }

        Ok(Stmt {
            kind: StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            },
            span,
        })
    }

    fn simple_statement(&mut self) -> PResult<Stmt> {
        let span = self.span();
        let kind = match self.peek().clone() {
            Tok::Kw(Kw::Pass) => {
                self.advance();
                StmtKind::Pass
            }
            Tok::Kw(Kw::Break) | Tok::Kw(Kw::Continue) => {
                let token = self.advance();
                if self.loops == 0 {
                    return Err(ParseError::new(
                        format!("{} outside loop", token.tok.describe()),
                        span,
                    ));
                }
                if token.tok == Tok::Kw(Kw::Break) {
                    StmtKind::Break
                } else {
                    StmtKind::Continue
                }
            }
            Tok::Kw(Kw::Return) => {
                self.advance();
                if self.functions == 0 {
                    return Err(ParseError::new("'return' outside function", span));
                }
                let value = if self.at_line_end() {
                    None
                } else {
                    Some(self.expr_list()?)
                };
                StmtKind::Return(value)
            }
            Tok::Kw(Kw::Raise) => {
                self.advance();
                let value = if self.at_line_end() {
                    None
                } else {
                    Some(self.expr()?)
                };
                if self.at_kw(Kw::From) {
                    return Err(self.unsupported("'raise ... from'"));
                }
                StmtKind::Raise(value)
            }
            Tok::Kw(Kw::Assert) => {
                self.advance();
                let test = self.expr()?;
                let msg = if self.eat_op(Op::Comma) {
                    Some(self.expr()?)
                } else {
                    None
                };
                StmtKind::Assert { test, msg }
            }
            Tok::Kw(Kw::Import) => self.import()?,
            Tok::Kw(Kw::From) => self.import_from()?,
            Tok::Kw(
                kw @ (Kw::Class
                | Kw::Lambda
                | Kw::Global
                | Kw::Nonlocal
                | Kw::Del
                | Kw::With
                | Kw::Yield
                | Kw::Async
                | Kw::Await),
            ) => {
                return Err(self.unsupported(&format!("'{}'", kw.as_str())));
            }
            _ => self.assignment_or_expr()?,
        };
        Ok(Stmt { kind, span })
    }

    fn assignment_or_expr(&mut self) -> PResult<StmtKind> {
        let first = self.expr_list()?;

        let aug = match self.peek() {
            Tok::Op(Op::PlusAssign) => Some(BinOp::Add),
            Tok::Op(Op::MinusAssign) => Some(BinOp::Sub),
            Tok::Op(Op::StarAssign) => Some(BinOp::Mul),
            Tok::Op(Op::SlashAssign) => Some(BinOp::Div),
            Tok::Op(Op::DoubleSlashAssign) => Some(BinOp::FloorDiv),
            Tok::Op(Op::PercentAssign) => Some(BinOp::Mod),
            _ => None,
        };
        if let Some(op) = aug {
            self.advance();
            if !matches!(
                first.kind,
                ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. }
            ) {
                return Err(ParseError::new(
                    "illegal target for augmented assignment",
                    first.span,
                ));
            }
            let value = self.expr_list()?;
            return Ok(StmtKind::AugAssign {
                target: first,
                op,
                value,
            });
        }

        if !self.at_op(Op::Assign) {
            return Ok(StmtKind::Expr(first));
        }

        let mut targets = vec![first];
        let value = loop {
            self.advance();
            let next = self.expr_list()?;
            if self.at_op(Op::Assign) {
                targets.push(next);
            } else {
                break next;
            }
        };
        for target in &targets {
            check_target(target)?;
        }
        Ok(StmtKind::Assign { targets, value })
    }

    fn dotted_name(&mut self) -> PResult<(String, Span)> {
        let (mut name, span) = self.expect_name()?;
        while self.eat_op(Op::Dot) {
            let (part, _) = self.expect_name()?;
            name.push('.');
            name.push_str(&part);
        }
        Ok((name, span))
    }

    fn import(&mut self) -> PResult<StmtKind> {
        self.advance();
        let mut names = Vec::new();
        loop {
            let (name, span) = self.dotted_name()?;
            let asname = if self.eat_kw(Kw::As) {
                Some(self.expect_name()?.0)
            } else {
                None
            };
            names.push(ImportAlias { name, asname, span });
            if !self.eat_op(Op::Comma) {
                break;
            }
        }
        Ok(StmtKind::Import(names))
    }

    fn import_from(&mut self) -> PResult<StmtKind> {
        self.advance();
        if self.at_op(Op::Dot) {
            return Err(self.unsupported("relative import"));
        }
        let (module, _) = self.dotted_name()?;
        self.expect_kw(Kw::Import)?;

        if self.at_op(Op::Star) {
            let span = self.advance().span;
            return Ok(StmtKind::ImportFrom {
                module,
                names: vec![ImportAlias {
                    name: "*".to_string(),
                    asname: None,
                    span,
                }],
            });
        }

        let parenthesized = self.eat_op(Op::LParen);
        let mut names = Vec::new();
        loop {
            let (name, span) = self.expect_name()?;
            let asname = if self.eat_kw(Kw::As) {
                Some(self.expect_name()?.0)
            } else {
                None
            };
            names.push(ImportAlias { name, asname, span });
            if !self.eat_op(Op::Comma) {
                break;
            }
            if parenthesized && self.at_op(Op::RParen) {
                break;
            }
        }
        if parenthesized {
            self.expect_op(Op::RParen)?;
        }
        Ok(StmtKind::ImportFrom { module, names })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn starts_expr(&self) -> bool {
        match self.peek() {
            Tok::Name(_) | Tok::Int(_) | Tok::Float(_) | Tok::Str(_) => true,
            Tok::Kw(kw) => matches!(kw, Kw::True | Kw::False | Kw::None | Kw::Not),
            Tok::Op(op) => matches!(
                op,
                Op::LParen | Op::LBracket | Op::LBrace | Op::Minus | Op::Plus
            ),
            _ => false,
        }
    }

    /// `a, b, c` as a tuple, or a single expression.
    fn expr_list(&mut self) -> PResult<Expr> {
        let first = self.expr()?;
        if !self.at_op(Op::Comma) {
            return Ok(first);
        }
        let span = first.span;
        let mut items = vec![first];
        while self.eat_op(Op::Comma) {
            if !self.starts_expr() {
                break;
            }
            items.push(self.expr()?);
        }
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            span,
        })
    }

    /// Loop and comprehension targets stop before `in`.
    fn target_list(&mut self) -> PResult<Expr> {
        let first = self.postfix()?;
        let target = if self.at_op(Op::Comma) {
            let span = first.span;
            let mut items = vec![first];
            while self.eat_op(Op::Comma) {
                if self.at_kw(Kw::In) {
                    break;
                }
                items.push(self.postfix()?);
            }
            Expr {
                kind: ExprKind::Tuple(items),
                span,
            }
        } else {
            first
        };
        check_target(&target)?;
        Ok(target)
    }

    fn expr(&mut self) -> PResult<Expr> {
        self.nested(|p| {
            if p.at_kw(Kw::Lambda) {
                return Err(p.unsupported("'lambda'"));
            }
            let body = p.or_expr()?;
            if !p.at_kw(Kw::If) {
                return Ok(body);
            }
            p.advance();
            let test = p.or_expr()?;
            p.expect_kw(Kw::Else)?;
            let orelse = p.expr()?;
            let span = body.span;
            Ok(Expr {
                kind: ExprKind::IfExp {
                    test: Box::new(test),
                    body: Box::new(body),
                    orelse: Box::new(orelse),
                },
                span,
            })
        })
    }

    fn or_expr(&mut self) -> PResult<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_kw(Kw::Or) {
            let right = self.and_expr()?;
            let span = left.span;
            left = Expr {
                kind: ExprKind::BoolOp {
                    op: BoolOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_kw(Kw::And) {
            let right = self.not_expr()?;
            let span = left.span;
            left = Expr {
                kind: ExprKind::BoolOp {
                    op: BoolOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> PResult<Expr> {
        if self.at_kw(Kw::Not) {
            let span = self.advance().span;
            let operand = self.nested(|p| p.not_expr())?;
            return Ok(Expr {
                kind: ExprKind::UnaryOp {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                span,
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let left = self.arith()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op(Op::Eq) => CmpOp::Eq,
                Tok::Op(Op::NotEq) => CmpOp::NotEq,
                Tok::Op(Op::Lt) => CmpOp::Lt,
                Tok::Op(Op::LtEq) => CmpOp::LtEq,
                Tok::Op(Op::Gt) => CmpOp::Gt,
                Tok::Op(Op::GtEq) => CmpOp::GtEq,
                Tok::Kw(Kw::In) => CmpOp::In,
                Tok::Kw(Kw::Not) if matches!(self.peek_at(1), Tok::Kw(Kw::In)) => {
                    self.advance();
                    CmpOp::NotIn
                }
                Tok::Kw(Kw::Is) => {
                    if matches!(self.peek_at(1), Tok::Kw(Kw::Not)) {
                        self.advance();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.advance();
            ops.push((op, self.arith()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        let span = left.span;
        Ok(Expr {
            kind: ExprKind::Compare {
                left: Box::new(left),
                ops,
            },
            span,
        })
    }

    fn binary(left: Expr, op: BinOp, right: Expr) -> Expr {
        let span = left.span;
        Expr {
            kind: ExprKind::BinOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            },
            span,
        }
    }

    fn arith(&mut self) -> PResult<Expr> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Op(Op::Plus) => BinOp::Add,
                Tok::Op(Op::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            left = Self::binary(left, op, right);
        }
        Ok(left)
    }

    fn term(&mut self) -> PResult<Expr> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Tok::Op(Op::Star) => BinOp::Mul,
                Tok::Op(Op::Slash) => BinOp::Div,
                Tok::Op(Op::DoubleSlash) => BinOp::FloorDiv,
                Tok::Op(Op::Percent) => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.factor()?;
            left = Self::binary(left, op, right);
        }
        Ok(left)
    }

    fn factor(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            Tok::Op(Op::Minus) => UnaryOp::Neg,
            Tok::Op(Op::Plus) => UnaryOp::Pos,
            _ => return self.power(),
        };
        let span = self.advance().span;
        let operand = self.nested(|p| p.factor())?;
        Ok(Expr {
            kind: ExprKind::UnaryOp {
                op,
                operand: Box::new(operand),
            },
            span,
        })
    }

    fn power(&mut self) -> PResult<Expr> {
        let base = self.postfix()?;
        if !self.eat_op(Op::DoubleStar) {
            return Ok(base);
        }
        let exponent = self.nested(|p| p.factor())?;
        Ok(Self::binary(base, BinOp::Pow, exponent))
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.atom()?;
        loop {
            match self.peek() {
                Tok::Op(Op::LParen) => expr = self.call(expr)?,
                Tok::Op(Op::LBracket) => {
                    self.advance();
                    let index = self.subscript_index()?;
                    self.expect_op(Op::RBracket)?;
                    let span = expr.span;
                    expr = Expr {
                        kind: ExprKind::Subscript {
                            value: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    };
                }
                Tok::Op(Op::Dot) => {
                    self.advance();
                    let (attr, span) = self.expect_name()?;
                    expr = Expr {
                        kind: ExprKind::Attribute {
                            value: Box::new(expr),
                            attr,
                        },
                        span,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn call(&mut self, func: Expr) -> PResult<Expr> {
        self.advance();
        let mut args = Vec::new();
        let mut keywords: Vec<Keyword> = Vec::new();
        loop {
            if self.eat_op(Op::RParen) {
                break;
            }
            if self.at_op(Op::Star) || self.at_op(Op::DoubleStar) {
                return Err(self.unsupported("argument unpacking"));
            }
            let is_keyword = matches!(self.peek(), Tok::Name(_))
                && matches!(self.peek_at(1), Tok::Op(Op::Assign));
            if is_keyword {
                let (name, span) = self.expect_name()?;
                self.advance();
                if keywords.iter().any(|k| k.name == name) {
                    return Err(ParseError::new(
                        format!("keyword argument repeated: {name}"),
                        span,
                    ));
                }
                let value = self.expr()?;
                keywords.push(Keyword { name, value, span });
            } else {
                if !keywords.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.expr()?);
            }
            if !self.eat_op(Op::Comma) {
                self.expect_op(Op::RParen)?;
                break;
            }
        }
        let span = func.span;
        Ok(Expr {
            kind: ExprKind::Call {
                func: Box::new(func),
                args,
                keywords,
            },
            span,
        })
    }

    fn subscript_index(&mut self) -> PResult<Expr> {
        let span = self.span();
        let lower = if self.at_op(Op::Colon) {
            None
        } else {
            Some(self.expr()?)
        };
        if !self.eat_op(Op::Colon) {
            return lower.ok_or_else(|| self.unexpected("a subscript"));
        }
        let bound = |p: &mut Self| -> PResult<Option<Box<Expr>>> {
            if p.at_op(Op::Colon) || p.at_op(Op::RBracket) {
                Ok(None)
            } else {
                Ok(Some(Box::new(p.expr()?)))
            }
        };
        let upper = bound(self)?;
        let step = if self.eat_op(Op::Colon) {
            bound(self)?
        } else {
            None
        };
        Ok(Expr {
            kind: ExprKind::Slice {
                lower: lower.map(Box::new),
                upper,
                step,
            },
            span,
        })
    }

    fn atom(&mut self) -> PResult<Expr> {
        let span = self.span();
        let constant = |c: Constant| -> PResult<Expr> {
            Ok(Expr {
                kind: ExprKind::Constant(c),
                span,
            })
        };
        match self.peek().clone() {
            Tok::Name(name) => {
                self.advance();
                Ok(Expr {
                    kind: ExprKind::Name(name),
                    span,
                })
            }
            Tok::Int(i) => {
                self.advance();
                constant(Constant::Int(i))
            }
            Tok::Float(f) => {
                self.advance();
                constant(Constant::Float(f))
            }
            Tok::Str(s) => {
                self.advance();
                let mut s = s;
                while let Tok::Str(more) = self.peek().clone() {
                    self.advance();
                    s.push_str(&more);
                }
                constant(Constant::Str(s))
            }
            Tok::Kw(Kw::True) => {
                self.advance();
                constant(Constant::Bool(true))
            }
            Tok::Kw(Kw::False) => {
                self.advance();
                constant(Constant::Bool(false))
            }
            Tok::Kw(Kw::None) => {
                self.advance();
                constant(Constant::None)
            }
            Tok::Op(Op::LParen) => {
                self.advance();
                self.paren(span)
            }
            Tok::Op(Op::LBracket) => {
                self.advance();
                self.list_display(span)
            }
            Tok::Op(Op::LBrace) => {
                self.advance();
                self.dict_display(span)
            }
            Tok::Kw(kw @ (Kw::Lambda | Kw::Yield | Kw::Await)) => {
                Err(self.unsupported(&format!("'{}'", kw.as_str())))
            }
            _ => Err(self.unexpected("an expression")),
        }
    }

    fn paren(&mut self, span: Span) -> PResult<Expr> {
        if self.eat_op(Op::RParen) {
            return Ok(Expr {
                kind: ExprKind::Tuple(Vec::new()),
                span,
            });
        }
        let first = self.expr()?;
        if self.at_kw(Kw::For) {
            return Err(self.unsupported("generator expression"));
        }
        if !self.at_op(Op::Comma) {
            self.expect_op(Op::RParen)?;
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(Op::Comma) {
            if self.at_op(Op::RParen) {
                break;
            }
            items.push(self.expr()?);
        }
        self.expect_op(Op::RParen)?;
        Ok(Expr {
            kind: ExprKind::Tuple(items),
            span,
        })
    }

    fn list_display(&mut self, span: Span) -> PResult<Expr> {
        if self.eat_op(Op::RBracket) {
            return Ok(Expr {
                kind: ExprKind::List(Vec::new()),
                span,
            });
        }
        let first = self.expr()?;
        if self.eat_kw(Kw::For) {
            let target = self.target_list()?;
            self.expect_kw(Kw::In)?;
            let iter = self.or_expr()?;
            let mut conditions = Vec::new();
            while self.eat_kw(Kw::If) {
                conditions.push(self.or_expr()?);
            }
            if self.at_kw(Kw::For) {
                return Err(self.unsupported("nested comprehension"));
            }
            self.expect_op(Op::RBracket)?;
            return Ok(Expr {
                kind: ExprKind::ListComp {
                    elt: Box::new(first),
                    target: Box::new(target),
                    iter: Box::new(iter),
                    conditions,
                },
                span,
            });
        }
        let mut items = vec![first];
        while self.eat_op(Op::Comma) {
            if self.at_op(Op::RBracket) {
                break;
            }
            items.push(self.expr()?);
        }
        self.expect_op(Op::RBracket)?;
        Ok(Expr {
            kind: ExprKind::List(items),
            span,
        })
    }

    fn dict_display(&mut self, span: Span) -> PResult<Expr> {
        let mut pairs = Vec::new();
        while !self.eat_op(Op::RBrace) {
            let key = self.expr()?;
            if !self.at_op(Op::Colon) {
                return Err(self.unsupported("set literal"));
            }
            self.advance();
            let value = self.expr()?;
            pairs.push((key, value));
            if !self.eat_op(Op::Comma) {
                self.expect_op(Op::RBrace)?;
                break;
            }
        }
        Ok(Expr {
            kind: ExprKind::Dict(pairs),
            span,
        })
    }
}

fn check_target(target: &Expr) -> PResult<()> {
    match &target.kind {
        ExprKind::Name(_) | ExprKind::Attribute { .. } | ExprKind::Subscript { .. } => Ok(()),
        ExprKind::Tuple(items) | ExprKind::List(items) if !items.is_empty() => {
            items.iter().try_for_each(check_target)
        }
        _ => Err(ParseError::new("cannot assign to expression", target.span)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_expr(source: &str) -> ExprKind {
        let program = parse(source).unwrap();
        match &program.body[0].kind {
            StmtKind::Expr(e) => e.kind.clone(),
            StmtKind::Assign { value, .. } => value.kind.clone(),
            other => panic!("unexpected statement {other:?}"),
        }
    }

    #[test]
    fn parses_function_with_defaults() {
        let program = parse("def main(x, y=2):\n    return x + y\n").unwrap();
        let def = program.functions().next().unwrap();
        assert_eq!(def.name, "main");
        assert_eq!(def.params.len(), 2);
        assert!(def.params[1].default.is_some());
    }

    #[test]
    fn operator_precedence() {
        match first_expr("1 + 2 * 3") {
            ExprKind::BinOp { op, right, .. } => {
                assert_eq!(op, BinOp::Add);
                assert!(matches!(right.kind, ExprKind::BinOp { op: BinOp::Mul, .. }));
            }
            other => panic!("{other:?}"),
        }
        match first_expr("-2 ** 2") {
            ExprKind::UnaryOp { op, operand } => {
                assert_eq!(op, UnaryOp::Neg);
                assert!(matches!(operand.kind, ExprKind::BinOp { op: BinOp::Pow, .. }));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn chained_comparison_and_membership() {
        match first_expr("a < b <= c not in d") {
            ExprKind::Compare { ops, .. } => {
                let kinds: Vec<_> = ops.iter().map(|(op, _)| *op).collect();
                assert_eq!(kinds, vec![CmpOp::Lt, CmpOp::LtEq, CmpOp::NotIn]);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn comprehension_and_slices() {
        assert!(matches!(
            first_expr("[x * 2 for x in items if x > 1]"),
            ExprKind::ListComp { .. }
        ));
        match first_expr("s[1:-1]") {
            ExprKind::Subscript { index, .. } => {
                assert!(matches!(index.kind, ExprKind::Slice { step: None, .. }))
            }
            other => panic!("{other:?}"),
        }
        match first_expr("s[::2]") {
            ExprKind::Subscript { index, .. } => match index.kind {
                ExprKind::Slice { lower, upper, step } => {
                    assert!(lower.is_none() && upper.is_none() && step.is_some());
                }
                other => panic!("{other:?}"),
            },
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn try_except_else_finally() {
        let src = "def f():\n    try:\n        x = 1\n    except (KeyError, ValueError) as e:\n        x = 2\n    else:\n        x = 3\n    finally:\n        pass\n    return x\n";
        let program = parse(src).unwrap();
        let def = program.functions().next().unwrap();
        match &def.body[0].kind {
            StmtKind::Try {
                handlers,
                orelse,
                finalbody,
                ..
            } => {
                assert_eq!(handlers.len(), 1);
                assert_eq!(handlers[0].name.as_deref(), Some("e"));
                assert_eq!(orelse.len(), 1);
                assert_eq!(finalbody.len(), 1);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn imports() {
        let program = parse("import math as m, json\nfrom re import (search, sub as s,)\n").unwrap();
        match &program.body[0].kind {
            StmtKind::Import(names) => {
                assert_eq!(names[0].bound_name(), "m");
                assert_eq!(names[1].bound_name(), "json");
            }
            other => panic!("{other:?}"),
        }
        match &program.body[1].kind {
            StmtKind::ImportFrom { module, names } => {
                assert_eq!(module, "re");
                assert_eq!(names[1].bound_name(), "s");
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn rejects_unsupported_constructs() {
        for src in [
            "class A:\n    pass\n",
            "f = lambda x: x\n",
            "def f(*args):\n    pass\n",
            "del x\n",
            "with x:\n    pass\n",
            "return 1\n",
            "break\n",
            "x = (i for i in y)\n",
            "1 = x\n",
        ] {
            assert!(parse(src).is_err(), "accepted: {src}");
        }
    }

    #[test]
    fn deep_nesting_is_a_parse_error() {
        let src = format!("x = {}1{}\n", "(".repeat(200), ")".repeat(200));
        let err = parse(&src).unwrap_err();
        assert!(err.message.contains("nested"));

        let src = format!("x = {}1\n", "not ".repeat(500));
        assert!(parse(&src).is_err());
    }

    #[test]
    fn one_line_blocks_and_elif() {
        let src = "def main(x):\n    if x: return 1\n    elif x is None: return 2\n    else: return 3\n";
        assert!(parse(src).is_ok());
    }
}
