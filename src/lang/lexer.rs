use super::{ParseError, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    And,
    As,
    Assert,
    Break,
    Continue,
    Def,
    Elif,
    Else,
    Except,
    False,
    Finally,
    For,
    From,
    If,
    Import,
    In,
    Is,
    None,
    Not,
    Or,
    Pass,
    Raise,
    Return,
    True,
    Try,
    While,
    // Reserved words that parse to an error
    Async,
    Await,
    Class,
    Del,
    Global,
    Lambda,
    Nonlocal,
    With,
    Yield,
}

impl Keyword {
    pub fn lookup(ident: &str) -> Option<Self> {
        let kw = match ident {
            "and" => Self::And,
            "as" => Self::As,
            "assert" => Self::Assert,
            "break" => Self::Break,
            "continue" => Self::Continue,
            "def" => Self::Def,
            "elif" => Self::Elif,
            "else" => Self::Else,
            "except" => Self::Except,
            "False" => Self::False,
            "finally" => Self::Finally,
            "for" => Self::For,
            "from" => Self::From,
            "if" => Self::If,
            "import" => Self::Import,
            "in" => Self::In,
            "is" => Self::Is,
            "None" => Self::None,
            "not" => Self::Not,
            "or" => Self::Or,
            "pass" => Self::Pass,
            "raise" => Self::Raise,
            "return" => Self::Return,
            "True" => Self::True,
            "try" => Self::Try,
            "while" => Self::While,
            "async" => Self::Async,
            "await" => Self::Await,
            "class" => Self::Class,
            "del" => Self::Del,
            "global" => Self::Global,
            "lambda" => Self::Lambda,
            "nonlocal" => Self::Nonlocal,
            "with" => Self::With,
            "yield" => Self::Yield,
            _ => return None,
        };
        Some(kw)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "and",
            Self::As => "as",
            Self::Assert => "assert",
            Self::Break => "break",
            Self::Continue => "continue",
            Self::Def => "def",
            Self::Elif => "elif",
            Self::Else => "else",
            Self::Except => "except",
            Self::False => "False",
            Self::Finally => "finally",
            Self::For => "for",
            Self::From => "from",
            Self::If => "if",
            Self::Import => "import",
            Self::In => "in",
            Self::Is => "is",
            Self::None => "None",
            Self::Not => "not",
            Self::Or => "or",
            Self::Pass => "pass",
            Self::Raise => "raise",
            Self::Return => "return",
            Self::True => "True",
            Self::Try => "try",
            Self::While => "while",
            Self::Async => "async",
            Self::Await => "await",
            Self::Class => "class",
            Self::Del => "del",
            Self::Global => "global",
            Self::Lambda => "lambda",
            Self::Nonlocal => "nonlocal",
            Self::With => "with",
            Self::Yield => "yield",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Semicolon,
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    Assign,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    DoubleSlashAssign,
    PercentAssign,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LBracket => "[",
            Self::RBracket => "]",
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::Comma => ",",
            Self::Colon => ":",
            Self::Dot => ".",
            Self::Semicolon => ";",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::DoubleStar => "**",
            Self::Slash => "/",
            Self::DoubleSlash => "//",
            Self::Percent => "%",
            Self::Assign => "=",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::PlusAssign => "+=",
            Self::MinusAssign => "-=",
            Self::StarAssign => "*=",
            Self::SlashAssign => "/=",
            Self::DoubleSlashAssign => "//=",
            Self::PercentAssign => "%=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Kw(Keyword),
    Op(Op),
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl Tok {
    pub fn describe(&self) -> String {
        match self {
            Tok::Name(n) => format!("name '{n}'"),
            Tok::Int(i) => format!("number {i}"),
            Tok::Float(f) => format!("number {f}"),
            Tok::Str(_) => "string literal".to_string(),
            Tok::Kw(k) => format!("'{}'", k.as_str()),
            Tok::Op(op) => format!("'{}'", op.as_str()),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "indent".to_string(),
            Tok::Dedent => "dedent".to_string(),
            Tok::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub span: Span,
}

/// Turn source text into tokens, synthesizing `Indent`/`Dedent` from leading
/// whitespace. The returned vector always ends with `Eof`.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    indents: Vec<u32>,
    brackets: usize,
    at_line_start: bool,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            indents: vec![0],
            brackets: 0,
            at_line_start: true,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn here(&self) -> Span {
        Span::new(self.line, self.column)
    }

    fn push(&mut self, tok: Tok, span: Span) {
        self.tokens.push(Token { tok, span });
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn run(mut self) -> Result<Vec<Token>, ParseError> {
        loop {
            if self.at_line_start && self.brackets == 0 {
                if !self.indentation()? {
                    continue;
                }
            }
            let Some(c) = self.peek() else { break };
            let span = self.here();
            match c {
                ' ' | '\t' | '\r' | '\x0c' => {
                    self.bump();
                }
                '\n' => {
                    self.bump();
                    if self.brackets == 0 {
                        self.push(Tok::Newline, span);
                        self.at_line_start = true;
                    }
                }
                '#' => self.skip_comment(),
                '\\' => {
                    self.bump();
                    if self.peek() == Some('\r') {
                        self.bump();
                    }
                    if self.bump() != Some('\n') {
                        return Err(ParseError::new("unexpected character after line continuation", span));
                    }
                }
                '0'..='9' => {
                    let tok = self.number(span)?;
                    self.push(tok, span);
                }
                '.' if self.peek_at(1).is_some_and(|n| n.is_ascii_digit()) => {
                    let tok = self.number(span)?;
                    self.push(tok, span);
                }
                '"' | '\'' => {
                    let s = self.string(false, span)?;
                    self.push(Tok::Str(s), span);
                }
                c if c.is_alphabetic() || c == '_' => {
                    let ident = self.identifier(span)?;
                    let next = self.peek();
                    if matches!(next, Some('"' | '\'')) {
                        match ident.as_str() {
                            "r" | "R" => {
                                let s = self.string(true, span)?;
                                self.push(Tok::Str(s), span);
                                continue;
                            }
                            "f" | "F" | "b" | "B" | "rb" | "br" | "u" | "U" => {
                                return Err(ParseError::new(
                                    format!("string prefix '{ident}' is not supported"),
                                    span,
                                ));
                            }
                            _ => {}
                        }
                    }
                    let tok = match Keyword::lookup(&ident) {
                        Some(kw) => Tok::Kw(kw),
                        None => Tok::Name(ident),
                    };
                    self.push(tok, span);
                }
                _ => {
                    let op = self.operator(c, span)?;
                    match op {
                        Op::LParen | Op::LBracket | Op::LBrace => self.brackets += 1,
                        Op::RParen | Op::RBracket | Op::RBrace => {
                            self.brackets = self.brackets.saturating_sub(1)
                        }
                        _ => {}
                    }
                    self.push(Tok::Op(op), span);
                }
            }
        }

        let end = self.here();
        if !matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline)
        ) {
            self.push(Tok::Newline, end);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent, end);
        }
        self.push(Tok::Eof, end);
        Ok(self.tokens)
    }

    /// Measure the indentation of a new logical line. Returns false when the
    /// line was blank or a comment and has been consumed.
    fn indentation(&mut self) -> Result<bool, ParseError> {
        let mut width: u32 = 0;
        loop {
            match self.peek() {
                Some(' ') => width += 1,
                Some('\t') => width = (width / 8 + 1) * 8,
                Some('\x0c') => width = 0,
                _ => break,
            }
            self.bump();
        }
        match self.peek() {
            None => return Ok(true),
            Some('\n') => {
                self.bump();
                return Ok(false);
            }
            Some('\r') if self.peek_at(1) == Some('\n') => {
                self.bump();
                self.bump();
                return Ok(false);
            }
            Some('#') => {
                self.skip_comment();
                return Ok(false);
            }
            _ => {}
        }

        let span = self.here();
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent, span);
        } else {
            while width < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push(Tok::Dedent, span);
            }
            if width != self.indents.last().copied().unwrap_or(0) {
                return Err(ParseError::new(
                    "unindent does not match any outer indentation level",
                    span,
                ));
            }
        }
        self.at_line_start = false;
        Ok(true)
    }

    fn identifier(&mut self, span: Span) -> Result<String, ParseError> {
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                ident.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if !ident.is_ascii() {
            return Err(ParseError::new(
                format!("non-ASCII identifier '{ident}' is not supported"),
                span,
            ));
        }
        Ok(ident)
    }

    fn digits(&mut self, text: &mut String, radix: u32) {
        while let Some(c) = self.peek() {
            if c.is_digit(radix) {
                text.push(c);
            } else if c != '_' {
                break;
            }
            self.bump();
        }
    }

    fn number(&mut self, span: Span) -> Result<Tok, ParseError> {
        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X')) {
            self.bump();
            self.bump();
            let mut text = String::new();
            self.digits(&mut text, 16);
            return i64::from_str_radix(&text, 16)
                .map(Tok::Int)
                .map_err(|_| ParseError::new("invalid hexadecimal literal", span));
        }

        let mut text = String::new();
        let mut is_float = false;
        self.digits(&mut text, 10);
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            if text.is_empty() {
                text.push('0');
            }
            text.push('.');
            self.bump();
            self.digits(&mut text, 10);
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let signed = matches!(self.peek_at(1), Some('+' | '-'));
            let digit_at = if signed { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                text.push('e');
                self.bump();
                if signed {
                    if let Some(sign) = self.bump() {
                        text.push(sign);
                    }
                }
                self.digits(&mut text, 10);
            }
        }
        if self.peek().is_some_and(|c| c.is_alphabetic() || c == '_') {
            return Err(ParseError::new("invalid numeric literal", span));
        }

        if is_float {
            text.parse::<f64>()
                .map(Tok::Float)
                .map_err(|_| ParseError::new("invalid float literal", span))
        } else {
            text.parse::<i64>()
                .map(Tok::Int)
                .map_err(|_| ParseError::new("integer literal is too large", span))
        }
    }

    fn hex_escape(&mut self, len: usize, span: Span) -> Result<char, ParseError> {
        let mut code = String::new();
        for _ in 0..len {
            match self.bump() {
                Some(c) if c.is_ascii_hexdigit() => code.push(c),
                _ => return Err(ParseError::new("truncated escape sequence", span)),
            }
        }
        u32::from_str_radix(&code, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| ParseError::new("invalid escape sequence", span))
    }

    fn string(&mut self, raw: bool, span: Span) -> Result<String, ParseError> {
        let Some(quote) = self.bump() else {
            return Err(ParseError::new("unterminated string literal", span));
        };
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(ParseError::new("unterminated string literal", span));
            };
            if c == quote {
                if !triple {
                    break;
                }
                if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                    self.bump();
                    self.bump();
                    break;
                }
                out.push(c);
                continue;
            }
            if c == '\n' && !triple {
                return Err(ParseError::new("unterminated string literal", span));
            }
            if c != '\\' {
                out.push(c);
                continue;
            }

            let Some(e) = self.bump() else {
                return Err(ParseError::new("unterminated string literal", span));
            };
            if raw {
                out.push('\\');
                out.push(e);
                continue;
            }
            match e {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' => out.push('\\'),
                '\'' => out.push('\''),
                '"' => out.push('"'),
                '\n' => {}
                'x' => out.push(self.hex_escape(2, span)?),
                'u' => out.push(self.hex_escape(4, span)?),
                'U' => out.push(self.hex_escape(8, span)?),
                other => {
                    out.push('\\');
                    out.push(other);
                }
            }
        }
        Ok(out)
    }

    fn operator(&mut self, c: char, span: Span) -> Result<Op, ParseError> {
        let next = self.peek_at(1);
        let third = self.peek_at(2);
        let (op, len) = match (c, next, third) {
            ('/', Some('/'), Some('=')) => (Op::DoubleSlashAssign, 3),
            ('*', Some('*'), _) => (Op::DoubleStar, 2),
            ('/', Some('/'), _) => (Op::DoubleSlash, 2),
            ('=', Some('='), _) => (Op::Eq, 2),
            ('!', Some('='), _) => (Op::NotEq, 2),
            ('<', Some('='), _) => (Op::LtEq, 2),
            ('>', Some('='), _) => (Op::GtEq, 2),
            ('+', Some('='), _) => (Op::PlusAssign, 2),
            ('-', Some('='), _) => (Op::MinusAssign, 2),
            ('*', Some('='), _) => (Op::StarAssign, 2),
            ('/', Some('='), _) => (Op::SlashAssign, 2),
            ('%', Some('='), _) => (Op::PercentAssign, 2),
            ('(', ..) => (Op::LParen, 1),
            (')', ..) => (Op::RParen, 1),
            ('[', ..) => (Op::LBracket, 1),
            (']', ..) => (Op::RBracket, 1),
            ('{', ..) => (Op::LBrace, 1),
            ('}', ..) => (Op::RBrace, 1),
            (',', ..) => (Op::Comma, 1),
            (':', ..) => (Op::Colon, 1),
            ('.', ..) => (Op::Dot, 1),
            (';', ..) => (Op::Semicolon, 1),
            ('+', ..) => (Op::Plus, 1),
            ('-', ..) => (Op::Minus, 1),
            ('*', ..) => (Op::Star, 1),
            ('/', ..) => (Op::Slash, 1),
            ('%', ..) => (Op::Percent, 1),
            ('=', ..) => (Op::Assign, 1),
            ('<', ..) => (Op::Lt, 1),
            ('>', ..) => (Op::Gt, 1),
            _ => {
                return Err(ParseError::new(
                    format!("unexpected character {c:?}"),
                    span,
                ));
            }
        };
        for _ in 0..len {
            self.bump();
        }
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Tok> {
        tokenize(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn indentation_produces_block_tokens() {
        let toks = kinds("def f():\n    return 1\n");
        assert_eq!(
            toks,
            vec![
                Tok::Kw(Keyword::Def),
                Tok::Name("f".into()),
                Tok::Op(Op::LParen),
                Tok::Op(Op::RParen),
                Tok::Op(Op::Colon),
                Tok::Newline,
                Tok::Indent,
                Tok::Kw(Keyword::Return),
                Tok::Int(1),
                Tok::Newline,
                Tok::Dedent,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn brackets_join_lines_and_comments_vanish() {
        let toks = kinds("x = [1,\n  2]  # trailing\n\n# only comment\n");
        assert_eq!(
            toks,
            vec![
                Tok::Name("x".into()),
                Tok::Op(Op::Assign),
                Tok::Op(Op::LBracket),
                Tok::Int(1),
                Tok::Op(Op::Comma),
                Tok::Int(2),
                Tok::Op(Op::RBracket),
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn string_forms() {
        assert_eq!(kinds("'a\\nb'")[0], Tok::Str("a\nb".into()));
        assert_eq!(kinds("r'a\\nb'")[0], Tok::Str("a\\nb".into()));
        assert_eq!(kinds("\"\"\"x\ny\"\"\"")[0], Tok::Str("x\ny".into()));
        assert_eq!(kinds("'\\x41'")[0], Tok::Str("A".into()));
        assert!(tokenize("f'{x}'").is_err());
        assert!(tokenize("'open").is_err());
    }

    #[test]
    fn numbers() {
        assert_eq!(kinds("1_000")[0], Tok::Int(1000));
        assert_eq!(kinds("0xff")[0], Tok::Int(255));
        assert_eq!(kinds("2.5e3")[0], Tok::Float(2500.0));
        assert_eq!(kinds(".5")[0], Tok::Float(0.5));
        assert!(tokenize("99999999999999999999").is_err());
    }

    #[test]
    fn bad_dedent_is_an_error() {
        let err = tokenize("if x:\n        a\n    b\n").unwrap_err();
        assert!(err.message.contains("unindent"));
        assert_eq!(err.span.line, 3);
    }

    #[test]
    fn non_ascii_identifiers_are_rejected() {
        assert!(tokenize("__ｃlass__").is_err());
    }
}
