//! Tokenizer for strategy scripts.

use super::error::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone)]
pub(crate) struct Spanned {
    pub token: Token,
    pub line: usize,
    pub column: usize,
}

/// Longest first, so `===` wins over `==` and `=`.
const PUNCTUATORS: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "++", "--", "+=", "-=", "*=", "/=",
    "%=", "+", "-", "*", "/", "%", "<", ">", "=", "!", "(", ")", "{", "}", "[", "]", ",",
    ";", ".", ":", "?",
];

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.remaining().chars().nth(1)
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            line: self.line,
            column: self.column,
        }
    }

    /// Skip whitespace, `// line` and `/* block */` comments.
    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            match (self.peek(), self.peek_second()) {
                (Some(ch), _) if ch.is_whitespace() => {
                    self.advance();
                }
                (Some('/'), Some('/')) => {
                    while let Some(ch) = self.peek() {
                        if ch == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                (Some('/'), Some('*')) => {
                    let (line, column) = (self.line, self.column);
                    self.advance();
                    self.advance();
                    loop {
                        match self.peek() {
                            Some('*') if self.peek_second() == Some('/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            Some(_) => {
                                self.advance();
                            }
                            None => {
                                return Err(ParseError {
                                    message: "unterminated comment".to_string(),
                                    line,
                                    column,
                                })
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn number(&mut self) -> Result<Token, ParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(ch) if ch.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some('.') && matches!(self.peek_second(), Some(ch) if ch.is_ascii_digit()) {
            self.advance();
            while matches!(self.peek(), Some(ch) if ch.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let digits_follow = match self.peek_second() {
                Some('+' | '-') => self.remaining().chars().nth(2).is_some_and(|c| c.is_ascii_digit()),
                Some(ch) => ch.is_ascii_digit(),
                None => false,
            };
            if digits_follow {
                self.advance();
                if matches!(self.peek(), Some('+' | '-')) {
                    self.advance();
                }
                while matches!(self.peek(), Some(ch) if ch.is_ascii_digit()) {
                    self.advance();
                }
            }
        }
        let text = &self.input[start..self.pos];
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.error(format!("invalid number: {text}")))
    }

    fn string(&mut self, quote: char) -> Result<Token, ParseError> {
        let (line, column) = (self.line, self.column);
        self.advance();
        let mut out = String::new();
        loop {
            match self.advance() {
                Some(ch) if ch == quote => return Ok(Token::Str(out)),
                Some('\\') => match self.advance() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('0') => out.push('\0'),
                    Some(other) => out.push(other),
                    None => break,
                },
                Some('\n') | None => break,
                Some(ch) => out.push(ch),
            }
        }
        Err(ParseError {
            message: "unterminated string literal".to_string(),
            line,
            column,
        })
    }

    fn ident(&mut self) -> Token {
        let start = self.pos;
        while matches!(self.peek(), Some(ch) if is_ident_char(ch)) {
            self.advance();
        }
        Token::Ident(self.input[start..self.pos].to_string())
    }

    fn next_token(&mut self) -> Result<Spanned, ParseError> {
        self.skip_trivia()?;
        let (line, column) = (self.line, self.column);
        let token = match self.peek() {
            None => Token::Eof,
            Some(ch) if ch.is_ascii_digit() => self.number()?,
            Some('.') if matches!(self.peek_second(), Some(c) if c.is_ascii_digit()) => self.number()?,
            Some(quote @ ('"' | '\'')) => self.string(quote)?,
            Some(ch) if is_ident_start(ch) => self.ident(),
            Some(ch) => {
                let punct = PUNCTUATORS
                    .iter()
                    .find(|p| self.remaining().starts_with(**p))
                    .copied()
                    .ok_or_else(|| self.error(format!("unexpected character '{ch}'")))?;
                for _ in 0..punct.len() {
                    self.advance();
                }
                Token::Punct(punct)
            }
        };
        Ok(Spanned {
            token,
            line,
            column,
        })
    }
}

pub(crate) fn is_ident_start(ch: char) -> bool {
    ch.is_alphabetic() || ch == '_' || ch == '$'
}

pub(crate) fn is_ident_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '$'
}

/// Whether `s` is usable as an identifier (task group and entry names).
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) if is_ident_start(first) => chars.all(is_ident_char),
        _ => false,
    }
}

/// Split source text into tokens, ending with `Token::Eof`.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, ParseError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let spanned = lexer.next_token()?;
        let done = spanned.token == Token::Eof;
        tokens.push(spanned);
        if done {
            return Ok(tokens);
        }
    }
}
