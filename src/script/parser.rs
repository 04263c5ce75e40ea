//! Recursive descent parser for strategy scripts.
//!
//! Produces a [`Program`] or a [`ParseError`] carrying the line and
//! column of the offending token and what was expected there.

use std::sync::Arc;

use super::ast::{BinaryOp, Expr, FunctionDef, LogicalOp, Program, Stmt, UnaryOp};
use super::error::ParseError;
use super::lexer::{tokenize, Spanned, Token};

const KEYWORDS: &[&str] = &[
    "var", "let", "const", "function", "if", "else", "while", "for", "return", "break",
    "continue", "throw", "true", "false", "null", "undefined", "typeof",
];

/// Bound on syntactic nesting (blocks, parentheses, literals, operator
/// chains). Evaluation recurses over the same tree, so this also bounds
/// the native stack a unit needs.
const MAX_NESTING: usize = 256;

/// Parse a complete script.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    let mut parser = Parser {
        tokens: tokenize(source)?,
        pos: 0,
        depth: 0,
    };
    let mut body = Vec::new();
    while !parser.at_eof() {
        body.push(parser.statement()?);
    }
    Ok(Program { body })
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn current(&self) -> &Spanned {
        // tokenize() always ends with Eof, and the parser never moves past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        &self.current().token
    }

    fn advance(&mut self) -> Token {
        let token = self.current().token.clone();
        if token != Token::Eof {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        *self.peek() == Token::Eof
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        let current = self.current();
        ParseError {
            message: message.into(),
            line: current.line,
            column: current.column,
        }
    }

    fn describe(token: &Token) -> String {
        match token {
            Token::Number(n) => format!("number {n}"),
            Token::Str(s) => format!("string '{s}'"),
            Token::Ident(name) => format!("'{name}'"),
            Token::Punct(p) => format!("'{p}'"),
            Token::Eof => "end of input".to_string(),
        }
    }

    fn is_punct(&self, punct: &str) -> bool {
        matches!(self.peek(), Token::Punct(p) if *p == punct)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.is_punct(punct) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), ParseError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.error(format!(
                "expected '{}', found {}",
                punct,
                Self::describe(self.peek())
            )))
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Ident(name) if name == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Token::Ident(name) if !KEYWORDS.contains(&name.as_str()) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(self.error(format!(
                "expected identifier, found {}",
                Self::describe(other)
            ))),
        }
    }

    fn end_statement(&mut self) {
        self.eat_punct(";");
    }

    /// One level deeper. Callers restore `depth` on success only: any
    /// error aborts the whole parse.
    fn descend(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        Ok(())
    }

    // -- Statements -----------------------------------------------------

    fn statement(&mut self) -> Result<Stmt, ParseError> {
        self.descend()?;
        let stmt = self.statement_kind()?;
        self.depth -= 1;
        Ok(stmt)
    }

    fn statement_kind(&mut self) -> Result<Stmt, ParseError> {
        if self.is_punct("{") {
            self.advance();
            return Ok(Stmt::Block(self.block_body()?));
        }
        if self.eat_punct(";") {
            return Ok(Stmt::Empty);
        }
        if self.is_keyword("var") || self.is_keyword("let") || self.is_keyword("const") {
            let stmt = self.var_declaration()?;
            self.end_statement();
            return Ok(stmt);
        }
        if self.is_keyword("function") {
            self.advance();
            let name = self.expect_ident()?;
            let def = self.function_rest(Some(name))?;
            return Ok(Stmt::Function(def));
        }
        if self.eat_keyword("if") {
            self.expect_punct("(")?;
            let cond = self.expression()?;
            self.expect_punct(")")?;
            let then = Box::new(self.statement()?);
            let otherwise = if self.eat_keyword("else") {
                Some(Box::new(self.statement()?))
            } else {
                None
            };
            return Ok(Stmt::If {
                cond,
                then,
                otherwise,
            });
        }
        if self.eat_keyword("while") {
            self.expect_punct("(")?;
            let cond = self.expression()?;
            self.expect_punct(")")?;
            let body = Box::new(self.statement()?);
            return Ok(Stmt::While { cond, body });
        }
        if self.eat_keyword("for") {
            return self.for_statement();
        }
        if self.eat_keyword("return") {
            let value = if self.is_punct(";") || self.is_punct("}") || self.at_eof() {
                None
            } else {
                Some(self.expression()?)
            };
            self.end_statement();
            return Ok(Stmt::Return(value));
        }
        if self.eat_keyword("break") {
            self.end_statement();
            return Ok(Stmt::Break);
        }
        if self.eat_keyword("continue") {
            self.end_statement();
            return Ok(Stmt::Continue);
        }
        if self.eat_keyword("throw") {
            let value = self.expression()?;
            self.end_statement();
            return Ok(Stmt::Throw(value));
        }
        let expr = self.expression()?;
        self.end_statement();
        Ok(Stmt::Expr(expr))
    }

    /// Statements up to and including the closing `}`.
    fn block_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut body = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(self.error("expected '}', found end of input"));
            }
            body.push(self.statement()?);
        }
        self.advance();
        Ok(body)
    }

    /// `var a = 1, b`: several declarators become a block.
    fn var_declaration(&mut self) -> Result<Stmt, ParseError> {
        self.advance();
        let mut decls = Vec::new();
        loop {
            let name = self.expect_ident()?;
            let init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            decls.push(Stmt::Var { name, init });
            if !self.eat_punct(",") {
                break;
            }
        }
        if decls.len() == 1 {
            Ok(decls.remove(0))
        } else {
            Ok(Stmt::Block(decls))
        }
    }

    fn for_statement(&mut self) -> Result<Stmt, ParseError> {
        self.expect_punct("(")?;
        let init = if self.is_punct(";") {
            None
        } else if self.is_keyword("var") || self.is_keyword("let") || self.is_keyword("const") {
            Some(Box::new(self.var_declaration()?))
        } else {
            Some(Box::new(Stmt::Expr(self.expression()?)))
        };
        self.expect_punct(";")?;
        let cond = if self.is_punct(";") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(";")?;
        let step = if self.is_punct(")") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
        })
    }

    /// Parameter list and body, after `function [name]`.
    fn function_rest(&mut self, name: Option<String>) -> Result<Arc<FunctionDef>, ParseError> {
        self.expect_punct("(")?;
        let mut params = Vec::new();
        if !self.is_punct(")") {
            loop {
                params.push(self.expect_ident()?);
                if !self.eat_punct(",") {
                    break;
                }
            }
        }
        self.expect_punct(")")?;
        self.expect_punct("{")?;
        let body = self.block_body()?;
        Ok(Arc::new(FunctionDef { name, params, body }))
    }

    // -- Expressions ----------------------------------------------------

    fn expression(&mut self) -> Result<Expr, ParseError> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr, ParseError> {
        self.descend()?;
        let expr = self.assignment_expr()?;
        self.depth -= 1;
        Ok(expr)
    }

    fn assignment_expr(&mut self) -> Result<Expr, ParseError> {
        let target = self.conditional()?;
        let op = match self.peek() {
            Token::Punct("=") => None,
            Token::Punct("+=") => Some(BinaryOp::Add),
            Token::Punct("-=") => Some(BinaryOp::Sub),
            Token::Punct("*=") => Some(BinaryOp::Mul),
            Token::Punct("/=") => Some(BinaryOp::Div),
            Token::Punct("%=") => Some(BinaryOp::Mod),
            _ => return Ok(target),
        };
        if !target.is_place() {
            return Err(self.error("invalid assignment target"));
        }
        self.advance();
        let value = self.assignment()?;
        Ok(Expr::Assign {
            target: Box::new(target),
            op,
            value: Box::new(value),
        })
    }

    fn conditional(&mut self) -> Result<Expr, ParseError> {
        let cond = self.logical_or()?;
        if !self.eat_punct("?") {
            return Ok(cond);
        }
        let then = self.assignment()?;
        self.expect_punct(":")?;
        let otherwise = self.assignment()?;
        Ok(Expr::Conditional {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn logical_or(&mut self) -> Result<Expr, ParseError> {
        let base = self.depth;
        let mut left = self.logical_and()?;
        while self.eat_punct("||") {
            self.descend()?;
            let right = self.logical_and()?;
            left = Expr::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth = base;
        Ok(left)
    }

    fn logical_and(&mut self) -> Result<Expr, ParseError> {
        let base = self.depth;
        let mut left = self.equality()?;
        while self.eat_punct("&&") {
            self.descend()?;
            let right = self.equality()?;
            left = Expr::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth = base;
        Ok(left)
    }

    /// One left-associative precedence level.
    fn binary_level(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr, ParseError>,
    ) -> Result<Expr, ParseError> {
        let base = self.depth;
        let mut left = next(self)?;
        'outer: loop {
            for (punct, op) in ops {
                if self.eat_punct(punct) {
                    self.descend()?;
                    let right = next(self)?;
                    left = Expr::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    continue 'outer;
                }
            }
            self.depth = base;
            return Ok(left);
        }
    }

    fn equality(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            &[
                ("===", BinaryOp::StrictEq),
                ("!==", BinaryOp::StrictNe),
                ("==", BinaryOp::Eq),
                ("!=", BinaryOp::Ne),
            ],
            Self::relational,
        )
    }

    fn relational(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            &[
                ("<=", BinaryOp::Le),
                (">=", BinaryOp::Ge),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(&[("+", BinaryOp::Add), ("-", BinaryOp::Sub)], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        self.binary_level(
            &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Mod)],
            Self::unary,
        )
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        self.descend()?;
        let expr = self.unary_expr()?;
        self.depth -= 1;
        Ok(expr)
    }

    fn unary_expr(&mut self) -> Result<Expr, ParseError> {
        let op = if self.eat_punct("!") {
            Some(UnaryOp::Not)
        } else if self.eat_punct("-") {
            Some(UnaryOp::Neg)
        } else if self.eat_punct("+") {
            Some(UnaryOp::Plus)
        } else if self.eat_keyword("typeof") {
            Some(UnaryOp::TypeOf)
        } else {
            None
        };
        if let Some(op) = op {
            let expr = self.unary()?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
            });
        }
        for (punct, delta) in [("++", 1.0), ("--", -1.0)] {
            if self.eat_punct(punct) {
                let target = self.unary()?;
                if !target.is_place() {
                    return Err(self.error(format!("invalid operand for '{punct}'")));
                }
                return Ok(Expr::Update {
                    target: Box::new(target),
                    delta,
                    prefix: true,
                });
            }
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let expr = self.call_member()?;
        if expr.is_place() {
            for (punct, delta) in [("++", 1.0), ("--", -1.0)] {
                if self.eat_punct(punct) {
                    return Ok(Expr::Update {
                        target: Box::new(expr),
                        delta,
                        prefix: false,
                    });
                }
            }
        }
        Ok(expr)
    }

    fn call_member(&mut self) -> Result<Expr, ParseError> {
        let base = self.depth;
        let mut expr = self.primary()?;
        loop {
            if self.is_punct(".") || self.is_punct("[") || self.is_punct("(") {
                self.descend()?;
            }
            if self.eat_punct(".") {
                let name = match self.advance() {
                    Token::Ident(name) => name,
                    other => {
                        return Err(self.error(format!(
                            "expected property name, found {}",
                            Self::describe(&other)
                        )))
                    }
                };
                expr = Expr::Member {
                    object: Box::new(expr),
                    name,
                };
            } else if self.eat_punct("[") {
                let index = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_punct("(") {
                let args = self.arguments()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else {
                self.depth = base;
                return Ok(expr);
            }
        }
    }

    /// Comma-separated expressions up to and including `)`.
    fn arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat_punct(")") {
            return Ok(args);
        }
        loop {
            args.push(self.assignment()?);
            if self.eat_punct(")") {
                return Ok(args);
            }
            self.expect_punct(",")?;
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek().clone() {
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            Token::Ident(name) => match name.as_str() {
                "true" | "false" => {
                    self.advance();
                    Ok(Expr::Bool(name == "true"))
                }
                "null" => {
                    self.advance();
                    Ok(Expr::Null)
                }
                "undefined" => {
                    self.advance();
                    Ok(Expr::Undefined)
                }
                "function" => {
                    self.advance();
                    let fn_name = if matches!(self.peek(), Token::Ident(_)) {
                        Some(self.expect_ident()?)
                    } else {
                        None
                    };
                    Ok(Expr::Function(self.function_rest(fn_name)?))
                }
                _ if KEYWORDS.contains(&name.as_str()) => {
                    Err(self.error(format!("unexpected keyword '{name}'")))
                }
                _ => {
                    self.advance();
                    Ok(Expr::Ident(name))
                }
            },
            Token::Punct("(") => {
                self.advance();
                let expr = self.expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            Token::Punct("[") => {
                self.advance();
                let mut items = Vec::new();
                while !self.eat_punct("]") {
                    items.push(self.assignment()?);
                    if !self.is_punct("]") {
                        self.expect_punct(",")?;
                    }
                }
                Ok(Expr::Array(items))
            }
            Token::Punct("{") => {
                self.advance();
                let mut fields = Vec::new();
                while !self.eat_punct("}") {
                    let key = match self.advance() {
                        Token::Ident(name) => name,
                        Token::Str(s) => s,
                        Token::Number(n) => super::value::format_number(n),
                        other => {
                            return Err(self.error(format!(
                                "expected property name, found {}",
                                Self::describe(&other)
                            )))
                        }
                    };
                    self.expect_punct(":")?;
                    fields.push((key, self.assignment()?));
                    if !self.is_punct("}") {
                        self.expect_punct(",")?;
                    }
                }
                Ok(Expr::Object(fields))
            }
            other => Err(self.error(format!("unexpected {}", Self::describe(&other)))),
        }
    }
}
