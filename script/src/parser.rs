//! Recursive-descent parser over the lexer's tokens.
//!
//! Statements are newline-terminated; `def`/`if`/`while` blocks close with
//! `end`. Expressions are single-line.

use std::rc::Rc;

use crate::ast::{BinaryOp, Expr, FunctionDef, Program, Stmt, UnaryOp};
use crate::error::SyntaxError;
use crate::lexer::{lex, Spanned, Token};

pub fn parse_program(source: &str, filename: &str) -> Result<Program, SyntaxError> {
    let tokens = lex(source)?;
    let mut parser = Parser::new(&tokens, filename);
    let body = parser.statements(BlockContext::TopLevel)?;
    Ok(Program {
        filename: filename.to_owned(),
        body,
    })
}

/// Parse a single expression; the whole input must be consumed.
pub fn parse_expression(source: &str) -> Result<Expr, SyntaxError> {
    let tokens = lex(source)?;
    let mut parser = Parser::new(&tokens, "<expression>");
    parser.skip_newlines();
    let expr = parser.expression()?;
    parser.skip_newlines();
    if !parser.at_eof() {
        return Err(parser.error_here("unexpected input after expression"));
    }
    Ok(expr)
}

/// Parse a statement sequence outside any file, as `executeStatement` text.
pub fn parse_statements(source: &str) -> Result<Vec<Stmt>, SyntaxError> {
    let tokens = lex(source)?;
    let mut parser = Parser::new(&tokens, "<statement>");
    parser.statements(BlockContext::TopLevel)
}

#[derive(Clone, Copy, PartialEq)]
enum BlockContext {
    TopLevel,
    /// Inside def/while/if: stops at `end`, and at `else` for if-bodies.
    Block,
}

struct Parser<'t> {
    tokens: &'t [Spanned],
    pos: usize,
    filename: String,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Spanned], filename: &str) -> Self {
        Self {
            tokens,
            pos: 0,
            filename: filename.to_owned(),
        }
    }

    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn advance(&mut self) -> Option<&'t Token> {
        let token = self.tokens.get(self.pos).map(|s| &s.token);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at_eof(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn current_line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.line)
            .unwrap_or(1)
    }

    fn error_here(&self, message: impl Into<String>) -> SyntaxError {
        let (line, column) = self
            .tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| (s.line, s.column))
            .unwrap_or((1, 1));
        SyntaxError {
            message: message.into(),
            line,
            column,
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), SyntaxError> {
        match self.peek() {
            Some(token) if token == expected => {
                self.advance();
                Ok(())
            }
            Some(token) => Err(self.error_here(format!("expected {what}, found {}", token.describe()))),
            None => Err(self.error_here(format!("expected {what}, found end of input"))),
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Some(Token::Newline)) {
            self.advance();
        }
    }

    /// Newline or end of input closes a statement.
    fn end_of_statement(&mut self) -> Result<(), SyntaxError> {
        match self.peek() {
            Some(Token::Newline) => {
                self.advance();
                Ok(())
            }
            None => Ok(()),
            Some(token) => {
                Err(self.error_here(format!("expected end of line, found {}", token.describe())))
            }
        }
    }

    /// Parse statements until end of input (top level) or until an `end` /
    /// `else` closes the block (left unconsumed for the caller).
    fn statements(&mut self, context: BlockContext) -> Result<Vec<Stmt>, SyntaxError> {
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                None => {
                    if context == BlockContext::Block {
                        return Err(self.error_here("unexpected end of input, expected \"end\""));
                    }
                    return Ok(body);
                }
                Some(Token::End) | Some(Token::Else) => {
                    if context == BlockContext::TopLevel {
                        return Err(self.error_here("\"end\" without an open block"));
                    }
                    return Ok(body);
                }
                Some(_) => body.push(self.statement()?),
            }
        }
    }

    fn statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.current_line();
        match self.peek() {
            Some(Token::Def) => self.def_statement(line),
            Some(Token::If) => self.if_statement(line),
            Some(Token::While) => self.while_statement(line),
            Some(Token::Return) => {
                self.advance();
                let value = if matches!(self.peek(), Some(Token::Newline) | None) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.end_of_statement()?;
                Ok(Stmt::Return { line, value })
            }
            Some(Token::Raise) => {
                self.advance();
                let value = self.expression()?;
                self.end_of_statement()?;
                Ok(Stmt::Raise { line, value })
            }
            Some(Token::Pass) => {
                self.advance();
                self.end_of_statement()?;
                Ok(Stmt::Pass { line })
            }
            _ => self.expression_or_assignment(line),
        }
    }

    fn def_statement(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        self.advance();
        let name = self.identifier("function name")?;
        self.expect(&Token::LParen, "\"(\"")?;
        let mut params = Vec::new();
        if !matches!(self.peek(), Some(Token::RParen)) {
            loop {
                params.push(self.identifier("parameter name")?);
                match self.peek() {
                    Some(Token::Comma) => {
                        self.advance();
                    }
                    _ => break,
                }
            }
        }
        self.expect(&Token::RParen, "\")\"")?;
        self.end_of_statement()?;
        let body = self.statements(BlockContext::Block)?;
        self.expect(&Token::End, "\"end\"")?;
        self.end_of_statement()?;
        Ok(Stmt::Def {
            line,
            func: Rc::new(FunctionDef {
                name,
                params,
                body: Rc::new(body),
                filename: self.filename.clone(),
                line,
            }),
        })
    }

    fn if_statement(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        self.advance();
        let condition = self.expression()?;
        self.end_of_statement()?;
        let then_body = self.statements(BlockContext::Block)?;
        let else_body = if matches!(self.peek(), Some(Token::Else)) {
            self.advance();
            self.end_of_statement()?;
            self.statements(BlockContext::Block)?
        } else {
            Vec::new()
        };
        self.expect(&Token::End, "\"end\"")?;
        self.end_of_statement()?;
        Ok(Stmt::If {
            line,
            condition,
            then_body,
            else_body,
        })
    }

    fn while_statement(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        self.advance();
        let condition = self.expression()?;
        self.end_of_statement()?;
        let body = self.statements(BlockContext::Block)?;
        self.expect(&Token::End, "\"end\"")?;
        self.end_of_statement()?;
        Ok(Stmt::While {
            line,
            condition,
            body,
        })
    }

    fn expression_or_assignment(&mut self, line: u32) -> Result<Stmt, SyntaxError> {
        let expr = self.expression()?;
        if matches!(self.peek(), Some(Token::Assign)) {
            self.advance();
            let value = self.expression()?;
            self.end_of_statement()?;
            return match expr {
                Expr::Name(name) => Ok(Stmt::Assign { line, name, value }),
                Expr::Index { target, index } => Ok(Stmt::AssignIndex {
                    line,
                    target: *target,
                    index: *index,
                    value,
                }),
                _ => Err(SyntaxError {
                    message: "invalid assignment target".to_owned(),
                    line,
                    column: 1,
                }),
            };
        }
        self.end_of_statement()?;
        Ok(Stmt::Expr { line, expr })
    }

    fn identifier(&mut self, what: &str) -> Result<String, SyntaxError> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            Some(token) => Err(self.error_here(format!("expected {what}, found {}", token.describe()))),
            None => Err(self.error_here(format!("expected {what}, found end of input"))),
        }
    }

    fn expression(&mut self) -> Result<Expr, SyntaxError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.and_expr()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let right = self.and_expr()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.not_expr()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let right = self.not_expr()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, SyntaxError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let operand = self.not_expr()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.arith()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::NotEq,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::LtEq) => BinaryOp::LtEq,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::GtEq) => BinaryOp::GtEq,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.arith()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn arith(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, SyntaxError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.advance();
            let operand = self.unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.current_line();
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&Token::RBracket, "\"]\"")?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Some(Token::LParen) => {
                    self.advance();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        loop {
                            args.push(self.expression()?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.advance();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(&Token::RParen, "\")\"")?;
                    expr = Expr::Call {
                        target: Box::new(expr),
                        args,
                        line,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        match self.peek() {
            Some(Token::Int(v)) => {
                let v = *v;
                self.advance();
                Ok(Expr::Int(v))
            }
            Some(Token::Float(v)) => {
                let v = *v;
                self.advance();
                Ok(Expr::Float(v))
            }
            Some(Token::Str(s)) => {
                let s = s.clone();
                self.advance();
                Ok(Expr::Str(s))
            }
            Some(Token::True) => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Some(Token::None) => {
                self.advance();
                Ok(Expr::None)
            }
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.advance();
                Ok(Expr::Name(name))
            }
            Some(Token::LParen) => {
                self.advance();
                let expr = self.expression()?;
                self.expect(&Token::RParen, "\")\"")?;
                Ok(expr)
            }
            Some(Token::LBracket) => {
                self.advance();
                let mut items = Vec::new();
                if !matches!(self.peek(), Some(Token::RBracket)) {
                    loop {
                        items.push(self.expression()?);
                        match self.peek() {
                            Some(Token::Comma) => {
                                self.advance();
                            }
                            _ => break,
                        }
                    }
                }
                self.expect(&Token::RBracket, "\"]\"")?;
                Ok(Expr::List(items))
            }
            Some(Token::LBrace) => {
                self.advance();
                let mut pairs = Vec::new();
                if !matches!(self.peek(), Some(Token::RBrace)) {
                    loop {
                        let key = self.expression()?;
                        self.expect(&Token::Colon, "\":\"")?;
                        let value = self.expression()?;
                        pairs.push((key, value));
                        match self.peek() {
                            Some(Token::Comma) => {
                                self.advance();
                            }
                            _ => break,
                        }
                    }
                }
                self.expect(&Token::RBrace, "\"}\"")?;
                Ok(Expr::Map(pairs))
            }
            Some(token) => Err(self.error_here(format!(
                "expected an expression, found {}",
                token.describe()
            ))),
            None => Err(self.error_here("expected an expression, found end of input")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_and_expression_statements() {
        let program = parse_program("x = 1\nprint(x)\n", "t.scr").expect("parsing");
        assert_eq!(program.body.len(), 2);
        assert!(matches!(&program.body[0], Stmt::Assign { name, .. } if name == "x"));
        assert!(matches!(&program.body[1], Stmt::Expr { .. }));
    }

    #[test]
    fn block_statements_nest() {
        let source = "\
def f(a, b)
    if a > b
        return a
    else
        return b
    end
end
r = f(1, 2)
";
        let program = parse_program(source, "t.scr").expect("parsing");
        assert_eq!(program.body.len(), 2);
        let Stmt::Def { func, .. } = &program.body[0] else {
            panic!("expected def");
        };
        assert_eq!(func.params, vec!["a", "b"]);
        assert!(matches!(func.body[0], Stmt::If { .. }));
    }

    #[test]
    fn statement_lines_are_recorded() {
        let source = "a = 1\n\nb = 2\nwhile a < 3\n    a = a + 1\nend\n";
        let program = parse_program(source, "t.scr").expect("parsing");
        let lines: Vec<u32> = program.body.iter().map(|s| s.line()).collect();
        assert_eq!(lines, vec![1, 3, 4]);
        let Stmt::While { body, .. } = &program.body[2] else {
            panic!("expected while");
        };
        assert_eq!(body[0].line(), 5);
    }

    #[test]
    fn missing_end_is_a_syntax_error() {
        let err = parse_program("while true\n    pass\n", "t.scr").expect_err("should fail");
        assert!(err.message.contains("end"));
    }

    #[test]
    fn operator_precedence() {
        let expr = parse_expression("1 + 2 * 3 > 4 and not 5 == 6").expect("parsing");
        // Shape: ((1 + (2*3)) > 4) and (not (5 == 6))
        let Expr::Binary {
            op: BinaryOp::And,
            left,
            right,
        } = expr
        else {
            panic!("expected and at the root");
        };
        assert!(matches!(
            *left,
            Expr::Binary {
                op: BinaryOp::Gt,
                ..
            }
        ));
        assert!(matches!(
            *right,
            Expr::Unary {
                op: UnaryOp::Not,
                ..
            }
        ));
    }

    #[test]
    fn trailing_garbage_after_expression_fails() {
        assert!(parse_expression("x >").is_err());
        assert!(parse_expression("x 5").is_err());
        assert!(parse_expression("").is_err());
    }

    #[test]
    fn index_assignment_parses() {
        let program = parse_program("xs[0] = 5\n", "t.scr").expect("parsing");
        assert!(matches!(&program.body[0], Stmt::AssignIndex { .. }));
    }

    #[test]
    fn call_chains_and_indexing() {
        let expr = parse_expression("table[\"key\"][1]").expect("parsing");
        assert!(matches!(expr, Expr::Index { .. }));
    }

    #[test]
    fn shadowed_names_are_found() {
        let source = "def print(x)\n    pass\nend\ndef helper()\n    def len(y)\n        pass\n    end\nend\n";
        let program = parse_program(source, "t.scr").expect("parsing");
        assert_eq!(
            program.shadowed_names(&["print", "len", "input"]),
            vec!["len".to_owned(), "print".to_owned()]
        );
    }
}
