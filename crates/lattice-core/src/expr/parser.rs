//! Recursive-descent / precedence-climbing parser over the token stream
//! produced by [`super::lexer::Lexer`].
//!
//! ```text
//! expr           -> logic_or
//! logic_or       -> logic_and ( "||" logic_and )*
//! logic_and      -> equality ( "&&" equality )*
//! equality       -> comparison ( ("==" | "!=") comparison )*
//! comparison     -> additive ( ("<" | "<=" | ">" | ">=") additive )*
//! additive       -> multiplicative ( ("+" | "-") multiplicative )*
//! multiplicative -> unary ( ("*" | "/" | "%") unary )*
//! unary          -> ("!" | "-")? power
//! power          -> primary ( "^" unary )?
//! primary        -> NUMBER | STRING | IDENT | IDENT "(" (expr ("," expr)*)? ")" | "(" expr ")"
//! ```

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::lexer::{LexError, Lexer, Token};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> Self {
        ParseError(e.0)
    }
}

/// Parse a full formula body (without the leading `=`) into an [`Expr`].
pub fn parse(src: &str) -> Result<Expr, ParseError> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut p = Parser { tokens, pos: 0 };
    let expr = p.parse_expr()?;
    p.expect_eof()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn bump(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect_eof(&self) -> Result<(), ParseError> {
        if *self.peek() == Token::Eof {
            Ok(())
        } else {
            Err(ParseError(format!("unexpected trailing {}", self.peek())))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_logic_or()
    }

    fn parse_logic_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_logic_and()?;
        while *self.peek() == Token::OrOr {
            self.bump();
            let rhs = self.parse_logic_and()?;
            lhs = bin(BinaryOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_logic_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_equality()?;
        while *self.peek() == Token::AndAnd {
            self.bump();
            let rhs = self.parse_equality()?;
            lhs = bin(BinaryOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_comparison()?;
            lhs = bin(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_additive()?;
            lhs = bin(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_multiplicative()?;
            lhs = bin(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = bin(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Token::Bang => {
                self.bump();
                let expr = self.parse_unary()?;
                Ok(Expr::Unary { op: UnaryOp::Not, expr: Box::new(expr) })
            }
            Token::Minus => {
                self.bump();
                let expr = self.parse_unary()?;
                Ok(Expr::Unary { op: UnaryOp::Neg, expr: Box::new(expr) })
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_primary()?;
        if *self.peek() == Token::Caret {
            self.bump();
            // Right-associative: `2 ^ 3 ^ 2 == 2 ^ (3 ^ 2)`.
            let exp = self.parse_unary()?;
            Ok(bin(BinaryOp::Pow, base, exp))
        } else {
            Ok(base)
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.bump() {
            Token::Number(text, value) => Ok(Expr::Number { text, value }),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Ident(name) => {
                if *self.peek() == Token::LParen {
                    self.bump();
                    let args = self.parse_args()?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(ParseError(format!("expected an expression, found {other}"))),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if *self.peek() == Token::RParen {
            self.bump();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            match self.bump() {
                Token::Comma => continue,
                Token::RParen => break,
                other => return Err(ParseError(format!("expected `,` or `)`, found {other}"))),
            }
        }
        Ok(args)
    }

    fn expect(&mut self, want: Token) -> Result<(), ParseError> {
        let got = self.bump();
        if got == want {
            Ok(())
        } else {
            Err(ParseError(format!("expected {want}, found {got}")))
        }
    }
}

fn bin(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_precedence() {
        let e = parse("1+2*3").unwrap();
        assert_eq!(
            e,
            bin(
                BinaryOp::Add,
                Expr::Number { text: "1".into(), value: 1.0 },
                bin(
                    BinaryOp::Mul,
                    Expr::Number { text: "2".into(), value: 2.0 },
                    Expr::Number { text: "3".into(), value: 3.0 },
                ),
            )
        );
    }

    #[test]
    fn parses_power_right_associative() {
        let e = parse("2^3^2").unwrap();
        assert_eq!(
            e,
            bin(
                BinaryOp::Pow,
                Expr::Number { text: "2".into(), value: 2.0 },
                bin(
                    BinaryOp::Pow,
                    Expr::Number { text: "3".into(), value: 3.0 },
                    Expr::Number { text: "2".into(), value: 2.0 },
                ),
            )
        );
    }

    #[test]
    fn parses_call_with_args() {
        let e = parse("SUM(A1,B1,2)").unwrap();
        match e {
            Expr::Call { name, args } => {
                assert_eq!(name, "SUM");
                assert_eq!(args.len(), 3);
            }
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn parses_parenthesized_expr() {
        let e = parse("(1+2)*3").unwrap();
        assert_eq!(
            e,
            bin(
                BinaryOp::Mul,
                bin(
                    BinaryOp::Add,
                    Expr::Number { text: "1".into(), value: 1.0 },
                    Expr::Number { text: "2".into(), value: 2.0 },
                ),
                Expr::Number { text: "3".into(), value: 3.0 },
            )
        );
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse("1+2)").is_err());
    }

    #[test]
    fn rejects_empty_input() {
        assert!(parse("").is_err());
    }
}
