//! Hand-rolled tokenizer for formula bodies.
//!
//! There's no off-the-shelf crate offering the narrow, slightly unusual
//! grammar formulas need here (undefined identifiers are a deferred lookup,
//! not a syntax error; `&&`/`||`/comparisons but no assignment, no
//! statements), so it's written by hand the way a small expression language
//! in this corpus would be: a token enum, a `Lexer` that walks a char
//! cursor, and a parser (see `parser.rs`) built on top of it.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(String, f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LParen,
    RParen,
    Comma,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    AndAnd,
    OrOr,
    Bang,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(s, _) => write!(f, "number `{s}`"),
            Token::Str(s) => write!(f, "string {s:?}"),
            Token::Ident(s) => write!(f, "identifier `{s}`"),
            Token::Plus => write!(f, "`+`"),
            Token::Minus => write!(f, "`-`"),
            Token::Star => write!(f, "`*`"),
            Token::Slash => write!(f, "`/`"),
            Token::Percent => write!(f, "`%`"),
            Token::Caret => write!(f, "`^`"),
            Token::LParen => write!(f, "`(`"),
            Token::RParen => write!(f, "`)`"),
            Token::Comma => write!(f, "`,`"),
            Token::Lt => write!(f, "`<`"),
            Token::Le => write!(f, "`<=`"),
            Token::Gt => write!(f, "`>`"),
            Token::Ge => write!(f, "`>=`"),
            Token::EqEq => write!(f, "`==`"),
            Token::Ne => write!(f, "`!=`"),
            Token::AndAnd => write!(f, "`&&`"),
            Token::OrOr => write!(f, "`||`"),
            Token::Bang => write!(f, "`!`"),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexError(pub String);

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    src: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer { chars: src.chars().collect(), pos: 0, src }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    /// Tokenize the whole input, ending with a single [`Token::Eof`].
    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let done = tok == Token::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace();
        let Some(c) = self.peek() else {
            return Ok(Token::Eof);
        };

        if c.is_ascii_digit() {
            return Ok(self.lex_number());
        }
        if is_ident_start(c) {
            return Ok(self.lex_ident());
        }
        if c == '"' || c == '\'' {
            return self.lex_string(c);
        }

        self.pos += 1;
        match c {
            '+' => Ok(Token::Plus),
            '-' => Ok(Token::Minus),
            '*' => Ok(Token::Star),
            '/' => Ok(Token::Slash),
            '%' => Ok(Token::Percent),
            '^' => Ok(Token::Caret),
            '(' => Ok(Token::LParen),
            ')' => Ok(Token::RParen),
            ',' => Ok(Token::Comma),
            '<' => {
                if self.peek() == Some('=') {
                    self.pos += 1;
                    Ok(Token::Le)
                } else {
                    Ok(Token::Lt)
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.pos += 1;
                    Ok(Token::Ge)
                } else {
                    Ok(Token::Gt)
                }
            }
            '=' => {
                if self.peek() == Some('=') {
                    self.pos += 1;
                    Ok(Token::EqEq)
                } else {
                    Err(LexError(format!("unexpected `=` in {:?}", self.src)))
                }
            }
            '!' => {
                if self.peek() == Some('=') {
                    self.pos += 1;
                    Ok(Token::Ne)
                } else {
                    Ok(Token::Bang)
                }
            }
            '&' if self.peek() == Some('&') => {
                self.pos += 1;
                Ok(Token::AndAnd)
            }
            '|' if self.peek() == Some('|') => {
                self.pos += 1;
                Ok(Token::OrOr)
            }
            other => Err(LexError(format!("unexpected character `{other}` in {:?}", self.src))),
        }
    }

    fn lex_number(&mut self) -> Token {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some('.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let save = self.pos;
            self.pos += 1;
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.pos += 1;
            }
            if matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                    self.pos += 1;
                }
            } else {
                self.pos = save;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        let value = text.parse::<f64>().unwrap_or(f64::NAN);
        Token::Number(text, value)
    }

    /// Identifiers are upper-cased as they're tokenized so a formula can
    /// reference a cell in any case and still land on the same canonical
    /// key the cell is stored under, without running the whole formula
    /// body through the identifier canonicalizer (which would also hide
    /// the quote characters that delimit string literals).
    fn lex_ident(&mut self) -> Token {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_continue(c)) {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect::<String>().to_uppercase();
        Token::Ident(text)
    }

    fn lex_string(&mut self, quote: char) -> Result<Token, LexError> {
        self.pos += 1; // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(LexError(format!("unterminated string literal in {:?}", self.src))),
                Some(c) if c == quote => break,
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => return Err(LexError(format!("unterminated string literal in {:?}", self.src))),
                },
                Some(c) => out.push(c),
            }
        }
        Ok(Token::Str(out))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(s: &str) -> Vec<Token> {
        Lexer::new(s).tokenize().unwrap()
    }

    #[test]
    fn lexes_arithmetic() {
        assert_eq!(
            lex("1+2*3"),
            vec![
                Token::Number("1".into(), 1.0),
                Token::Plus,
                Token::Number("2".into(), 2.0),
                Token::Star,
                Token::Number("3".into(), 3.0),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn lexes_float_and_comparisons() {
        assert_eq!(
            lex("1.5 <= A2"),
            vec![
                Token::Number("1.5".into(), 1.5),
                Token::Le,
                Token::Ident("A2".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn lexes_function_call_and_string() {
        assert_eq!(
            lex("SUM(A1,\"x\")"),
            vec![
                Token::Ident("SUM".into()),
                Token::LParen,
                Token::Ident("A1".into()),
                Token::Comma,
                Token::Str("x".into()),
                Token::RParen,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn lexes_logical_operators() {
        assert_eq!(
            lex("!A1 && B1 || C1"),
            vec![
                Token::Bang,
                Token::Ident("A1".into()),
                Token::AndAnd,
                Token::Ident("B1".into()),
                Token::OrOr,
                Token::Ident("C1".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(Lexer::new("\"abc").tokenize().is_err());
    }

    #[test]
    fn identifiers_are_upper_cased_but_strings_are_not() {
        assert_eq!(
            lex("sum(a1,\"mixedCase\")"),
            vec![
                Token::Ident("SUM".into()),
                Token::LParen,
                Token::Ident("A1".into()),
                Token::Comma,
                Token::Str("mixedCase".into()),
                Token::RParen,
                Token::Eof,
            ]
        );
    }
}
