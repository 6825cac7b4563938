//! Scanner producing a token stream from rill source code.

use crate::error::LexerError;
use crate::lexer::token::{Token, TokenKind};
use crate::span::Span;

/// Longest permitted string literal, in bytes.
pub const STR_MAX: usize = 1000;

/// The scanner transforms source text into a stream of tokens.
pub struct Scanner<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    current_pos: usize,
    line: usize,
    column: usize,
    start_pos: usize,
    start_line: usize,
    start_column: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            current_pos: 0,
            line: 1,
            column: 1,
            start_pos: 0,
            start_line: 1,
            start_column: 1,
        }
    }

    /// Scan all tokens from the source.
    pub fn scan_tokens(&mut self) -> Result<Vec<Token>, LexerError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.scan_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }

        Ok(tokens)
    }

    /// Scan the next token.
    fn scan_token(&mut self) -> Result<Token, LexerError> {
        self.skip_trivia();
        self.mark_start();

        let Some((_, c)) = self.advance() else {
            return Ok(Token::eof(self.current_pos, self.line, self.column));
        };

        match c {
            '(' => Ok(self.make_token(TokenKind::LParen)),
            ')' => Ok(self.make_token(TokenKind::RParen)),
            '{' => Ok(self.make_token(TokenKind::LBrace)),
            '}' => Ok(self.make_token(TokenKind::RBrace)),
            ']' => Ok(self.make_token(TokenKind::RBracket)),
            ',' => Ok(self.make_token(TokenKind::Comma)),
            ':' => Ok(self.make_token(TokenKind::Colon)),
            '+' => Ok(self.make_token(TokenKind::Plus)),
            '-' => Ok(self.make_token(TokenKind::Minus)),
            '*' => Ok(self.make_token(TokenKind::Star)),
            '/' => Ok(self.make_token(TokenKind::Slash)),
            '%' => Ok(self.make_token(TokenKind::Percent)),
            '#' => Ok(self.make_token(TokenKind::Hash)),
            '~' => Ok(self.make_token(TokenKind::Tilde)),
            '[' => {
                // Distinguish a [[ long string from a nested vector literal
                // [[...], ...]. Digits, minus and a further bracket begin a
                // nested vector; anything else opens a long string.
                if self.peek() == Some('[') {
                    match self.peek_at(1) {
                        Some(c) if c.is_ascii_digit() => Ok(self.make_token(TokenKind::LBracket)),
                        Some('-') | Some('[') => Ok(self.make_token(TokenKind::LBracket)),
                        _ => {
                            self.advance(); // second [
                            self.scan_long_string()
                        }
                    }
                } else {
                    Ok(self.make_token(TokenKind::LBracket))
                }
            }
            '.' => {
                if self.peek() == Some('.') && self.peek_at(1) == Some('.') {
                    self.advance();
                    self.advance();
                    Ok(self.make_token(TokenKind::Ellipsis))
                } else {
                    Ok(self.make_token(TokenKind::Dot))
                }
            }
            '=' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::Eq))
                } else {
                    Ok(self.make_token(TokenKind::Assign))
                }
            }
            '!' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::Ne))
                } else {
                    Ok(self.make_token(TokenKind::Bang))
                }
            }
            '<' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::Le))
                } else {
                    Ok(self.make_token(TokenKind::Lt))
                }
            }
            '>' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::Ge))
                } else {
                    Ok(self.make_token(TokenKind::Gt))
                }
            }
            '&' => {
                if self.match_char('&') {
                    Ok(self.make_token(TokenKind::And))
                } else {
                    Err(LexerError::unexpected_char(c, self.current_span()))
                }
            }
            '|' => {
                if self.match_char('|') {
                    Ok(self.make_token(TokenKind::Or))
                } else {
                    Err(LexerError::unexpected_char(c, self.current_span()))
                }
            }

            '"' => self.scan_string(),

            c if c.is_ascii_digit() => self.scan_number(c),
            c if is_name_first(c) => self.scan_identifier(c),

            _ => Err(LexerError::unexpected_char(c, self.current_span())),
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                // semicolons separate statements but carry no meaning
                Some(' ' | '\t' | '\r' | ';') => {
                    self.advance();
                }
                Some('\n') => {
                    self.advance();
                    self.line += 1;
                    self.column = 1;
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while self.peek().is_some() && self.peek() != Some('\n') {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn scan_string(&mut self) -> Result<Token, LexerError> {
        let mut value = String::new();
        loop {
            let Some((_, c)) = self.advance() else {
                return Err(LexerError::unterminated_string(self.current_span()));
            };
            match c {
                '"' => break,
                '\\' => {
                    let Some((_, e)) = self.advance() else {
                        return Err(LexerError::unterminated_string(self.current_span()));
                    };
                    value.push(match e {
                        'a' => '\x07',
                        'b' => '\x08',
                        'f' => '\x0c',
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        'v' => '\x0b',
                        other => other,
                    });
                }
                '\n' => {
                    self.line += 1;
                    self.column = 1;
                    value.push(c);
                }
                _ => value.push(c),
            }
            if value.len() > STR_MAX {
                return Err(LexerError::StringTooLong {
                    got: value.len(),
                    max: STR_MAX,
                    span: self.current_span(),
                });
            }
        }
        Ok(self.make_token(TokenKind::Str(value)))
    }

    fn scan_long_string(&mut self) -> Result<Token, LexerError> {
        let mut value = String::new();
        loop {
            let Some((_, c)) = self.advance() else {
                return Err(LexerError::unterminated_string(self.current_span()));
            };
            if c == ']' && self.peek() == Some(']') {
                self.advance();
                break;
            }
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            }
            value.push(c);
        }
        Ok(self.make_token(TokenKind::LongStr(value)))
    }

    fn scan_number(&mut self, first: char) -> Result<Token, LexerError> {
        let mut text = String::new();
        text.push(first);

        // hexadecimal integer
        if first == '0' && matches!(self.peek(), Some('x') | Some('X')) {
            self.advance();
            let mut digits = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() {
                    digits.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            return match i64::from_str_radix(&digits, 16) {
                Ok(n) => Ok(self.make_token(TokenKind::Int(n))),
                Err(_) => Err(LexerError::invalid_number(
                    format!("0x{}", digits),
                    self.current_span(),
                )),
            };
        }

        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let mut is_float = false;

        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            text.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }

        if matches!(self.peek(), Some('e') | Some('E')) {
            let sign = self.peek_at(1);
            let digit_after_sign = matches!(sign, Some('+') | Some('-'))
                && self.peek_at(2).is_some_and(|c| c.is_ascii_digit());
            let plain_digit = sign.is_some_and(|c| c.is_ascii_digit());
            if digit_after_sign || plain_digit {
                is_float = true;
                text.push('e');
                self.advance();
                if digit_after_sign {
                    text.push(sign.unwrap_or('+'));
                    self.advance();
                }
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }

        if is_float {
            match text.parse::<f64>() {
                Ok(n) => Ok(self.make_token(TokenKind::Float(n))),
                Err(_) => Err(LexerError::invalid_number(text, self.current_span())),
            }
        } else {
            match text.parse::<i64>() {
                Ok(n) => Ok(self.make_token(TokenKind::Int(n))),
                Err(_) => Err(LexerError::invalid_number(text, self.current_span())),
            }
        }
    }

    fn scan_identifier(&mut self, first: char) -> Result<Token, LexerError> {
        let mut name = String::new();
        name.push(first);
        while let Some(c) = self.peek() {
            if is_name(c) {
                name.push(c);
                self.advance();
            } else {
                break;
            }
        }
        match TokenKind::keyword(&name) {
            Some(kind) => Ok(self.make_token(kind)),
            None => Ok(self.make_token(TokenKind::Name(name))),
        }
    }

    // ===== Cursor helpers =====

    fn mark_start(&mut self) {
        self.start_pos = self.current_pos;
        self.start_line = self.line;
        self.start_column = self.column;
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        let next = self.chars.next();
        if let Some((pos, c)) = next {
            self.current_pos = pos + c.len_utf8();
            self.column += 1;
        }
        next
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.source[self.current_pos..].chars().nth(n)
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(
            kind,
            Span::new(
                self.start_pos,
                self.current_pos,
                self.start_line,
                self.start_column,
            ),
        )
    }

    fn current_span(&self) -> Span {
        Span::new(self.start_pos, self.current_pos, self.line, self.column)
    }
}

pub fn is_name_first(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

pub fn is_name(c: char) -> bool {
    is_name_first(c) || c.is_ascii_digit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Scanner::new(source)
            .scan_tokens()
            .expect("scan failed")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn scans_numbers() {
        assert_eq!(
            kinds("1 42 0x10 3.5 1e3"),
            vec![
                TokenKind::Int(1),
                TokenKind::Int(42),
                TokenKind::Int(16),
                TokenKind::Float(3.5),
                TokenKind::Float(1000.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_strings_with_escapes() {
        assert_eq!(
            kinds(r#""a\tb\"c""#),
            vec![TokenKind::Str("a\tb\"c".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn long_string_vs_nested_vector() {
        assert_eq!(
            kinds("[[hello]]"),
            vec![TokenKind::LongStr("hello".into()), TokenKind::Eof]
        );
        // [[1,2],[3]] opens two vector literals
        let ks = kinds("[[1,2],[3]]");
        assert_eq!(ks[0], TokenKind::LBracket);
        assert_eq!(ks[1], TokenKind::LBracket);
    }

    #[test]
    fn semicolons_are_trivia() {
        assert_eq!(
            kinds("a = 1; b = 2"),
            vec![
                TokenKind::Name("a".into()),
                TokenKind::Assign,
                TokenKind::Int(1),
                TokenKind::Name("b".into()),
                TokenKind::Assign,
                TokenKind::Int(2),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn keywords_and_operators() {
        assert_eq!(
            kinds("while x >= 10 and y != nil do end"),
            vec![
                TokenKind::While,
                TokenKind::Name("x".into()),
                TokenKind::Ge,
                TokenKind::Int(10),
                TokenKind::And,
                TokenKind::Name("y".into()),
                TokenKind::Ne,
                TokenKind::Nil,
                TokenKind::Do,
                TokenKind::End,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn line_comments() {
        assert_eq!(
            kinds("1 // comment\n2"),
            vec![TokenKind::Int(1), TokenKind::Int(2), TokenKind::Eof]
        );
    }

    #[test]
    fn unterminated_string_errors() {
        assert!(Scanner::new("\"abc").scan_tokens().is_err());
    }
}
