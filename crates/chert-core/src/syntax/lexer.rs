//! Lexical analysis.
//!
//! The lexer walks raw bytes with a one-byte cursor and yields tokens
//! lazily through its [`Iterator`] impl; [`tokenize`] collects them into
//! the retained token vector the parser indexes for lookahead.
//! Multi-character punctuators are matched longest-first. Each included
//! file gets its own lexer over its own [`SourceId`], which is what
//! makes the logical source stack restartable.

use crate::interner::Interner;
use crate::source::{SourceId, Span};
use crate::types::FixnumKind;

use super::token::{lookup_keyword, Token, TokenKind};

/// A fatal lexical error; aborts translation-unit processing.
#[derive(Debug, thiserror::Error)]
pub enum LexError {
    #[error("unrecognized character: {ch:?}")]
    Unrecognized { ch: char, span: Span },
    #[error("unterminated string literal")]
    UnterminatedString { span: Span },
    #[error("unterminated character literal")]
    UnterminatedChar { span: Span },
    #[error("unterminated block comment")]
    UnterminatedComment { span: Span },
    #[error("invalid number literal: {text}")]
    InvalidNumber { text: String, span: Span },
}

impl LexError {
    pub fn span(&self) -> Span {
        match self {
            LexError::Unrecognized { span, .. }
            | LexError::UnterminatedString { span }
            | LexError::UnterminatedChar { span }
            | LexError::UnterminatedComment { span }
            | LexError::InvalidNumber { span, .. } => *span,
        }
    }
}

const THREE_CHAR_PUNCT: &[(&str, TokenKind)] = &[
    ("<<=", TokenKind::ShlAssign),
    (">>=", TokenKind::ShrAssign),
    ("...", TokenKind::Ellipsis),
];

const TWO_CHAR_PUNCT: &[(&str, TokenKind)] = &[
    ("==", TokenKind::EqEq),
    ("!=", TokenKind::NotEq),
    ("<=", TokenKind::Le),
    (">=", TokenKind::Ge),
    ("&&", TokenKind::AndAnd),
    ("||", TokenKind::PipePipe),
    ("<<", TokenKind::Shl),
    (">>", TokenKind::Shr),
    ("++", TokenKind::PlusPlus),
    ("--", TokenKind::MinusMinus),
    ("+=", TokenKind::PlusAssign),
    ("-=", TokenKind::MinusAssign),
    ("*=", TokenKind::StarAssign),
    ("/=", TokenKind::SlashAssign),
    ("%=", TokenKind::PercentAssign),
    ("&=", TokenKind::AmpAssign),
    ("|=", TokenKind::PipeAssign),
    ("^=", TokenKind::CaretAssign),
    ("->", TokenKind::Arrow),
];

fn one_char_punct(b: u8) -> Option<TokenKind> {
    Some(match b {
        b'(' => TokenKind::LParen,
        b')' => TokenKind::RParen,
        b'{' => TokenKind::LBrace,
        b'}' => TokenKind::RBrace,
        b'[' => TokenKind::LBracket,
        b']' => TokenKind::RBracket,
        b';' => TokenKind::Semicolon,
        b',' => TokenKind::Comma,
        b'.' => TokenKind::Dot,
        b':' => TokenKind::Colon,
        b'?' => TokenKind::Question,
        b'~' => TokenKind::Tilde,
        b'!' => TokenKind::Bang,
        b'=' => TokenKind::Assign,
        b'+' => TokenKind::Plus,
        b'-' => TokenKind::Minus,
        b'*' => TokenKind::Star,
        b'/' => TokenKind::Slash,
        b'%' => TokenKind::Percent,
        b'&' => TokenKind::Amp,
        b'|' => TokenKind::Pipe,
        b'^' => TokenKind::Caret,
        b'<' => TokenKind::Lt,
        b'>' => TokenKind::Gt,
        _ => return None,
    })
}

/// The hand-written lexer.
pub struct Lexer<'src> {
    src: &'src str,
    bytes: &'src [u8],
    pos: usize,
    source: SourceId,
    interner: &'src Interner,
    done: bool,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src str, source: SourceId, interner: &'src Interner) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            source,
            interner,
            done: false,
        }
    }

    fn peek(&self) -> u8 {
        self.bytes.get(self.pos).copied().unwrap_or(0)
    }

    fn peek_at(&self, offset: usize) -> u8 {
        self.bytes.get(self.pos + offset).copied().unwrap_or(0)
    }

    fn span_from(&self, start: usize) -> Span {
        Span::new(self.source, start, self.pos)
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b'/' if self.peek_at(1) == b'/' => {
                    while self.pos < self.bytes.len() && self.peek() != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if self.peek_at(1) == b'*' => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        if self.pos >= self.bytes.len() {
                            return Err(LexError::UnterminatedComment {
                                span: Span::new(self.source, start, self.pos),
                            });
                        }
                        if self.peek() == b'*' && self.peek_at(1) == b'/' {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_trivia()?;
        let start = self.pos;

        if self.pos >= self.bytes.len() {
            return Ok(Token::new(TokenKind::Eof, Span::point(self.source, start)));
        }

        let b = self.peek();

        if b.is_ascii_digit() || (b == b'.' && self.peek_at(1).is_ascii_digit()) {
            return self.number(start);
        }
        if b == b'"' {
            return self.string(start);
        }
        if b == b'\'' {
            return self.char_lit(start);
        }
        if b == b'_' || b.is_ascii_alphabetic() {
            return Ok(self.ident_or_keyword(start));
        }

        for (text, kind) in THREE_CHAR_PUNCT {
            if self.src[self.pos..].starts_with(text) {
                self.pos += 3;
                return Ok(Token::new(kind.clone(), self.span_from(start)));
            }
        }
        for (text, kind) in TWO_CHAR_PUNCT {
            if self.src[self.pos..].starts_with(text) {
                self.pos += 2;
                return Ok(Token::new(kind.clone(), self.span_from(start)));
            }
        }
        if let Some(kind) = one_char_punct(b) {
            self.pos += 1;
            return Ok(Token::new(kind, self.span_from(start)));
        }

        let ch = self.src[self.pos..].chars().next().unwrap_or('\0');
        Err(LexError::Unrecognized {
            ch,
            span: Span::new(self.source, start, start + ch.len_utf8()),
        })
    }

    fn ident_or_keyword(&mut self, start: usize) -> Token {
        while self.peek() == b'_' || self.peek().is_ascii_alphanumeric() {
            self.pos += 1;
        }
        let text = &self.src[start..self.pos];
        let kind = match lookup_keyword(text) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Ident(self.interner.intern(text)),
        };
        Token::new(kind, self.span_from(start))
    }

    fn number(&mut self, start: usize) -> Result<Token, LexError> {
        let (base, digits_start) = if self.peek() == b'0'
            && matches!(self.peek_at(1), b'x' | b'X')
        {
            self.pos += 2;
            (16u32, self.pos)
        } else if self.peek() == b'0' && self.peek_at(1).is_ascii_digit() {
            self.pos += 1;
            (8u32, self.pos)
        } else {
            (10u32, self.pos)
        };

        while self.peek().is_ascii_hexdigit() && (base == 16 || self.peek().is_ascii_digit()) {
            self.pos += 1;
        }

        // A decimal point or exponent makes this a floating literal.
        let is_float = base == 10
            && (self.peek() == b'.'
                || matches!(self.peek(), b'e' | b'E')
                || self.bytes.get(start) == Some(&b'.'));
        if is_float {
            self.pos = start;
            return self.float(start);
        }

        let text = &self.src[digits_start..self.pos];
        let value = u64::from_str_radix(text, base).map_err(|_| LexError::InvalidNumber {
            text: self.src[start..self.pos].to_string(),
            span: self.span_from(start),
        })?;

        // Suffix modifiers: `u` and up to two `l`s, any order or case.
        let mut unsigned = false;
        let mut long_count = 0;
        loop {
            match self.peek() {
                b'u' | b'U' => {
                    unsigned = true;
                    self.pos += 1;
                }
                b'l' | b'L' => {
                    long_count += 1;
                    self.pos += 1;
                }
                _ => break,
            }
        }

        let mut kind = match long_count {
            0 => FixnumKind::Int,
            1 => FixnumKind::Long,
            _ => FixnumKind::LongLong,
        };
        // Widen an unsuffixed literal that does not fit `int`. Hex and
        // octal literals may land in the unsigned half of the range.
        if kind == FixnumKind::Int {
            let fits_int = if unsigned {
                value <= u32::MAX as u64
            } else if base == 10 {
                value <= i32::MAX as u64
            } else {
                value <= u32::MAX as u64
            };
            if !fits_int {
                kind = FixnumKind::Long;
            }
        }
        if base != 10 && !unsigned && kind == FixnumKind::Int && value > i32::MAX as u64 {
            unsigned = true;
        }

        Ok(Token::new(
            TokenKind::IntLit {
                value: value as i64,
                kind,
                unsigned,
            },
            self.span_from(start),
        ))
    }

    fn float(&mut self, start: usize) -> Result<Token, LexError> {
        while self.peek().is_ascii_digit() {
            self.pos += 1;
        }
        if self.peek() == b'.' {
            self.pos += 1;
            while self.peek().is_ascii_digit() {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), b'e' | b'E') {
            self.pos += 1;
            if matches!(self.peek(), b'+' | b'-') {
                self.pos += 1;
            }
            while self.peek().is_ascii_digit() {
                self.pos += 1;
            }
        }
        let text = &self.src[start..self.pos];
        let value: f64 = text.parse().map_err(|_| LexError::InvalidNumber {
            text: text.to_string(),
            span: self.span_from(start),
        })?;

        let single = matches!(self.peek(), b'f' | b'F');
        if matches!(self.peek(), b'f' | b'F' | b'l' | b'L') {
            self.pos += 1;
        }

        Ok(Token::new(
            TokenKind::FloatLit { value, single },
            self.span_from(start),
        ))
    }

    fn string(&mut self, start: usize) -> Result<Token, LexError> {
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                0 | b'\n' => {
                    return Err(LexError::UnterminatedString {
                        span: self.span_from(start),
                    })
                }
                b'"' => {
                    self.pos += 1;
                    break;
                }
                b'\\' => {
                    self.pos += 1;
                    let code = self.escape(start)?;
                    if let Some(ch) = char::from_u32(code as u32) {
                        value.push(ch);
                    }
                }
                _ => {
                    let ch = self.src[self.pos..].chars().next().unwrap();
                    value.push(ch);
                    self.pos += ch.len_utf8();
                }
            }
        }
        Ok(Token::new(TokenKind::StrLit(value), self.span_from(start)))
    }

    fn char_lit(&mut self, start: usize) -> Result<Token, LexError> {
        self.pos += 1;
        let value = match self.peek() {
            0 | b'\n' | b'\'' => {
                return Err(LexError::UnterminatedChar {
                    span: self.span_from(start),
                })
            }
            b'\\' => {
                self.pos += 1;
                self.escape(start)?
            }
            b => {
                self.pos += 1;
                b as i64
            }
        };
        if self.peek() != b'\'' {
            return Err(LexError::UnterminatedChar {
                span: self.span_from(start),
            });
        }
        self.pos += 1;
        Ok(Token::new(TokenKind::CharLit(value), self.span_from(start)))
    }

    fn escape(&mut self, start: usize) -> Result<i64, LexError> {
        let b = self.peek();
        self.pos += 1;
        Ok(match b {
            b'n' => b'\n' as i64,
            b't' => b'\t' as i64,
            b'r' => b'\r' as i64,
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'v' => 0x0b,
            b'0'..=b'7' => {
                let mut value = (b - b'0') as i64;
                for _ in 0..2 {
                    match self.peek() {
                        d @ b'0'..=b'7' => {
                            value = value * 8 + (d - b'0') as i64;
                            self.pos += 1;
                        }
                        _ => break,
                    }
                }
                value
            }
            b'x' => {
                let mut value = 0i64;
                while self.peek().is_ascii_hexdigit() {
                    let d = self.peek();
                    let digit = match d {
                        b'0'..=b'9' => d - b'0',
                        b'a'..=b'f' => d - b'a' + 10,
                        _ => d - b'A' + 10,
                    };
                    value = value * 16 + digit as i64;
                    self.pos += 1;
                }
                value
            }
            0 => {
                return Err(LexError::UnterminatedString {
                    span: self.span_from(start),
                })
            }
            other => other as i64,
        })
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = self.next_token();
        if matches!(result, Ok(ref tok) if tok.is_eof()) {
            self.done = true;
        }
        Some(result)
    }
}

/// Lex a whole source into the retained token vector, ending with an
/// `Eof` token.
pub fn tokenize(
    src: &str,
    source: SourceId,
    interner: &Interner,
) -> Result<Vec<Token>, LexError> {
    Lexer::new(src, source, interner).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interner::Interner;
    use pretty_assertions::assert_eq;

    fn lex(src: &str) -> Vec<Token> {
        let interner = Interner::new();
        tokenize(src, SourceId(0), &interner).expect("lex failure")
    }

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex(src).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_longest_match_operators() {
        assert_eq!(
            kinds("a <<= b << c < d"),
            vec![
                TokenKind::Ident(Name(0)),
                TokenKind::ShlAssign,
                TokenKind::Ident(Name(1)),
                TokenKind::Shl,
                TokenKind::Ident(Name(2)),
                TokenKind::Lt,
                TokenKind::Ident(Name(3)),
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("= == ..."),
            vec![
                TokenKind::Assign,
                TokenKind::EqEq,
                TokenKind::Ellipsis,
                TokenKind::Eof
            ]
        );
    }

    use crate::interner::Name;
    use crate::types::FixnumKind;

    #[test]
    fn test_integer_literal_bases() {
        assert_eq!(
            kinds("10 010 0x10"),
            vec![
                TokenKind::IntLit { value: 10, kind: FixnumKind::Int, unsigned: false },
                TokenKind::IntLit { value: 8, kind: FixnumKind::Int, unsigned: false },
                TokenKind::IntLit { value: 16, kind: FixnumKind::Int, unsigned: false },
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_integer_suffixes() {
        assert_eq!(
            kinds("1u 2l 3ll 4ul"),
            vec![
                TokenKind::IntLit { value: 1, kind: FixnumKind::Int, unsigned: true },
                TokenKind::IntLit { value: 2, kind: FixnumKind::Long, unsigned: false },
                TokenKind::IntLit { value: 3, kind: FixnumKind::LongLong, unsigned: false },
                TokenKind::IntLit { value: 4, kind: FixnumKind::Long, unsigned: true },
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_unsuffixed_literal_widens() {
        assert_eq!(
            kinds("2147483648"),
            vec![
                TokenKind::IntLit { value: 2147483648, kind: FixnumKind::Long, unsigned: false },
                TokenKind::Eof,
            ]
        );
        // Hex literals land in the unsigned half before widening.
        assert_eq!(
            kinds("0xffffffff"),
            vec![
                TokenKind::IntLit { value: 0xffffffff, kind: FixnumKind::Int, unsigned: true },
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_float_literals() {
        assert_eq!(
            kinds("1.5 2e3 0.5f"),
            vec![
                TokenKind::FloatLit { value: 1.5, single: false },
                TokenKind::FloatLit { value: 2000.0, single: false },
                TokenKind::FloatLit { value: 0.5, single: true },
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_and_char_literals() {
        assert_eq!(
            kinds(r#""hi\n" 'a' '\n' '\x41'"#),
            vec![
                TokenKind::StrLit("hi\n".to_string()),
                TokenKind::CharLit(97),
                TokenKind::CharLit(10),
                TokenKind::CharLit(65),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            kinds("a // line\n/* block\nmore */ b"),
            vec![
                TokenKind::Ident(Name(0)),
                TokenKind::Ident(Name(1)),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_keywords_resolved_after_scan() {
        use crate::syntax::token::Keyword;
        assert_eq!(
            kinds("int intx"),
            vec![
                TokenKind::Keyword(Keyword::Int),
                TokenKind::Ident(Name(0)),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_span_roundtrip_reconstructs_source() {
        let src = "int main() {\n  return 40 + 2;\n}\n";
        let tokens = lex(src);
        // Concatenating spans with the original inter-token text
        // reproduces the input exactly.
        let mut rebuilt = String::new();
        let mut prev_end = 0;
        for tok in &tokens {
            rebuilt.push_str(&src[prev_end..tok.span.start]);
            rebuilt.push_str(&src[tok.span.start..tok.span.end]);
            prev_end = tok.span.end;
        }
        rebuilt.push_str(&src[prev_end..]);
        assert_eq!(rebuilt, src);
    }

    #[test]
    fn test_unrecognized_character_is_fatal() {
        let interner = Interner::new();
        let err = tokenize("int @;", SourceId(0), &interner).unwrap_err();
        match err {
            LexError::Unrecognized { ch, span } => {
                assert_eq!(ch, '@');
                assert_eq!(span.start, 4);
            }
            other => panic!("expected Unrecognized, got {other:?}"),
        }
    }

    #[test]
    fn test_unterminated_string() {
        let interner = Interner::new();
        let err = tokenize("\"abc", SourceId(0), &interner).unwrap_err();
        assert!(matches!(err, LexError::UnterminatedString { .. }));
    }
}
