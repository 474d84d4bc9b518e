use crate::Error;
use std::str::FromStr;

/// Reserved words
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::EnumString, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Keyword {
    And,
    Break,
    Do,
    Else,
    Elseif,
    End,
    False,
    For,
    Function,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Name(String),
    Number(f64),
    Str(String),
    Keyword(Keyword),

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Hash,
    /// `==`
    Eq,
    /// `~=`
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// `=`
    Assign,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Colon,
    Comma,
    Dot,
    DotDot,
    DotDotDot,

    Eof,
}

/// A token and the (1-based) line it starts on
#[derive(Clone, Debug, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn error<T>(&self, message: impl Into<String>) -> Result<T, Error> {
        Err(Error::Parse {
            line: self.line,
            message: message.into(),
        })
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    /// Checks for a long bracket (`[[` or `[==[`), returning its level
    fn long_bracket(&self) -> Option<usize> {
        if self.peek() != Some(b'[') {
            return None;
        }
        let mut level = 0;
        while self.peek_at(1 + level) == Some(b'=') {
            level += 1;
        }
        (self.peek_at(1 + level) == Some(b'[')).then_some(level)
    }

    /// Skips a long bracket body, having already checked its opening
    fn skip_long(&mut self, level: usize) -> Result<(), Error> {
        let start = self.line;
        self.pos += level + 2;
        loop {
            match self.bump() {
                None => {
                    return Err(Error::Parse {
                        line: start,
                        message: "unfinished long comment".to_owned(),
                    });
                }
                Some(b']') => {
                    let eqs = (0..level)
                        .take_while(|&i| self.peek_at(i) == Some(b'='))
                        .count();
                    if eqs == level && self.peek_at(level) == Some(b']') {
                        self.pos += level + 1;
                        return Ok(());
                    }
                }
                Some(_) => (),
            }
        }
    }

    fn skip_trivia(&mut self) -> Result<(), Error> {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    self.pos += 2;
                    if let Some(level) = self.long_bracket() {
                        self.skip_long(level)?;
                    } else {
                        while !matches!(self.peek(), None | Some(b'\n')) {
                            self.bump();
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn number(&mut self) -> Result<Token, Error> {
        let start = self.pos;
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X')) {
            self.pos += 2;
            let digits = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            let text = std::str::from_utf8(&self.src[digits..self.pos])
                .unwrap_or_default();
            return match u64::from_str_radix(text, 16) {
                Ok(v) => Ok(Token::Number(v as f64)),
                Err(_) => self.error("malformed number"),
            };
        }

        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == b'.') {
            self.pos += 1;
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if self.peek().is_some_and(|c| c.is_ascii_alphabetic() || c == b'_') {
            return self.error("malformed number");
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .unwrap_or_default();
        match f64::from_str(text) {
            Ok(v) => Ok(Token::Number(v)),
            Err(_) => self.error(format!("malformed number near '{text}'")),
        }
    }

    fn string(&mut self, quote: u8) -> Result<Token, Error> {
        self.pos += 1;
        let mut out = vec![];
        loop {
            let Some(c) = self.peek() else {
                return self.error("unfinished string");
            };
            match c {
                b'\n' => return self.error("unfinished string"),
                c if c == quote => {
                    self.pos += 1;
                    break;
                }
                b'\\' => {
                    self.pos += 1;
                    let Some(e) = self.bump() else {
                        return self.error("unfinished string");
                    };
                    match e {
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'a' => out.push(0x07),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'v' => out.push(0x0b),
                        b'\\' | b'"' | b'\'' | b'\n' => out.push(e),
                        b'x' => {
                            let hex = self
                                .src
                                .get(self.pos..self.pos + 2)
                                .and_then(|h| std::str::from_utf8(h).ok())
                                .and_then(|h| u8::from_str_radix(h, 16).ok());
                            let Some(v) = hex else {
                                return self.error("hexadecimal digit expected");
                            };
                            self.pos += 2;
                            out.push(v);
                        }
                        b'0'..=b'9' => {
                            let mut v = (e - b'0') as u32;
                            for _ in 0..2 {
                                match self.peek() {
                                    Some(d @ b'0'..=b'9') => {
                                        v = v * 10 + (d - b'0') as u32;
                                        self.pos += 1;
                                    }
                                    _ => break,
                                }
                            }
                            let Ok(v) = u8::try_from(v) else {
                                return self.error("decimal escape too large");
                            };
                            out.push(v);
                        }
                        _ => return self.error("invalid escape sequence"),
                    }
                }
                _ => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        match String::from_utf8(out) {
            Ok(s) => Ok(Token::Str(s)),
            Err(_) => self.error("string is not valid UTF-8"),
        }
    }

    fn next(&mut self) -> Result<Token, Error> {
        self.skip_trivia()?;
        let Some(c) = self.peek() else {
            return Ok(Token::Eof);
        };

        if c.is_ascii_alphabetic() || c == b'_' {
            let start = self.pos;
            while self
                .peek()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
            {
                self.pos += 1;
            }
            let word = std::str::from_utf8(&self.src[start..self.pos])
                .unwrap_or_default();
            return Ok(match Keyword::from_str(word) {
                Ok(k) => Token::Keyword(k),
                Err(_) => Token::Name(word.to_owned()),
            });
        }
        if c.is_ascii_digit()
            || (c == b'.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()))
        {
            return self.number();
        }
        if c == b'"' || c == b'\'' {
            return self.string(c);
        }

        let two = [c, self.peek_at(1).unwrap_or(0)];
        let (token, len) = match &two {
            b"==" => (Token::Eq, 2),
            b"~=" => (Token::Ne, 2),
            b"<=" => (Token::Le, 2),
            b">=" => (Token::Ge, 2),
            b".." if self.peek_at(2) == Some(b'.') => (Token::DotDotDot, 3),
            b".." => (Token::DotDot, 2),
            _ => (
                match c {
                    b'+' => Token::Plus,
                    b'-' => Token::Minus,
                    b'*' => Token::Star,
                    b'/' => Token::Slash,
                    b'%' => Token::Percent,
                    b'^' => Token::Caret,
                    b'#' => Token::Hash,
                    b'<' => Token::Lt,
                    b'>' => Token::Gt,
                    b'=' => Token::Assign,
                    b'(' => Token::LParen,
                    b')' => Token::RParen,
                    b'{' => Token::LBrace,
                    b'}' => Token::RBrace,
                    b'[' => Token::LBracket,
                    b']' => Token::RBracket,
                    b';' => Token::Semi,
                    b':' => Token::Colon,
                    b',' => Token::Comma,
                    b'.' => Token::Dot,
                    _ => {
                        return self.error(format!(
                            "unexpected symbol '{}'",
                            c.escape_ascii()
                        ));
                    }
                },
                1,
            ),
        };
        self.pos += len;
        Ok(token)
    }
}

/// Splits source text into tokens, ending with [`Token::Eof`]
pub fn tokenize(src: &str) -> Result<Vec<Spanned>, Error> {
    let mut lexer = Lexer {
        src: src.as_bytes(),
        pos: 0,
        line: 1,
    };
    let mut out = vec![];
    loop {
        lexer.skip_trivia()?;
        let line = lexer.line;
        let token = lexer.next()?;
        let done = token == Token::Eof;
        out.push(Spanned { token, line });
        if done {
            return Ok(out);
        }
    }
}
