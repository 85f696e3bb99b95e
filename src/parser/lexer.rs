//! Tokenizer for the pipeline DSL.
//!
//! Produces a flat token stream with byte offsets so the parser can slice
//! verbatim SQL and condition text straight out of the source. Keywords are
//! not distinguished here; the parser matches identifiers case-insensitively.

use crate::errors::{Result, SqlFlowError};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Bare identifier; keywords are recognized by the parser.
    Ident(String),
    /// Numeric literal, kept as raw text.
    Number(String),
    /// Quoted string, unescaped. Single or double quotes.
    Str(String),
    /// Raw balanced `{...}` JSON object literal, braces included.
    Json(String),
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Assign,
    LParen,
    RParen,
    Comma,
    Semicolon,
    /// Any other character; lets SQL text pass through the tokenizer.
    Punct(char),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
    /// Byte offset of the first character of the token.
    pub start: usize,
    /// Byte offset one past the last character of the token.
    pub end: usize,
}

impl Token {
    pub fn is_keyword(&self, kw: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(s) if s.eq_ignore_ascii_case(kw))
    }

    pub fn is_any_keyword(&self, kws: &[&str]) -> bool {
        kws.iter().any(|kw| self.is_keyword(kw))
    }

    /// Human-readable description used in "found ..." diagnostics.
    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Ident(s) => format!("'{s}'"),
            TokenKind::Number(s) => format!("number {s}"),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Json(_) => "JSON object".to_string(),
            TokenKind::Eq => "'=='".to_string(),
            TokenKind::NotEq => "'!='".to_string(),
            TokenKind::Lt => "'<'".to_string(),
            TokenKind::LtEq => "'<='".to_string(),
            TokenKind::Gt => "'>'".to_string(),
            TokenKind::GtEq => "'>='".to_string(),
            TokenKind::Assign => "'='".to_string(),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Semicolon => "';'".to_string(),
            TokenKind::Punct(c) => format!("'{c}'"),
            TokenKind::Eof => "end of input".to_string(),
        }
    }
}

/// The trimmed text of a 1-based source line, for error snippets.
pub fn line_snippet(src: &str, line: usize) -> String {
    src.lines()
        .nth(line.saturating_sub(1))
        .unwrap_or("")
        .trim()
        .to_string()
}

pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let (start, line, column) = (self.pos, self.line, self.column);
            let Some(ch) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    line,
                    column,
                    start,
                    end: start,
                });
                return Ok(tokens);
            };

            let kind = if ch.is_ascii_alphabetic() || ch == '_' {
                self.ident()
            } else if ch.is_ascii_digit() {
                self.number()
            } else if ch == '\'' || ch == '"' {
                self.string(ch, line, column)?
            } else if ch == '{' {
                self.json(line, column)?
            } else {
                self.operator(ch)
            };

            tokens.push(Token {
                kind,
                line,
                column,
                start,
                end: self.pos,
            });
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek2(&self) -> Option<char> {
        let mut it = self.src[self.pos..].chars();
        it.next();
        it.next()
    }

    fn bump(&mut self) -> Option<char> {
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

    /// Skip whitespace and `--` line comments.
    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('-') if self.peek2() == Some('-') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return,
            }
        }
    }

    fn ident(&mut self) -> TokenKind {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        TokenKind::Ident(self.src[start..self.pos].to_string())
    }

    fn number(&mut self) -> TokenKind {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
        if self.peek() == Some('.') && matches!(self.peek2(), Some(c) if c.is_ascii_digit()) {
            self.bump();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.bump();
            }
        }
        TokenKind::Number(self.src[start..self.pos].to_string())
    }

    fn string(&mut self, quote: char, line: usize, column: usize) -> Result<TokenKind> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(SqlFlowError::Parse {
                        line,
                        column,
                        expected: format!("closing {quote} for string literal"),
                        found: "end of input".to_string(),
                        snippet: line_snippet(self.src, line),
                    })
                }
                Some(c) if c == quote => return Ok(TokenKind::Str(out)),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('"') => out.push('"'),
                    Some('\'') => out.push('\''),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => {
                        return Err(SqlFlowError::Parse {
                            line,
                            column,
                            expected: format!("closing {quote} for string literal"),
                            found: "end of input".to_string(),
                            snippet: line_snippet(self.src, line),
                        })
                    }
                },
                Some(c) => out.push(c),
            }
        }
    }

    /// Capture a balanced `{...}` literal verbatim, string-aware.
    fn json(&mut self, line: usize, column: usize) -> Result<TokenKind> {
        let start = self.pos;
        let mut depth = 0usize;
        loop {
            let Some(c) = self.bump() else {
                return Err(SqlFlowError::Parse {
                    line,
                    column,
                    expected: "closing '}' for JSON object literal".to_string(),
                    found: "end of input".to_string(),
                    snippet: line_snippet(self.src, line),
                });
            };
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(TokenKind::Json(self.src[start..self.pos].to_string()));
                    }
                }
                '"' | '\'' => {
                    let quote = c;
                    loop {
                        match self.bump() {
                            None => {
                                return Err(SqlFlowError::Parse {
                                    line,
                                    column,
                                    expected: format!("closing {quote} inside JSON object"),
                                    found: "end of input".to_string(),
                                    snippet: line_snippet(self.src, line),
                                })
                            }
                            Some('\\') => {
                                self.bump();
                            }
                            Some(c) if c == quote => break,
                            Some(_) => {}
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn operator(&mut self, ch: char) -> TokenKind {
        self.bump();
        match ch {
            '=' if self.peek() == Some('=') => {
                self.bump();
                TokenKind::Eq
            }
            '=' => TokenKind::Assign,
            '!' if self.peek() == Some('=') => {
                self.bump();
                TokenKind::NotEq
            }
            '<' if self.peek() == Some('=') => {
                self.bump();
                TokenKind::LtEq
            }
            '<' => TokenKind::Lt,
            '>' if self.peek() == Some('=') => {
                self.bump();
                TokenKind::GtEq
            }
            '>' => TokenKind::Gt,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            other => TokenKind::Punct(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_keywords_and_operators() {
        let toks = kinds("SOURCE orders TYPE CSV;");
        assert_eq!(
            toks,
            vec![
                TokenKind::Ident("SOURCE".into()),
                TokenKind::Ident("orders".into()),
                TokenKind::Ident("TYPE".into()),
                TokenKind::Ident("CSV".into()),
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let toks = kinds(r"SET msg = 'a\nb\t\'c\'';");
        assert!(toks.contains(&TokenKind::Str("a\nb\t'c'".into())));
    }

    #[test]
    fn test_json_literal_with_nested_braces_and_strings() {
        let toks = kinds(r#"PARAMS {"a": {"b": "x } y"}, "n": 1}"#);
        assert_eq!(
            toks[1],
            TokenKind::Json(r#"{"a": {"b": "x } y"}, "n": 1}"#.into())
        );
    }

    #[test]
    fn test_line_comment_skipped() {
        let toks = kinds("SET a = '1'; -- trailing ; comment\nSET b = '2';");
        let idents: Vec<_> = toks
            .iter()
            .filter_map(|k| match k {
                TokenKind::Ident(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(idents, vec!["SET", "a", "SET", "b"]);
    }

    #[test]
    fn test_unterminated_string_is_specific() {
        let err = Lexer::new("SET a = 'oops").tokenize().unwrap_err();
        assert!(err.to_string().contains("closing ' for string literal"));
    }

    #[test]
    fn test_unbalanced_json_is_specific() {
        let err = Lexer::new(r#"PARAMS {"a": 1"#).tokenize().unwrap_err();
        assert!(err.to_string().contains("closing '}' for JSON object"));
    }

    #[test]
    fn test_line_and_column_tracking() {
        let toks = Lexer::new("SET a = '1';\n  SET b = '2';").tokenize().unwrap();
        let second_set = toks.iter().find(|t| t.line == 2).unwrap();
        assert_eq!(second_set.column, 3);
    }
}
