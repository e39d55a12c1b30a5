use crate::errors::{Result, SqlFlowError};
use crate::parser::token::{CmpOp, Keyword, Token, TokenKind};

/// Hand-written lexer for the `.sf` pipeline DSL.
///
/// The DSL cannot be fully lexed in advance: JSON parameter blocks and the
/// embedded SQL after `AS` are raw spans whose interior must not be
/// tokenized. The parser therefore drives the lexer, calling
/// [`Lexer::next_token`] for DSL tokens and [`Lexer::take_json_block`] /
/// [`Lexer::take_sql_span`] where the grammar switches to raw capture.
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
    column: usize,
}

/// Where a raw SQL span ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlStop {
    /// The statement-terminating `;` (not consumed).
    Semicolon,
    /// A top-level `TO` keyword or the terminating `;`, whichever comes
    /// first (neither consumed). Used for `EXPORT <sql> TO ...`.
    ToOrSemicolon,
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

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.src[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, line: usize, column: usize, message: impl Into<String>) -> SqlFlowError {
        SqlFlowError::Syntax {
            line,
            column,
            message: message.into(),
        }
    }

    /// Skip whitespace and `-- comment` lines.
    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('-') if self.peek_second() == Some('-') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }
    }

    /// Lex the next DSL token.
    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_trivia();
        let line = self.line;
        let column = self.column;

        let token = |kind, text: &str| Token {
            kind,
            text: text.to_string(),
            line,
            column,
        };

        let Some(c) = self.peek() else {
            return Ok(token(TokenKind::Eof, ""));
        };

        match c {
            ';' => {
                self.bump();
                Ok(token(TokenKind::Semicolon, ";"))
            }
            ',' => {
                self.bump();
                Ok(token(TokenKind::Comma, ","))
            }
            '(' => {
                self.bump();
                Ok(token(TokenKind::LeftParen, "("))
            }
            ')' => {
                self.bump();
                Ok(token(TokenKind::RightParen, ")"))
            }
            '=' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    Ok(token(TokenKind::Cmp(CmpOp::Eq), "=="))
                } else {
                    Ok(token(TokenKind::Equals, "="))
                }
            }
            '!' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    Ok(token(TokenKind::Cmp(CmpOp::Ne), "!="))
                } else {
                    Err(self.error(line, column, "expected '=' after '!'"))
                }
            }
            '>' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    Ok(token(TokenKind::Cmp(CmpOp::Ge), ">="))
                } else {
                    Ok(token(TokenKind::Cmp(CmpOp::Gt), ">"))
                }
            }
            '<' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    Ok(token(TokenKind::Cmp(CmpOp::Le), "<="))
                } else {
                    Ok(token(TokenKind::Cmp(CmpOp::Lt), "<"))
                }
            }
            '"' => self.lex_string(line, column),
            '$' if self.peek_second() == Some('{') => self.lex_var_ref(line, column),
            '-' if self.peek_second().is_some_and(|c| c.is_ascii_digit()) => {
                self.lex_number(line, column)
            }
            c if c.is_ascii_digit() => self.lex_number(line, column),
            c if c.is_ascii_alphabetic() || c == '_' => {
                let ident = self.lex_ident();
                let kind = match Keyword::from_ident(&ident) {
                    Some(kw) => TokenKind::Keyword(kw),
                    None => TokenKind::Ident,
                };
                Ok(Token {
                    kind,
                    text: ident,
                    line,
                    column,
                })
            }
            other => Err(self.error(line, column, format!("unexpected character {other:?}"))),
        }
    }

    fn lex_ident(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        self.src[start..self.pos].to_string()
    }

    fn lex_number(&mut self, line: usize, column: usize) -> Result<Token> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else if c == '.' && !seen_dot && self.peek_second().is_some_and(|c| c.is_ascii_digit())
            {
                seen_dot = true;
                self.bump();
            } else {
                break;
            }
        }
        Ok(Token {
            kind: TokenKind::Number,
            text: self.src[start..self.pos].to_string(),
            line,
            column,
        })
    }

    /// Double-quoted string with standard escapes; newlines are allowed.
    fn lex_string(&mut self, line: usize, column: usize) -> Result<Token> {
        self.bump(); // opening quote
        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(line, column, "unterminated string literal")),
                Some('"') => break,
                Some('\\') => {
                    let esc_line = self.line;
                    let esc_col = self.column;
                    match self.bump() {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some('r') => value.push('\r'),
                        Some('\\') => value.push('\\'),
                        Some('"') => value.push('"'),
                        Some('0') => value.push('\0'),
                        Some(other) => {
                            return Err(self.error(
                                esc_line,
                                esc_col,
                                format!("invalid escape character {other:?}"),
                            ))
                        }
                        None => {
                            return Err(self.error(line, column, "unterminated string literal"))
                        }
                    }
                }
                Some(c) => value.push(c),
            }
        }
        Ok(Token {
            kind: TokenKind::Str,
            text: value,
            line,
            column,
        })
    }

    /// `${name}` or `${name|default}`; the token text is the interior.
    fn lex_var_ref(&mut self, line: usize, column: usize) -> Result<Token> {
        self.bump(); // $
        self.bump(); // {
        let start = self.pos;
        loop {
            match self.peek() {
                None => return Err(self.error(line, column, "unterminated variable reference")),
                Some('}') => break,
                Some(_) => {
                    self.bump();
                }
            }
        }
        let interior = self.src[start..self.pos].to_string();
        self.bump(); // }
        if interior.is_empty() {
            return Err(self.error(line, column, "empty variable reference"));
        }
        Ok(Token {
            kind: TokenKind::VarRef,
            text: interior,
            line,
            column,
        })
    }

    /// Capture a raw JSON value (object literal) for `PARAMS { ... }` /
    /// `OPTIONS { ... }`. The braces are balanced with awareness of JSON
    /// strings; the returned text includes the outer braces and is validated
    /// by the parser with serde_json.
    pub fn take_json_block(&mut self) -> Result<(String, usize, usize)> {
        self.skip_trivia();
        let line = self.line;
        let column = self.column;
        if self.peek() != Some('{') {
            return Err(self.error(line, column, "expected JSON object"));
        }
        let start = self.pos;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        loop {
            let Some(c) = self.bump() else {
                return Err(self.error(line, column, "unterminated JSON object"));
            };
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
        }
        Ok((self.src[start..self.pos].to_string(), line, column))
    }

    /// Capture a raw SQL span verbatim, preserving interior whitespace.
    ///
    /// The span ends at the statement terminator `;` at top level, or, for
    /// [`SqlStop::ToOrSemicolon`], additionally at a top-level `TO` keyword.
    /// The stopping token is left for the parser to consume. Single-quoted
    /// SQL strings, double-quoted identifiers, parentheses, and `--` comments
    /// are respected when looking for the stop position.
    pub fn take_sql_span(&mut self, stop: SqlStop) -> Result<(String, usize, usize)> {
        self.skip_trivia();
        let line = self.line;
        let column = self.column;
        let start = self.pos;
        let mut depth = 0usize;
        let mut prev_is_word = false;

        loop {
            let Some(c) = self.peek() else {
                return Err(self.error(line, column, "unterminated SQL (missing ';')"));
            };
            match c {
                '\'' | '"' => {
                    let quote = c;
                    self.bump();
                    loop {
                        match self.bump() {
                            None => {
                                return Err(self.error(
                                    line,
                                    column,
                                    "unterminated string inside SQL",
                                ))
                            }
                            Some(ch) if ch == quote => {
                                // SQL doubles quotes to escape them
                                if self.peek() == Some(quote) {
                                    self.bump();
                                } else {
                                    break;
                                }
                            }
                            Some('\\') => {
                                self.bump();
                            }
                            Some(_) => {}
                        }
                    }
                    prev_is_word = false;
                }
                '-' if self.peek_second() == Some('-') => {
                    while let Some(ch) = self.peek() {
                        if ch == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    prev_is_word = false;
                }
                '(' => {
                    depth += 1;
                    self.bump();
                    prev_is_word = false;
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    self.bump();
                    prev_is_word = false;
                }
                ';' if depth == 0 => break,
                c if (c.is_ascii_alphabetic() || c == '_') && !prev_is_word => {
                    let word_start = self.pos;
                    while let Some(ch) = self.peek() {
                        if ch.is_ascii_alphanumeric() || ch == '_' {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                    let word = &self.src[word_start..self.pos];
                    if stop == SqlStop::ToOrSemicolon
                        && depth == 0
                        && word.eq_ignore_ascii_case("TO")
                    {
                        // rewind: leave TO for the parser
                        self.pos = word_start;
                        self.column -= word.len();
                        let raw = self.src[start..self.pos].to_string();
                        return Ok((raw, line, column));
                    }
                    prev_is_word = true;
                }
                _ => {
                    self.bump();
                    prev_is_word = c.is_ascii_alphanumeric() || c == '_';
                }
            }
        }
        Ok((self.src[start..self.pos].to_string(), line, column))
    }

    /// Error recovery: discard input up to and including the next top-level
    /// `;`, skipping strings so a `;` inside a literal does not end recovery.
    /// Returns false when EOF was reached first.
    pub fn skip_to_semicolon(&mut self) -> bool {
        loop {
            match self.peek() {
                None => return false,
                Some(';') => {
                    self.bump();
                    return true;
                }
                Some('"') | Some('\'') => {
                    let quote = self.peek().expect("peeked");
                    self.bump();
                    loop {
                        match self.bump() {
                            None => return false,
                            Some('\\') => {
                                self.bump();
                            }
                            Some(c) if c == quote => break,
                            Some(_) => {}
                        }
                    }
                }
                Some('-') if self.peek_second() == Some('-') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
    }

    /// Current position, for diagnostics.
    pub fn position(&self) -> (usize, usize) {
        (self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_token().unwrap();
            let done = tok.kind == TokenKind::Eof;
            out.push(tok.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn lexes_keywords_case_insensitively() {
        let toks = kinds("load LOAD Load");
        assert_eq!(
            toks,
            vec![
                TokenKind::Keyword(Keyword::Load),
                TokenKind::Keyword(Keyword::Load),
                TokenKind::Keyword(Keyword::Load),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_strings_with_escapes_and_newlines() {
        let mut lexer = Lexer::new("\"a\\nb\n c\"");
        let tok = lexer.next_token().unwrap();
        assert_eq!(tok.kind, TokenKind::Str);
        assert_eq!(tok.text, "a\nb\n c");
    }

    #[test]
    fn rejects_unknown_escape() {
        let mut lexer = Lexer::new("\"a\\qb\"");
        assert!(lexer.next_token().is_err());
    }

    #[test]
    fn lexes_var_refs() {
        let mut lexer = Lexer::new("${env|dev}");
        let tok = lexer.next_token().unwrap();
        assert_eq!(tok.kind, TokenKind::VarRef);
        assert_eq!(tok.var_parts(), ("env", Some("dev")));
    }

    #[test]
    fn skips_comments() {
        let toks = kinds("-- a comment\nSET");
        assert_eq!(
            toks,
            vec![TokenKind::Keyword(Keyword::Set), TokenKind::Eof]
        );
    }

    #[test]
    fn tracks_line_and_column() {
        let mut lexer = Lexer::new("SET\n  x");
        let set = lexer.next_token().unwrap();
        assert_eq!((set.line, set.column), (1, 1));
        let x = lexer.next_token().unwrap();
        assert_eq!((x.line, x.column), (2, 3));
    }

    #[test]
    fn json_block_is_balanced_and_string_aware() {
        let mut lexer = Lexer::new(r#"{"a": "b } c", "d": {"e": 1}} ;"#);
        let (raw, _, _) = lexer.take_json_block().unwrap();
        assert_eq!(raw, r#"{"a": "b } c", "d": {"e": 1}}"#);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Semicolon);
    }

    #[test]
    fn sql_span_stops_at_top_level_semicolon() {
        let mut lexer = Lexer::new("SELECT ';' AS x, a.b FROM t;");
        let (raw, _, _) = lexer.take_sql_span(SqlStop::Semicolon).unwrap();
        assert_eq!(raw, "SELECT ';' AS x, a.b FROM t");
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Semicolon);
    }

    #[test]
    fn sql_span_stops_before_export_to() {
        let mut lexer = Lexer::new("SELECT total FROM orders TO \"out.csv\";");
        let (raw, _, _) = lexer.take_sql_span(SqlStop::ToOrSemicolon).unwrap();
        assert_eq!(raw.trim_end(), "SELECT total FROM orders");
        let to = lexer.next_token().unwrap();
        assert!(to.is_keyword(Keyword::To));
    }

    #[test]
    fn sql_span_ignores_to_inside_identifiers() {
        let mut lexer = Lexer::new("SELECT total, stock FROM inventory;");
        let (raw, _, _) = lexer.take_sql_span(SqlStop::ToOrSemicolon).unwrap();
        assert_eq!(raw, "SELECT total, stock FROM inventory");
    }
}
