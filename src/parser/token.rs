use std::fmt;

/// DSL keywords. Keywords are matched case-insensitively by the lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Source,
    Type,
    Params,
    Load,
    From,
    Into,
    Mode,
    Replace,
    Append,
    Upsert,
    Incremental,
    By,
    Key,
    Lookback,
    Create,
    Table,
    As,
    Export,
    To,
    Options,
    Set,
    Include,
    If,
    Then,
    Else,
    End,
    And,
    Or,
}

impl Keyword {
    /// Look up an identifier as a keyword, case-insensitively.
    pub fn from_ident(ident: &str) -> Option<Keyword> {
        let kw = match ident.to_ascii_uppercase().as_str() {
            "SOURCE" => Keyword::Source,
            "TYPE" => Keyword::Type,
            "PARAMS" => Keyword::Params,
            "LOAD" => Keyword::Load,
            "FROM" => Keyword::From,
            "INTO" => Keyword::Into,
            "MODE" => Keyword::Mode,
            "REPLACE" => Keyword::Replace,
            "APPEND" => Keyword::Append,
            "UPSERT" => Keyword::Upsert,
            "INCREMENTAL" => Keyword::Incremental,
            "BY" => Keyword::By,
            "KEY" => Keyword::Key,
            "LOOKBACK" => Keyword::Lookback,
            "CREATE" => Keyword::Create,
            "TABLE" => Keyword::Table,
            "AS" => Keyword::As,
            "EXPORT" => Keyword::Export,
            "TO" => Keyword::To,
            "OPTIONS" => Keyword::Options,
            "SET" => Keyword::Set,
            "INCLUDE" => Keyword::Include,
            "IF" => Keyword::If,
            "THEN" => Keyword::Then,
            "ELSE" => Keyword::Else,
            "END" => Keyword::End,
            "AND" => Keyword::And,
            "OR" => Keyword::Or,
            _ => return None,
        };
        Some(kw)
    }
}

impl fmt::Display for Keyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = format!("{self:?}").to_ascii_uppercase();
        write!(f, "{s}")
    }
}

/// Comparison operators usable in conditional tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
        };
        write!(f, "{s}")
    }
}

/// Kinds of token the DSL lexer produces.
///
/// String tokens carry their unescaped value in [`Token::text`]. Variable-ref
/// tokens carry the interior of `${...}` (name, optionally `|default`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Keyword(Keyword),
    Ident,
    Str,
    Number,
    VarRef,
    Cmp(CmpOp),
    LeftParen,
    RightParen,
    Comma,
    Semicolon,
    Equals,
    Eof,
}

/// A single token with its source position (1-based line and column).
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn is_keyword(&self, kw: Keyword) -> bool {
        self.kind == TokenKind::Keyword(kw)
    }

    /// Split a variable-ref token's interior into `(name, default)`.
    pub fn var_parts(&self) -> (&str, Option<&str>) {
        debug_assert_eq!(self.kind, TokenKind::VarRef);
        match self.text.split_once('|') {
            Some((name, default)) => (name, Some(default)),
            None => (self.text.as_str(), None),
        }
    }

    /// Human-readable description for error messages.
    pub fn describe(&self) -> String {
        match self.kind {
            TokenKind::Eof => "end of input".to_string(),
            TokenKind::Str => format!("string {:?}", self.text),
            TokenKind::Keyword(kw) => format!("keyword {kw}"),
            _ => format!("{:?}", self.text),
        }
    }
}
