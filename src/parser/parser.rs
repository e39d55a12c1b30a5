use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::errors::{Result, SqlFlowError};
use crate::parser::ast::{
    Comparison, Condition, ConditionalBlock, Diagnostic, ExportQuery, ExportStep, LoadMode,
    LoadStep, Operand, Pipeline, SetStep, SourceDefStep, SqlBlockStep, Step, TransformMode,
};
use crate::parser::lexer::{Lexer, SqlStop};
use crate::parser::token::{Keyword, Token, TokenKind};
use crate::vars::VarContext;

/// Parse a script from text. `source` names the file for diagnostics,
/// include resolution, and the pipeline name.
///
/// Always returns a pipeline; syntax errors are accumulated as error
/// diagnostics with per-statement recovery at `;`. Callers treat any error
/// diagnostic as fatal before planning.
pub fn parse_script(text: &str, source: Option<&Path>, vars: &mut VarContext) -> Pipeline {
    let mut include_stack = Vec::new();
    if let Some(path) = source {
        if let Ok(canonical) = path.canonicalize() {
            include_stack.push(canonical);
        }
    }
    let mut parser = Parser {
        lexer: Lexer::new(text),
        vars,
        diagnostics: Vec::new(),
        peeked: None,
        base_dir: source.and_then(|p| p.parent().map(PathBuf::from)),
        include_stack,
        includes: Vec::new(),
    };

    let mut steps = Vec::new();
    parser.parse_statements(&mut steps, &[]);

    let name = source
        .and_then(|p| p.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "inline".to_string());

    Pipeline {
        name,
        source_file: source.map(PathBuf::from),
        steps,
        variables: parser.vars.set_vars().clone(),
        diagnostics: parser.diagnostics,
        includes: parser.includes,
    }
}

/// Parse a script file from disk.
pub fn parse_file(path: &Path, vars: &mut VarContext) -> Result<Pipeline> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_script(&text, Some(path), vars))
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    vars: &'a mut VarContext,
    diagnostics: Vec<Diagnostic>,
    peeked: Option<Token>,
    base_dir: Option<PathBuf>,
    include_stack: Vec<PathBuf>,
    includes: Vec<PathBuf>,
}

impl<'a> Parser<'a> {
    /// Pull the next token, applying parse-time variable substitution to
    /// string literals.
    fn next(&mut self) -> Result<Token> {
        if let Some(tok) = self.peeked.take() {
            return Ok(tok);
        }
        let mut tok = self.lexer.next_token()?;
        if tok.kind == TokenKind::Str {
            let (text, unresolved) = self.vars.substitute_with_unresolved(&tok.text);
            for name in unresolved {
                self.diagnostics.push(
                    Diagnostic::warning("UNRESOLVED_VAR", format!("variable ${{{name}}} is not defined"))
                        .at(tok.line, tok.column),
                );
            }
            tok.text = text;
        }
        Ok(tok)
    }

    fn peek(&mut self) -> Result<&Token> {
        if self.peeked.is_none() {
            let tok = self.next()?;
            self.peeked = Some(tok);
        }
        Ok(self.peeked.as_ref().expect("just peeked"))
    }

    fn syntax_error(&self, tok: &Token, message: impl Into<String>) -> SqlFlowError {
        SqlFlowError::Syntax {
            line: tok.line,
            column: tok.column,
            message: message.into(),
        }
    }

    fn expect_keyword(&mut self, kw: Keyword) -> Result<Token> {
        let tok = self.next()?;
        if tok.is_keyword(kw) {
            Ok(tok)
        } else {
            Err(self.syntax_error(&tok, format!("expected {kw}, found {}", tok.describe())))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<Token> {
        let tok = self.next()?;
        if tok.kind == TokenKind::Ident {
            Ok(tok)
        } else {
            Err(self.syntax_error(&tok, format!("expected {what}, found {}", tok.describe())))
        }
    }

    fn expect_string(&mut self, what: &str) -> Result<Token> {
        let tok = self.next()?;
        if tok.kind == TokenKind::Str {
            Ok(tok)
        } else {
            Err(self.syntax_error(&tok, format!("expected {what}, found {}", tok.describe())))
        }
    }

    fn expect_semicolon(&mut self) -> Result<()> {
        let tok = self.next()?;
        if tok.kind == TokenKind::Semicolon {
            Ok(())
        } else {
            Err(self.syntax_error(&tok, format!("expected ';', found {}", tok.describe())))
        }
    }

    /// Parse statements until EOF or one of `terminators` is peeked.
    /// Errors recover at the next `;` so later statements still surface
    /// their own diagnostics.
    fn parse_statements(&mut self, out: &mut Vec<Step>, terminators: &[Keyword]) {
        loop {
            let peeked = match self.peek() {
                Ok(tok) => tok,
                Err(err) => {
                    self.record_error(err);
                    self.peeked = None;
                    if !self.lexer.skip_to_semicolon() {
                        return;
                    }
                    continue;
                }
            };
            if peeked.kind == TokenKind::Eof {
                return;
            }
            if let TokenKind::Keyword(kw) = peeked.kind {
                if terminators.contains(&kw) {
                    return;
                }
            }
            if let Err(err) = self.parse_statement(out) {
                self.record_error(err);
                self.peeked = None;
                if !self.lexer.skip_to_semicolon() {
                    return;
                }
            }
        }
    }

    fn record_error(&mut self, err: SqlFlowError) {
        let diag = match err {
            SqlFlowError::Syntax {
                line,
                column,
                message,
            } => Diagnostic::error("SYNTAX", message).at(line, column),
            other => Diagnostic::error("SYNTAX", other.to_string()),
        };
        self.diagnostics.push(diag);
    }

    fn parse_statement(&mut self, out: &mut Vec<Step>) -> Result<()> {
        let tok = self.next()?;
        match tok.kind {
            TokenKind::Keyword(Keyword::Source) => {
                let step = self.parse_source(tok.line)?;
                out.push(Step::Source(step));
            }
            TokenKind::Keyword(Keyword::Load) => {
                let step = self.parse_load(tok.line)?;
                out.push(Step::Load(step));
            }
            TokenKind::Keyword(Keyword::Create) => {
                let step = self.parse_create(tok.line)?;
                out.push(Step::Transform(step));
            }
            TokenKind::Keyword(Keyword::Export) => {
                let step = self.parse_export(tok.line)?;
                out.push(Step::Export(step));
            }
            TokenKind::Keyword(Keyword::Set) => {
                let step = self.parse_set(tok.line)?;
                out.push(Step::Set(step));
            }
            TokenKind::Keyword(Keyword::Include) => {
                self.parse_include(out, tok.line)?;
            }
            TokenKind::Keyword(Keyword::If) => {
                let step = self.parse_conditional(tok.line)?;
                out.push(Step::Conditional(step));
            }
            _ => {
                return Err(self.syntax_error(
                    &tok,
                    format!("expected a statement, found {}", tok.describe()),
                ));
            }
        }
        Ok(())
    }

    /// `SOURCE name TYPE kind PARAMS { ... };`
    fn parse_source(&mut self, line: usize) -> Result<SourceDefStep> {
        let name = self.expect_ident("source name")?;
        self.expect_keyword(Keyword::Type)?;
        let connector_type = self.expect_ident("connector type")?;
        self.expect_keyword(Keyword::Params)?;
        let params = self.parse_json_block("PARAMS")?;
        self.expect_semicolon()?;

        let incremental_cursor = params
            .get("cursor_field")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(SourceDefStep {
            name: name.text,
            connector_type: connector_type.text.to_ascii_lowercase(),
            params,
            incremental_cursor,
            line,
        })
    }

    /// Raw JSON block, validated with serde_json, with `${...}` substitution
    /// applied to every string value.
    fn parse_json_block(&mut self, what: &str) -> Result<Value> {
        debug_assert!(self.peeked.is_none(), "raw capture with pending lookahead");
        let (raw, line, column) = self.lexer.take_json_block()?;
        let mut value: Value = serde_json::from_str(&raw).map_err(|e| SqlFlowError::Syntax {
            line,
            column,
            message: format!("invalid JSON in {what}: {e}"),
        })?;
        self.substitute_json(&mut value, line, column);
        Ok(value)
    }

    fn substitute_json(&mut self, value: &mut Value, line: usize, column: usize) {
        match value {
            Value::String(s) => {
                let (text, unresolved) = self.vars.substitute_with_unresolved(s);
                for name in unresolved {
                    self.diagnostics.push(
                        Diagnostic::warning(
                            "UNRESOLVED_VAR",
                            format!("variable ${{{name}}} is not defined"),
                        )
                        .at(line, column),
                    );
                }
                *s = text;
            }
            Value::Array(items) => {
                for item in items {
                    self.substitute_json(item, line, column);
                }
            }
            Value::Object(map) => {
                for (_, item) in map.iter_mut() {
                    self.substitute_json(item, line, column);
                }
            }
            _ => {}
        }
    }

    /// `LOAD target FROM source [MODE REPLACE|APPEND|UPSERT KEY (...)];`
    fn parse_load(&mut self, line: usize) -> Result<LoadStep> {
        let target = self.expect_ident("target table")?;
        self.expect_keyword(Keyword::From)?;
        let source = self.expect_ident("source name")?;

        let mode = if self.peek()?.is_keyword(Keyword::Mode) {
            self.next()?;
            let tok = self.next()?;
            match tok.kind {
                TokenKind::Keyword(Keyword::Replace) => LoadMode::Replace,
                TokenKind::Keyword(Keyword::Append) => LoadMode::Append,
                TokenKind::Keyword(Keyword::Upsert) => {
                    self.expect_keyword(Keyword::Key)?;
                    LoadMode::Upsert {
                        keys: self.parse_key_list()?,
                    }
                }
                _ => {
                    return Err(self.syntax_error(
                        &tok,
                        format!("expected REPLACE, APPEND or UPSERT, found {}", tok.describe()),
                    ))
                }
            }
        } else {
            LoadMode::Replace
        };
        self.expect_semicolon()?;

        Ok(LoadStep {
            target_table: target.text,
            source_name: source.text,
            mode,
            line,
        })
    }

    /// `id` or `( id, id, ... )`
    fn parse_key_list(&mut self) -> Result<Vec<String>> {
        if self.peek()?.kind == TokenKind::LeftParen {
            self.next()?;
            let mut keys = vec![self.expect_ident("key column")?.text];
            loop {
                let tok = self.next()?;
                match tok.kind {
                    TokenKind::Comma => keys.push(self.expect_ident("key column")?.text),
                    TokenKind::RightParen => break,
                    _ => {
                        return Err(self.syntax_error(
                            &tok,
                            format!("expected ',' or ')', found {}", tok.describe()),
                        ))
                    }
                }
            }
            Ok(keys)
        } else {
            Ok(vec![self.expect_ident("key column")?.text])
        }
    }

    /// `CREATE [OR REPLACE] TABLE name [MODE ...] AS <sql>;`
    fn parse_create(&mut self, line: usize) -> Result<SqlBlockStep> {
        if self.peek()?.is_keyword(Keyword::Or) {
            self.next()?;
            self.expect_keyword(Keyword::Replace)?;
        }
        self.expect_keyword(Keyword::Table)?;
        let table = self.expect_ident("table name")?;

        let mode = if self.peek()?.is_keyword(Keyword::Mode) {
            self.next()?;
            self.parse_transform_mode()?
        } else {
            TransformMode::Replace
        };

        self.expect_keyword(Keyword::As)?;
        debug_assert!(self.peeked.is_none(), "raw capture with pending lookahead");
        let (sql, sql_line, sql_column) = self.lexer.take_sql_span(SqlStop::Semicolon)?;
        self.expect_semicolon()?;

        let sql = sql.trim().to_string();
        if sql.is_empty() {
            return Err(SqlFlowError::Syntax {
                line: sql_line,
                column: sql_column,
                message: "CREATE TABLE AS requires a query".to_string(),
            });
        }

        Ok(SqlBlockStep {
            table_name: table.text,
            sql,
            mode,
            line,
        })
    }

    fn parse_transform_mode(&mut self) -> Result<TransformMode> {
        let tok = self.next()?;
        match tok.kind {
            TokenKind::Keyword(Keyword::Replace) => Ok(TransformMode::Replace),
            TokenKind::Keyword(Keyword::Append) => Ok(TransformMode::Append),
            TokenKind::Keyword(Keyword::Upsert) => {
                self.expect_keyword(Keyword::Key)?;
                Ok(TransformMode::Upsert {
                    keys: self.parse_key_list()?,
                })
            }
            TokenKind::Keyword(Keyword::Incremental) => {
                self.expect_keyword(Keyword::By)?;
                let column = self.expect_ident("cursor column")?;
                let lookback = if self.peek()?.is_keyword(Keyword::Lookback) {
                    self.next()?;
                    Some(self.expect_string("lookback duration")?.text)
                } else {
                    None
                };
                Ok(TransformMode::Incremental {
                    time_column: column.text,
                    lookback,
                })
            }
            _ => Err(self.syntax_error(
                &tok,
                format!(
                    "expected REPLACE, APPEND, UPSERT or INCREMENTAL, found {}",
                    tok.describe()
                ),
            )),
        }
    }

    /// `EXPORT (<sql>|table) TO "uri" TYPE fmt [OPTIONS { ... }];`
    fn parse_export(&mut self, line: usize) -> Result<ExportStep> {
        debug_assert!(self.peeked.is_none(), "raw capture with pending lookahead");
        let (raw, sql_line, sql_column) = self.lexer.take_sql_span(SqlStop::ToOrSemicolon)?;
        let raw = raw.trim().to_string();
        if raw.is_empty() {
            return Err(SqlFlowError::Syntax {
                line: sql_line,
                column: sql_column,
                message: "EXPORT requires a query or table name".to_string(),
            });
        }
        let query = if raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            ExportQuery::Table(raw)
        } else {
            ExportQuery::Sql(raw)
        };

        self.expect_keyword(Keyword::To)?;
        let destination = self.expect_string("destination URI")?;
        self.expect_keyword(Keyword::Type)?;
        let format = self.expect_ident("export format")?;
        let options = if self.peek()?.is_keyword(Keyword::Options) {
            self.next()?;
            self.parse_json_block("OPTIONS")?
        } else {
            Value::Object(Default::default())
        };
        self.expect_semicolon()?;

        Ok(ExportStep {
            query,
            destination: destination.text,
            format: format.text.to_ascii_lowercase(),
            options,
            line,
        })
    }

    /// `SET name = value;` applied eagerly to the variable context.
    fn parse_set(&mut self, line: usize) -> Result<SetStep> {
        let name = self.expect_ident("variable name")?;
        let eq = self.next()?;
        if eq.kind != TokenKind::Equals {
            return Err(self.syntax_error(&eq, format!("expected '=', found {}", eq.describe())));
        }
        let value_tok = self.next()?;
        let value = match value_tok.kind {
            TokenKind::Str | TokenKind::Number => value_tok.text,
            TokenKind::Ident => value_tok.text,
            TokenKind::VarRef => {
                let (var_name, default) = value_tok.var_parts();
                match self.vars.resolve_or_default(var_name, default) {
                    Some((v, _)) => v,
                    None => {
                        self.diagnostics.push(
                            Diagnostic::warning(
                                "UNRESOLVED_VAR",
                                format!("variable ${{{var_name}}} is not defined"),
                            )
                            .at(value_tok.line, value_tok.column),
                        );
                        String::new()
                    }
                }
            }
            _ => {
                return Err(self.syntax_error(
                    &value_tok,
                    format!(
                        "expected a string, number or variable reference, found {}",
                        value_tok.describe()
                    ),
                ))
            }
        };
        self.expect_semicolon()?;

        self.vars.set(&name.text, &value);
        Ok(SetStep {
            name: name.text,
            value,
            line,
        })
    }

    /// `INCLUDE "path";` splices the included file's statements inline.
    fn parse_include(&mut self, out: &mut Vec<Step>, line: usize) -> Result<()> {
        let path_tok = self.expect_string("include path")?;
        self.expect_semicolon()?;

        let mut path = PathBuf::from(&path_tok.text);
        if path.is_relative() {
            if let Some(base) = &self.base_dir {
                path = base.join(path);
            }
        }
        let canonical = path.canonicalize().map_err(|e| SqlFlowError::Syntax {
            line,
            column: path_tok.column,
            message: format!("cannot resolve include {:?}: {e}", path_tok.text),
        })?;
        if self.include_stack.contains(&canonical) {
            return Err(SqlFlowError::Syntax {
                line,
                column: path_tok.column,
                message: format!("include cycle detected at {:?}", path_tok.text),
            });
        }

        let text = std::fs::read_to_string(&canonical).map_err(|e| SqlFlowError::Syntax {
            line,
            column: path_tok.column,
            message: format!("cannot read include {:?}: {e}", path_tok.text),
        })?;

        self.includes.push(canonical.clone());
        let mut stack = self.include_stack.clone();
        stack.push(canonical.clone());

        let mut sub = Parser {
            lexer: Lexer::new(&text),
            vars: &mut *self.vars,
            diagnostics: Vec::new(),
            peeked: None,
            base_dir: canonical.parent().map(PathBuf::from),
            include_stack: stack,
            includes: Vec::new(),
        };
        sub.parse_statements(out, &[]);

        self.diagnostics.append(&mut sub.diagnostics);
        self.includes.append(&mut sub.includes);
        Ok(())
    }

    /// `IF cond THEN ... [ELSE IF cond THEN ...] [ELSE ...] END IF;`
    fn parse_conditional(&mut self, line: usize) -> Result<ConditionalBlock> {
        let mut branches = Vec::new();
        let mut else_branch = None;

        let condition = self.parse_condition()?;
        self.expect_keyword(Keyword::Then)?;
        let mut body = Vec::new();
        self.parse_statements(&mut body, &[Keyword::Else, Keyword::End]);
        branches.push((condition, body));

        loop {
            let tok = self.next()?;
            match tok.kind {
                TokenKind::Keyword(Keyword::Else) => {
                    if self.peek()?.is_keyword(Keyword::If) {
                        self.next()?;
                        let condition = self.parse_condition()?;
                        self.expect_keyword(Keyword::Then)?;
                        let mut body = Vec::new();
                        self.parse_statements(&mut body, &[Keyword::Else, Keyword::End]);
                        branches.push((condition, body));
                    } else {
                        let mut body = Vec::new();
                        self.parse_statements(&mut body, &[Keyword::Else, Keyword::End]);
                        if else_branch.replace(body).is_some() {
                            return Err(
                                self.syntax_error(&tok, "duplicate ELSE branch in IF block")
                            );
                        }
                    }
                }
                TokenKind::Keyword(Keyword::End) => {
                    self.expect_keyword(Keyword::If)?;
                    self.expect_semicolon()?;
                    break;
                }
                TokenKind::Eof => {
                    return Err(self.syntax_error(&tok, "unterminated IF block (missing END IF)"))
                }
                _ => {
                    return Err(self.syntax_error(
                        &tok,
                        format!("expected ELSE or END IF, found {}", tok.describe()),
                    ))
                }
            }
        }

        Ok(ConditionalBlock {
            branches,
            else_branch,
            line,
        })
    }

    /// `expr (("AND"|"OR") expr)*` with AND binding tighter than OR: the
    /// result is an OR-list of AND-groups, evaluated left to right.
    fn parse_condition(&mut self) -> Result<Condition> {
        let mut any_of = Vec::new();
        let mut group = vec![self.parse_comparison()?];
        loop {
            let peeked = self.peek()?;
            match peeked.kind {
                TokenKind::Keyword(Keyword::And) => {
                    self.next()?;
                    group.push(self.parse_comparison()?);
                }
                TokenKind::Keyword(Keyword::Or) => {
                    self.next()?;
                    any_of.push(std::mem::take(&mut group));
                    group.push(self.parse_comparison()?);
                }
                _ => break,
            }
        }
        any_of.push(group);
        Ok(Condition { any_of })
    }

    /// `id op (string|number|id|var_ref)`
    fn parse_comparison(&mut self) -> Result<Comparison> {
        let left_tok = self.expect_ident("variable name")?;
        let op_tok = self.next()?;
        let TokenKind::Cmp(op) = op_tok.kind else {
            return Err(self.syntax_error(
                &op_tok,
                format!("expected a comparison operator, found {}", op_tok.describe()),
            ));
        };
        let right_tok = self.next()?;
        let right = match right_tok.kind {
            TokenKind::Str => Operand::Str(right_tok.text),
            TokenKind::Number => Operand::Number(right_tok.text),
            TokenKind::Ident => Operand::Ident(right_tok.text),
            TokenKind::VarRef => {
                let (name, default) = right_tok.var_parts();
                Operand::VarRef {
                    name: name.to_string(),
                    default: default.map(str::to_string),
                }
            }
            _ => {
                return Err(self.syntax_error(
                    &right_tok,
                    format!(
                        "expected a string, number, identifier or variable reference, found {}",
                        right_tok.describe()
                    ),
                ))
            }
        };
        Ok(Comparison {
            left: Operand::Ident(left_tok.text),
            op,
            right,
        })
    }
}
