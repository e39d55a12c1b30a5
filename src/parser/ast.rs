use std::fmt;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde_json::Value;

use crate::parser::token::CmpOp;

/// Write semantics for `LOAD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadMode {
    Replace,
    Append,
    Upsert { keys: Vec<String> },
}

impl Default for LoadMode {
    fn default() -> Self {
        LoadMode::Replace
    }
}

/// Write semantics for `CREATE TABLE ... AS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformMode {
    Replace,
    Append,
    Upsert {
        keys: Vec<String>,
    },
    Incremental {
        time_column: String,
        lookback: Option<String>,
    },
}

impl Default for TransformMode {
    fn default() -> Self {
        TransformMode::Replace
    }
}

/// `SOURCE name TYPE kind PARAMS { ... };`
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDefStep {
    pub name: String,
    pub connector_type: String,
    pub params: Value,
    /// Cursor column driving incremental reads, from `params.cursor_field`.
    pub incremental_cursor: Option<String>,
    pub line: usize,
}

/// `LOAD target FROM source [MODE ...];`
#[derive(Debug, Clone, PartialEq)]
pub struct LoadStep {
    pub target_table: String,
    pub source_name: String,
    pub mode: LoadMode,
    pub line: usize,
}

/// `CREATE TABLE name [MODE ...] AS <sql>;`
#[derive(Debug, Clone, PartialEq)]
pub struct SqlBlockStep {
    pub table_name: String,
    pub sql: String,
    pub mode: TransformMode,
    pub line: usize,
}

/// The thing being exported: an inline query or a bare table reference.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportQuery {
    Sql(String),
    Table(String),
}

impl ExportQuery {
    /// SQL text selecting the exported rows.
    pub fn to_sql(&self) -> String {
        match self {
            ExportQuery::Sql(sql) => sql.clone(),
            ExportQuery::Table(table) => format!("SELECT * FROM {table}"),
        }
    }
}

/// `EXPORT <query|table> TO "uri" TYPE fmt [OPTIONS { ... }];`
#[derive(Debug, Clone, PartialEq)]
pub struct ExportStep {
    pub query: ExportQuery,
    pub destination: String,
    pub format: String,
    pub options: Value,
    pub line: usize,
}

/// `SET name = value;` (already applied to the variable context at parse time).
#[derive(Debug, Clone, PartialEq)]
pub struct SetStep {
    pub name: String,
    pub value: String,
    pub line: usize,
}

/// One operand of a conditional comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Bare identifier, resolved as a variable name at plan time.
    Ident(String),
    Str(String),
    Number(String),
    VarRef { name: String, default: Option<String> },
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Ident(name) => write!(f, "{name}"),
            Operand::Str(s) => write!(f, "{s:?}"),
            Operand::Number(n) => write!(f, "{n}"),
            Operand::VarRef { name, default } => match default {
                Some(d) => write!(f, "${{{name}|{d}}}"),
                None => write!(f, "${{{name}}}"),
            },
        }
    }
}

/// A single `lhs op rhs` test.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub left: Operand,
    pub op: CmpOp,
    pub right: Operand,
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.left, self.op, self.right)
    }
}

/// A conditional test in disjunctive normal form: `AND` binds tighter than
/// `OR`, so the condition is an OR over groups of ANDed comparisons.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub any_of: Vec<Vec<Comparison>>,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (gi, group) in self.any_of.iter().enumerate() {
            if gi > 0 {
                write!(f, " OR ")?;
            }
            for (ci, cmp) in group.iter().enumerate() {
                if ci > 0 {
                    write!(f, " AND ")?;
                }
                write!(f, "{cmp}")?;
            }
        }
        Ok(())
    }
}

/// `IF ... THEN ... [ELSE IF ...] [ELSE ...] END IF;`
///
/// Branches are ordered; the else branch, when present, is a final branch
/// with no condition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalBlock {
    pub branches: Vec<(Condition, Vec<Step>)>,
    pub else_branch: Option<Vec<Step>>,
    pub line: usize,
}

/// A parsed pipeline directive. `INCLUDE` is expanded inline during parsing,
/// so it does not appear here; included files are recorded on the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Source(SourceDefStep),
    Load(LoadStep),
    Transform(SqlBlockStep),
    Export(ExportStep),
    Set(SetStep),
    Conditional(ConditionalBlock),
}

impl Step {
    pub fn line(&self) -> usize {
        match self {
            Step::Source(s) => s.line,
            Step::Load(s) => s.line,
            Step::Transform(s) => s.line,
            Step::Export(s) => s.line,
            Step::Set(s) => s.line,
            Step::Conditional(s) => s.line,
        }
    }
}

/// Diagnostic severity. Errors are fatal at pipeline level; warnings are
/// surfaced but do not block planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A parse- or plan-time diagnostic with an optional source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl Diagnostic {
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code,
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn warning(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code,
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sev = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match (self.line, self.column) {
            (Some(l), Some(c)) => write!(f, "{sev}[{}] {} (line {l}, column {c})", self.code, self.message),
            (Some(l), None) => write!(f, "{sev}[{}] {} (line {l})", self.code, self.message),
            _ => write!(f, "{sev}[{}] {}", self.code, self.message),
        }
    }
}

/// A fully parsed pipeline: ordered steps after include expansion, the merged
/// variable snapshot, and accumulated diagnostics.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    /// Logical pipeline name; the script file stem, or "inline".
    pub name: String,
    pub source_file: Option<PathBuf>,
    pub steps: Vec<Step>,
    /// `SET` variables in pipeline order, as applied during parsing.
    pub variables: IndexMap<String, String>,
    pub diagnostics: Vec<Diagnostic>,
    /// Files spliced in by `INCLUDE`, in encounter order.
    pub includes: Vec<PathBuf>,
}

impl Pipeline {
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
    }
}
