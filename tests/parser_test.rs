use std::fs;

use sqlflow::parser::ast::{
    ExportQuery, LoadMode, Severity, Step, TransformMode,
};
use sqlflow::parser::parse_script;
use sqlflow::vars::VarContext;
use tempfile::TempDir;

fn parse_ok(script: &str) -> sqlflow::parser::Pipeline {
    let mut vars = VarContext::new();
    let pipeline = parse_script(script, None, &mut vars);
    assert!(
        !pipeline.has_errors(),
        "unexpected errors: {:?}",
        pipeline.diagnostics
    );
    pipeline
}

#[test]
fn parses_source_statement_with_json_params() {
    let pipeline = parse_ok(
        r#"SOURCE orders TYPE csv PARAMS {"path": "data/orders.csv", "has_header": true};"#,
    );
    let Step::Source(source) = &pipeline.steps[0] else {
        panic!("expected source step");
    };
    assert_eq!(source.name, "orders");
    assert_eq!(source.connector_type, "csv");
    assert_eq!(source.params["path"], "data/orders.csv");
    assert_eq!(source.params["has_header"], true);
    assert!(source.incremental_cursor.is_none());
}

#[test]
fn source_cursor_field_param_becomes_incremental_cursor() {
    let pipeline = parse_ok(
        r#"SOURCE events TYPE memory PARAMS {"cursor_field": "updated_at"};"#,
    );
    let Step::Source(source) = &pipeline.steps[0] else {
        panic!("expected source step");
    };
    assert_eq!(source.incremental_cursor.as_deref(), Some("updated_at"));
}

#[test]
fn parses_load_modes() {
    let pipeline = parse_ok(
        "LOAD a FROM s1;\n\
         LOAD b FROM s2 MODE APPEND;\n\
         LOAD c FROM s3 MODE UPSERT KEY id;\n\
         LOAD d FROM s4 MODE UPSERT KEY (tenant, id);",
    );
    let modes: Vec<&LoadMode> = pipeline
        .steps
        .iter()
        .map(|s| match s {
            Step::Load(l) => &l.mode,
            other => panic!("expected load, got {other:?}"),
        })
        .collect();
    assert_eq!(modes[0], &LoadMode::Replace);
    assert_eq!(modes[1], &LoadMode::Append);
    assert_eq!(
        modes[2],
        &LoadMode::Upsert {
            keys: vec!["id".into()]
        }
    );
    assert_eq!(
        modes[3],
        &LoadMode::Upsert {
            keys: vec!["tenant".into(), "id".into()]
        }
    );
}

#[test]
fn parses_create_table_with_raw_sql_span() {
    let pipeline = parse_ok(
        "CREATE TABLE daily AS\n\
         SELECT o.day, COUNT(DISTINCT o.id) AS n\n\
         FROM orders o -- inline comment\n\
         WHERE o.note != ';'\n\
         GROUP BY o.day;",
    );
    let Step::Transform(block) = &pipeline.steps[0] else {
        panic!("expected transform step");
    };
    assert_eq!(block.table_name, "daily");
    assert_eq!(block.mode, TransformMode::Replace);
    // dots and function parens preserved verbatim
    assert!(block.sql.contains("o.day"));
    assert!(block.sql.contains("COUNT(DISTINCT o.id)"));
    assert!(block.sql.contains("!= ';'"));
}

#[test]
fn parses_create_or_replace_prefix() {
    let pipeline = parse_ok("CREATE OR REPLACE TABLE t AS SELECT 1 AS n;");
    let Step::Transform(block) = &pipeline.steps[0] else {
        panic!("expected transform step");
    };
    assert_eq!(block.mode, TransformMode::Replace);
}

#[test]
fn parses_transform_modes() {
    let pipeline = parse_ok(
        "CREATE TABLE a MODE APPEND AS SELECT 1 AS n;\n\
         CREATE TABLE b MODE UPSERT KEY (id) AS SELECT 1 AS id;\n\
         CREATE TABLE c MODE INCREMENTAL BY ts AS SELECT 1 AS ts;\n\
         CREATE TABLE d MODE INCREMENTAL BY ts LOOKBACK \"1 day\" AS SELECT 1 AS ts;",
    );
    let mode = |i: usize| match &pipeline.steps[i] {
        Step::Transform(b) => b.mode.clone(),
        other => panic!("expected transform, got {other:?}"),
    };
    assert_eq!(mode(0), TransformMode::Append);
    assert_eq!(
        mode(1),
        TransformMode::Upsert {
            keys: vec!["id".into()]
        }
    );
    assert_eq!(
        mode(2),
        TransformMode::Incremental {
            time_column: "ts".into(),
            lookback: None
        }
    );
    assert_eq!(
        mode(3),
        TransformMode::Incremental {
            time_column: "ts".into(),
            lookback: Some("1 day".into())
        }
    );
}

#[test]
fn parses_export_with_inline_query_and_options() {
    let pipeline = parse_ok(
        r#"EXPORT SELECT total, day FROM summary TO "out/summary.csv" TYPE CSV OPTIONS {"header": true};"#,
    );
    let Step::Export(export) = &pipeline.steps[0] else {
        panic!("expected export step");
    };
    let ExportQuery::Sql(sql) = &export.query else {
        panic!("expected inline query");
    };
    assert_eq!(sql.trim(), "SELECT total, day FROM summary");
    assert_eq!(export.destination, "out/summary.csv");
    assert_eq!(export.format, "csv");
    assert_eq!(export.options["header"], true);
}

#[test]
fn parses_export_of_bare_table() {
    let pipeline = parse_ok(r#"EXPORT summary TO "out/s.parquet" TYPE PARQUET;"#);
    let Step::Export(export) = &pipeline.steps[0] else {
        panic!("expected export step");
    };
    assert_eq!(export.query, ExportQuery::Table("summary".into()));
    assert_eq!(export.format, "parquet");
}

#[test]
fn set_applies_eagerly_and_substitutes_in_strings() {
    let mut vars = VarContext::new();
    let pipeline = parse_script(
        "SET env = \"prod\";\n\
         EXPORT t TO \"out/${env}/t.csv\" TYPE CSV;",
        None,
        &mut vars,
    );
    assert!(!pipeline.has_errors(), "{:?}", pipeline.diagnostics);
    let Step::Export(export) = &pipeline.steps[1] else {
        panic!("expected export step");
    };
    assert_eq!(export.destination, "out/prod/t.csv");
    assert_eq!(pipeline.variables.get("env").map(String::as_str), Some("prod"));
}

#[test]
fn cli_vars_override_set() {
    let mut vars = VarContext::new().with_cli_vars([("env", "staging")]);
    let pipeline = parse_script(
        "SET env = \"prod\";\nEXPORT t TO \"out/${env}.csv\" TYPE CSV;",
        None,
        &mut vars,
    );
    let Step::Export(export) = &pipeline.steps[1] else {
        panic!("expected export step");
    };
    assert_eq!(export.destination, "out/staging.csv");
}

#[test]
fn unresolved_variable_in_string_warns_and_substitutes_empty() {
    let mut vars = VarContext::new();
    let pipeline = parse_script(
        "EXPORT t TO \"out/${nope}.csv\" TYPE CSV;",
        None,
        &mut vars,
    );
    assert!(!pipeline.has_errors());
    assert!(pipeline
        .warnings()
        .any(|d| d.code == "UNRESOLVED_VAR" && d.message.contains("nope")));
    let Step::Export(export) = &pipeline.steps[0] else {
        panic!("expected export step");
    };
    assert_eq!(export.destination, "out/.csv");
}

#[test]
fn variable_default_used_in_json_params() {
    let mut vars = VarContext::new();
    let pipeline = parse_script(
        r#"SOURCE s TYPE csv PARAMS {"path": "${data_dir|./data}/a.csv"};"#,
        None,
        &mut vars,
    );
    let Step::Source(source) = &pipeline.steps[0] else {
        panic!("expected source step");
    };
    assert_eq!(source.params["path"], "./data/a.csv");
}

#[test]
fn conditional_blocks_parse_recursively() {
    let pipeline = parse_ok(
        "IF env == \"prod\" THEN\n\
           CREATE TABLE t AS SELECT 1 AS n;\n\
           IF region == \"eu\" THEN\n\
             CREATE TABLE eu AS SELECT 1 AS n;\n\
           END IF;\n\
         ELSE IF env == \"staging\" THEN\n\
           CREATE TABLE s AS SELECT 1 AS n;\n\
         ELSE\n\
           CREATE TABLE dev AS SELECT 1 AS n;\n\
         END IF;",
    );
    let Step::Conditional(block) = &pipeline.steps[0] else {
        panic!("expected conditional step");
    };
    assert_eq!(block.branches.len(), 2);
    assert!(block.else_branch.is_some());
    // nested conditional inside the first branch
    assert!(matches!(block.branches[0].1[1], Step::Conditional(_)));
}

#[test]
fn include_expands_inline_relative_to_enclosing_file() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("common.sf"),
        "SET region = \"eu\";\nCREATE TABLE shared AS SELECT 1 AS n;\n",
    )
    .unwrap();
    let main = dir.path().join("main.sf");
    fs::write(
        &main,
        "INCLUDE \"common.sf\";\nCREATE TABLE top AS SELECT * FROM shared;\n",
    )
    .unwrap();

    let mut vars = VarContext::new();
    let pipeline = sqlflow::parser::parse_file(&main, &mut vars).unwrap();
    assert!(!pipeline.has_errors(), "{:?}", pipeline.diagnostics);
    assert_eq!(pipeline.steps.len(), 3); // SET + shared + top
    assert_eq!(pipeline.includes.len(), 1);
    assert_eq!(pipeline.variables.get("region").map(String::as_str), Some("eu"));
}

#[test]
fn include_cycles_are_fatal() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a.sf");
    let b = dir.path().join("b.sf");
    fs::write(&a, "INCLUDE \"b.sf\";\n").unwrap();
    fs::write(&b, "INCLUDE \"a.sf\";\n").unwrap();

    let mut vars = VarContext::new();
    let pipeline = sqlflow::parser::parse_file(&a, &mut vars).unwrap();
    assert!(pipeline.has_errors());
    assert!(pipeline
        .errors()
        .any(|d| d.message.contains("include cycle")));
}

#[test]
fn syntax_errors_recover_at_statement_boundaries() {
    let mut vars = VarContext::new();
    let pipeline = parse_script(
        "LOAD FROM s;\n\
         CREATE TABLE ok AS SELECT 1 AS n;\n\
         SOURCE TYPE;\n\
         SET x = 1;",
        None,
        &mut vars,
    );
    assert!(pipeline.has_errors());
    assert_eq!(pipeline.errors().count(), 2);
    // statements after each error still parsed
    assert!(pipeline
        .steps
        .iter()
        .any(|s| matches!(s, Step::Transform(b) if b.table_name == "ok")));
    assert!(pipeline
        .steps
        .iter()
        .any(|s| matches!(s, Step::Set(set) if set.name == "x")));
}

#[test]
fn syntax_error_reports_line_and_column() {
    let mut vars = VarContext::new();
    let pipeline = parse_script("CREATE TABLE\n  123 AS SELECT 1;", None, &mut vars);
    let error = pipeline.errors().next().expect("one error");
    assert_eq!(error.severity, Severity::Error);
    assert_eq!(error.line, Some(2));
    assert_eq!(error.column, Some(3));
}

#[test]
fn trailing_commas_in_json_are_invalid() {
    let mut vars = VarContext::new();
    let pipeline = parse_script(
        r#"SOURCE s TYPE csv PARAMS {"path": "a.csv",};"#,
        None,
        &mut vars,
    );
    assert!(pipeline.has_errors());
    assert!(pipeline.errors().any(|d| d.message.contains("invalid JSON")));
}

#[test]
fn empty_script_parses_to_empty_pipeline() {
    let pipeline = parse_ok("");
    assert!(pipeline.steps.is_empty());
    assert!(pipeline.diagnostics.is_empty());
}

#[test]
fn keywords_are_case_insensitive() {
    let pipeline = parse_ok("load t from s mode append;");
    let Step::Load(load) = &pipeline.steps[0] else {
        panic!("expected load step");
    };
    assert_eq!(load.mode, LoadMode::Append);
}
