use std::sync::OnceLock;

use regex::Regex;

/// SQL words that can follow `FROM`/`JOIN` syntactically without naming a
/// table (e.g. `DELETE FROM`, lateral keywords). Filtered out of reference
/// extraction.
const NON_TABLE_WORDS: &[&str] = &["select", "values", "unnest", "lateral"];

fn from_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\bFROM\s+([A-Za-z_][A-Za-z0-9_]*(?:\s*,\s*[A-Za-z_][A-Za-z0-9_]*)*)",
        )
        .expect("static regex")
    })
}

fn join_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bJOIN\s+([A-Za-z_][A-Za-z0-9_]*)").expect("static regex"))
}

fn udf_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bPYTHON_FUNC\s*\(\s*"[^"]+"\s*,\s*([A-Za-z_][A-Za-z0-9_]*)\s*\)"#)
            .expect("static regex")
    })
}

/// Extract table names referenced by a SQL query.
///
/// Handles `FROM <id>`, comma-separated FROM lists, `JOIN <id>`, and the
/// table-valued UDF pattern `PYTHON_FUNC("mod.fn", <id>)`. Names are
/// normalized to lowercase (the engine folds unquoted identifiers) and
/// deduplicated preserving first-occurrence order. Function calls in FROM
/// position (`FROM generate_series(...)`) are skipped.
pub fn extract_table_refs(sql: &str) -> Vec<String> {
    let mut refs: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        let lower = name.to_ascii_lowercase();
        if NON_TABLE_WORDS.contains(&lower.as_str()) {
            return;
        }
        if !refs.contains(&lower) {
            refs.push(lower);
        }
    };

    for cap in from_regex().captures_iter(sql) {
        let m = cap.get(1).expect("list group");
        // Skip function calls: identifier immediately followed by '('.
        let rest = &sql[m.end()..];
        let names: Vec<&str> = m.as_str().split(',').map(str::trim).collect();
        for (i, name) in names.iter().enumerate() {
            let is_last = i == names.len() - 1;
            if is_last && rest.trim_start().starts_with('(') {
                continue;
            }
            push(name);
        }
    }
    for cap in join_regex().captures_iter(sql) {
        let m = cap.get(1).expect("join group");
        if sql[m.end()..].trim_start().starts_with('(') {
            continue;
        }
        push(m.as_str());
    }
    for cap in udf_regex().captures_iter(sql) {
        push(cap.get(1).expect("udf group").as_str());
    }

    refs
}
