use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::errors::{Result, SqlFlowError};
use crate::parser::ast::{
    Diagnostic, ExportQuery, ExportStep, LoadMode, LoadStep, Pipeline, SourceDefStep,
    SqlBlockStep, Step, TransformMode,
};
use crate::plan::condition::evaluate;
use crate::plan::refs::extract_table_refs;
use crate::plan::{short_hash, ExecutionPlan, ExecutionStep, StepType};
use crate::utils::validate_identifier;
use crate::vars::VarContext;

/// Build a serialized execution plan from a parsed pipeline.
///
/// Conditionals are resolved here against the variable map (SET statements
/// re-apply in pipeline order, so a condition sees every variable set before
/// it); only taken branches contribute steps. Returns the plan plus planning
/// diagnostics (reference warnings). Cycles, duplicate producers, and invalid
/// identifiers are fatal.
pub fn build_plan(
    pipeline: &Pipeline,
    vars: &VarContext,
) -> Result<(ExecutionPlan, Vec<Diagnostic>)> {
    let mut diagnostics = Vec::new();
    let mut plan_vars = vars.clone();
    let mut flat = Vec::new();
    flatten(&pipeline.steps, &mut plan_vars, &mut diagnostics, &mut flat);

    let nodes = build_nodes(&flat)?;
    let (order, edges) = resolve_dependencies(&nodes, &mut diagnostics)?;

    let ids = assign_ids(&nodes);
    let steps = order
        .iter()
        .map(|&idx| {
            let deps = edges[idx].iter().map(|&d| ids[d].clone()).collect();
            build_step(&nodes[idx], ids[idx].clone(), deps)
        })
        .collect();

    Ok((
        ExecutionPlan {
            pipeline: pipeline.name.clone(),
            steps,
        },
        diagnostics,
    ))
}

/// A step surviving conditional resolution, with plan-time variable
/// substitution applied to its SQL text.
enum FlatStep {
    Source(SourceDefStep),
    Load(LoadStep),
    Transform(SqlBlockStep),
    Export(ExportStep),
}

fn flatten(
    steps: &[Step],
    vars: &mut VarContext,
    diagnostics: &mut Vec<Diagnostic>,
    out: &mut Vec<FlatStep>,
) {
    for step in steps {
        match step {
            Step::Set(set) => {
                // Re-applied here so conditions and SQL substitution observe
                // only SETs on the taken path up to this point.
                vars.set(&set.name, &set.value);
            }
            Step::Source(source) => out.push(FlatStep::Source(source.clone())),
            Step::Load(load) => out.push(FlatStep::Load(load.clone())),
            Step::Transform(block) => {
                let mut block = block.clone();
                block.sql = substitute_sql(&block.sql, block.line, vars, diagnostics);
                out.push(FlatStep::Transform(block));
            }
            Step::Export(export) => {
                let mut export = export.clone();
                if let ExportQuery::Sql(sql) = &export.query {
                    export.query =
                        ExportQuery::Sql(substitute_sql(sql, export.line, vars, diagnostics));
                }
                out.push(FlatStep::Export(export));
            }
            Step::Conditional(block) => {
                let taken = block
                    .branches
                    .iter()
                    .find(|(cond, _)| evaluate(cond, vars))
                    .map(|(_, body)| body)
                    .or(block.else_branch.as_ref());
                if let Some(body) = taken {
                    flatten(body, vars, diagnostics, out);
                }
            }
        }
    }
}

fn substitute_sql(
    sql: &str,
    line: usize,
    vars: &VarContext,
    diagnostics: &mut Vec<Diagnostic>,
) -> String {
    let (text, unresolved) = vars.substitute_with_unresolved(sql);
    for name in unresolved {
        diagnostics.push(
            Diagnostic::warning(
                "UNRESOLVED_VAR",
                format!("variable ${{{name}}} is not defined"),
            )
            .at_line(line),
        );
    }
    text
}

/// A planning node: the flat step plus its derived identity and references.
struct Node {
    step: FlatStep,
    step_type: StepType,
    /// Display / id-base name: source name, target table, or export subject.
    name: String,
    /// Table this node produces, lowercase, if any.
    produces: Option<String>,
    /// Tables this node consumes, lowercase.
    consumes: Vec<String>,
    line: usize,
}

fn build_nodes(flat: &[FlatStep]) -> Result<Vec<Node>> {
    let mut nodes = Vec::with_capacity(flat.len());
    for step in flat {
        let node = match step {
            FlatStep::Source(source) => {
                validate_identifier(&source.name, "source name")?;
                Node {
                    step_type: StepType::Source,
                    name: source.name.clone(),
                    produces: Some(source.name.to_ascii_lowercase()),
                    consumes: Vec::new(),
                    line: source.line,
                    step: FlatStep::Source(source.clone()),
                }
            }
            FlatStep::Load(load) => {
                validate_identifier(&load.target_table, "target table")?;
                validate_identifier(&load.source_name, "source name")?;
                if let LoadMode::Upsert { keys } = &load.mode {
                    for key in keys {
                        validate_identifier(key, "upsert key")?;
                    }
                }
                Node {
                    step_type: StepType::Load,
                    name: load.target_table.clone(),
                    produces: Some(load.target_table.to_ascii_lowercase()),
                    consumes: vec![load.source_name.to_ascii_lowercase()],
                    line: load.line,
                    step: FlatStep::Load(load.clone()),
                }
            }
            FlatStep::Transform(block) => {
                validate_identifier(&block.table_name, "table name")?;
                match &block.mode {
                    TransformMode::Upsert { keys } => {
                        for key in keys {
                            validate_identifier(key, "upsert key")?;
                        }
                    }
                    TransformMode::Incremental { time_column, .. } => {
                        validate_identifier(time_column, "cursor column")?;
                    }
                    _ => {}
                }
                let own = block.table_name.to_ascii_lowercase();
                let consumes = extract_table_refs(&block.sql)
                    .into_iter()
                    .filter(|t| *t != own)
                    .collect();
                Node {
                    step_type: StepType::Transform,
                    name: block.table_name.clone(),
                    produces: Some(own),
                    consumes,
                    line: block.line,
                    step: FlatStep::Transform(block.clone()),
                }
            }
            FlatStep::Export(export) => {
                let (name, consumes) = match &export.query {
                    ExportQuery::Table(table) => {
                        validate_identifier(table, "export table")?;
                        (table.clone(), vec![table.to_ascii_lowercase()])
                    }
                    ExportQuery::Sql(sql) => {
                        let refs = extract_table_refs(sql);
                        let name = refs
                            .first()
                            .cloned()
                            .unwrap_or_else(|| "query".to_string());
                        (name, refs)
                    }
                };
                Node {
                    step_type: StepType::Export,
                    name,
                    produces: None,
                    consumes,
                    line: export.line,
                    step: FlatStep::Export(export.clone()),
                }
            }
        };
        nodes.push(node);
    }
    Ok(nodes)
}

/// Resolve producers, emit warnings for external references, run Kahn's
/// algorithm, and return the topological order (ties broken by source order)
/// together with each node's dependency list (as node indices).
fn resolve_dependencies(
    nodes: &[Node],
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<(Vec<usize>, Vec<Vec<usize>>)> {
    // Table -> producing node. Duplicates in the emitted (taken) step list
    // are a planning error; producers in untaken branches no longer exist.
    let mut producers: HashMap<&str, usize> = HashMap::new();
    for (idx, node) in nodes.iter().enumerate() {
        if let Some(table) = node.produces.as_deref() {
            if let Some(prev) = producers.insert(table, idx) {
                return Err(SqlFlowError::Planning(format!(
                    "duplicate producer for table '{table}': steps at line {} and line {}",
                    nodes[prev].line, node.line
                )));
            }
        }
    }

    let mut depends_on: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (idx, node) in nodes.iter().enumerate() {
        for table in &node.consumes {
            match producers.get(table.as_str()) {
                Some(&producer) if producer != idx => {
                    if !depends_on[idx].contains(&producer) {
                        depends_on[idx].push(producer);
                    }
                }
                Some(_) => {}
                None => {
                    diagnostics.push(
                        Diagnostic::warning(
                            "UNKNOWN_TABLE",
                            format!(
                                "table '{table}' is not produced by this pipeline; assuming it exists externally"
                            ),
                        )
                        .at_line(node.line),
                    );
                }
            }
        }
    }

    // Kahn's algorithm; among zero in-degree nodes always pick the smallest
    // source index so the emitted order is deterministic.
    let n = nodes.len();
    let mut indegree: Vec<usize> = depends_on.iter().map(Vec::len).collect();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (idx, deps) in depends_on.iter().enumerate() {
        for &dep in deps {
            successors[dep].push(idx);
        }
    }

    let mut emitted = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while order.len() < n {
        let next = (0..n).find(|&i| !emitted[i] && indegree[i] == 0);
        let Some(next) = next else {
            let cycle = reconstruct_cycle(nodes, &depends_on, &emitted);
            return Err(SqlFlowError::Planning(format!(
                "dependency cycle detected: {cycle}"
            )));
        };
        emitted[next] = true;
        order.push(next);
        for &succ in &successors[next] {
            indegree[succ] -= 1;
        }
    }

    Ok((order, depends_on))
}

/// Walk dependency edges among the unemitted nodes until one repeats, then
/// format the loop as `a → b → a`.
fn reconstruct_cycle(nodes: &[Node], depends_on: &[Vec<usize>], emitted: &[bool]) -> String {
    let start = (0..nodes.len())
        .find(|&i| !emitted[i])
        .expect("cycle implies a remaining node");
    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = depends_on[current]
            .iter()
            .copied()
            .find(|&d| !emitted[d])
            .expect("remaining node keeps a remaining dependency");
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut names: Vec<&str> = path[pos..].iter().map(|&i| nodes[i].name.as_str()).collect();
            names.push(nodes[next].name.as_str());
            return names.join(" → ");
        }
        path.push(next);
        current = next;
    }
}

/// Assign stable, content-derived ids: `<type>_<name>`, disambiguated with a
/// short payload hash on collision.
fn assign_ids(nodes: &[Node]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut ids = Vec::with_capacity(nodes.len());
    for node in nodes {
        let base = format!("{}_{}", node.step_type.as_str(), sanitize(&node.name));
        let id = if seen.contains_key(&base) {
            format!("{base}_{}", short_hash(&payload_json(node)))
        } else {
            base.clone()
        };
        *seen.entry(base).or_insert(0) += 1;
        ids.push(id);
    }
    ids
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>()
        .to_ascii_lowercase()
}

fn payload_json(node: &Node) -> Value {
    match &node.step {
        FlatStep::Source(s) => json!({"name": s.name, "type": s.connector_type, "params": s.params}),
        FlatStep::Load(l) => json!({"target": l.target_table, "source": l.source_name}),
        FlatStep::Transform(t) => json!({"table": t.table_name, "sql": t.sql}),
        FlatStep::Export(e) => json!({"dest": e.destination, "sql": e.query.to_sql()}),
    }
}

fn build_step(node: &Node, id: String, depends_on: Vec<String>) -> ExecutionStep {
    match &node.step {
        FlatStep::Source(source) => {
            let mut metadata = Map::new();
            metadata.insert("name".into(), Value::String(source.name.clone()));
            if let Some(cursor) = &source.incremental_cursor {
                metadata.insert("cursor_field".into(), Value::String(cursor.clone()));
            }
            ExecutionStep {
                id,
                step_type: StepType::Source,
                query: json!({
                    "connector_type": source.connector_type,
                    "params": source.params,
                }),
                depends_on,
                mode: None,
                time_column: source.incremental_cursor.clone(),
                upsert_keys: None,
                lookback: None,
                metadata,
            }
        }
        FlatStep::Load(load) => {
            let (mode, upsert_keys) = match &load.mode {
                LoadMode::Replace => ("REPLACE", None),
                LoadMode::Append => ("APPEND", None),
                LoadMode::Upsert { keys } => ("UPSERT", Some(keys.clone())),
            };
            ExecutionStep {
                id,
                step_type: StepType::Load,
                query: json!({
                    "source": load.source_name,
                    "target": load.target_table,
                }),
                depends_on,
                mode: Some(mode.to_string()),
                time_column: None,
                upsert_keys,
                lookback: None,
                metadata: Map::new(),
            }
        }
        FlatStep::Transform(block) => {
            let (mode, time_column, upsert_keys, lookback) = match &block.mode {
                TransformMode::Replace => ("REPLACE", None, None, None),
                TransformMode::Append => ("APPEND", None, None, None),
                TransformMode::Upsert { keys } => ("UPSERT", None, Some(keys.clone()), None),
                TransformMode::Incremental {
                    time_column,
                    lookback,
                } => (
                    "INCREMENTAL",
                    Some(time_column.clone()),
                    None,
                    lookback.clone(),
                ),
            };
            let mut metadata = Map::new();
            metadata.insert("table".into(), Value::String(block.table_name.clone()));
            ExecutionStep {
                id,
                step_type: StepType::Transform,
                query: Value::String(block.sql.clone()),
                depends_on,
                mode: Some(mode.to_string()),
                time_column,
                upsert_keys,
                lookback,
                metadata,
            }
        }
        FlatStep::Export(export) => {
            let mut metadata = Map::new();
            metadata.insert(
                "destination".into(),
                Value::String(export.destination.clone()),
            );
            metadata.insert("format".into(), Value::String(export.format.clone()));
            metadata.insert("options".into(), export.options.clone());
            if let ExportQuery::Table(table) = &export.query {
                metadata.insert("table".into(), Value::String(table.clone()));
            }
            ExecutionStep {
                id,
                step_type: StepType::Export,
                query: Value::String(export.query.to_sql()),
                depends_on,
                mode: None,
                time_column: None,
                upsert_keys: None,
                lookback: None,
                metadata,
            }
        }
    }
}
