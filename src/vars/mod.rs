//! Layered variable resolution for `${name|default}` references.
//!
//! Resolution precedence, highest first:
//! CLI overrides > profile > in-pipeline `SET` > `.env` file > process
//! environment > the `${name|default}` default. `SET` statements are applied
//! in pipeline order, later wins.

use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;

use crate::errors::Result;

/// Where a resolved value came from, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarSource {
    Cli,
    Profile,
    Set,
    DotEnv,
    Env,
    Default,
}

fn var_ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?:\|([^}]*))?\}").expect("static regex")
    })
}

/// The merged variable map handed to the parser and planner.
#[derive(Debug, Default, Clone)]
pub struct VarContext {
    cli: IndexMap<String, String>,
    profile: IndexMap<String, String>,
    set_vars: IndexMap<String, String>,
    dotenv: IndexMap<String, String>,
}

impl VarContext {
    /// Empty context; process environment is still consulted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that additionally loads `.env` from the current directory or
    /// its ancestors, if present. A missing file is not an error.
    pub fn with_dotenv() -> Self {
        let mut ctx = Self::default();
        if let Ok(iter) = dotenvy::dotenv_iter() {
            for (key, value) in iter.flatten() {
                ctx.dotenv.insert(key, value);
            }
        }
        ctx
    }

    /// Install CLI `--var key=value` overrides (highest precedence).
    pub fn with_cli_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.cli.insert(k.into(), v.into());
        }
        self
    }

    /// Install a resolved profile map (loaded by an external collaborator).
    pub fn with_profile<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.profile.insert(k.into(), v.into());
        }
        self
    }

    /// Record a `SET name = value` statement. Later SETs win over earlier.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.set_vars.insert(name.into(), value.into());
    }

    /// Snapshot of every SET applied so far, in pipeline order.
    pub fn set_vars(&self) -> &IndexMap<String, String> {
        &self.set_vars
    }

    /// Resolve a variable by name through the precedence chain.
    pub fn resolve(&self, name: &str) -> Option<(String, VarSource)> {
        if let Some(v) = self.cli.get(name) {
            return Some((v.clone(), VarSource::Cli));
        }
        if let Some(v) = self.profile.get(name) {
            return Some((v.clone(), VarSource::Profile));
        }
        if let Some(v) = self.set_vars.get(name) {
            return Some((v.clone(), VarSource::Set));
        }
        if let Some(v) = self.dotenv.get(name) {
            return Some((v.clone(), VarSource::DotEnv));
        }
        if let Ok(v) = std::env::var(name) {
            return Some((v, VarSource::Env));
        }
        None
    }

    /// Resolve with a fallthrough to the `${name|default}` default.
    pub fn resolve_or_default(&self, name: &str, default: Option<&str>) -> Option<(String, VarSource)> {
        self.resolve(name)
            .or_else(|| default.map(|d| (d.to_string(), VarSource::Default)))
    }

    /// Replace every `${name}` / `${name|default}` in `text`.
    ///
    /// Unresolved references without a default substitute as the empty string
    /// and are returned so the caller can surface a warning.
    pub fn substitute_with_unresolved(&self, text: &str) -> (String, Vec<String>) {
        let re = var_ref_regex();
        let mut result = String::with_capacity(text.len());
        let mut unresolved = Vec::new();
        let mut last_match = 0;

        for cap in re.captures_iter(text) {
            let full_match = cap.get(0).expect("group 0 always present");
            let name = cap.get(1).expect("name group").as_str();
            let default = cap.get(2).map(|m| m.as_str());

            result.push_str(&text[last_match..full_match.start()]);
            match self.resolve_or_default(name, default) {
                Some((value, _)) => result.push_str(&value),
                None => unresolved.push(name.to_string()),
            }
            last_match = full_match.end();
        }
        result.push_str(&text[last_match..]);

        (result, unresolved)
    }

    /// Replace variable references, silently substituting the empty string
    /// for unresolved names.
    pub fn substitute(&self, text: &str) -> Result<String> {
        Ok(self.substitute_with_unresolved(text).0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_cli_beats_set_beats_env() {
        std::env::set_var("SQLFLOW_TEST_PRECEDENCE", "from_env");
        let mut ctx = VarContext::new().with_cli_vars([("who", "cli")]);
        ctx.set("who", "set");
        ctx.set("SQLFLOW_TEST_PRECEDENCE", "set");

        assert_eq!(ctx.resolve("who"), Some(("cli".into(), VarSource::Cli)));
        assert_eq!(
            ctx.resolve("SQLFLOW_TEST_PRECEDENCE"),
            Some(("set".into(), VarSource::Set))
        );
        std::env::remove_var("SQLFLOW_TEST_PRECEDENCE");
    }

    #[test]
    fn later_set_wins() {
        let mut ctx = VarContext::new();
        ctx.set("env", "dev");
        ctx.set("env", "prod");
        assert_eq!(ctx.resolve("env"), Some(("prod".into(), VarSource::Set)));
    }

    #[test]
    fn substitute_uses_defaults_and_reports_unresolved() {
        let ctx = VarContext::new().with_cli_vars([("name", "orders")]);
        let (out, unresolved) =
            ctx.substitute_with_unresolved("t_${name}_${region|eu}_${missing}");
        assert_eq!(out, "t_orders_eu_");
        assert_eq!(unresolved, vec!["missing".to_string()]);
    }

    #[test]
    fn substitute_preserves_text_without_refs() {
        let ctx = VarContext::new();
        assert_eq!(ctx.substitute("SELECT 1").unwrap(), "SELECT 1");
    }
}
