//! Execution plan types and the dependency-aware planner.
//!
//! A plan is the serialized, durable artifact a run consumes: an ordered list
//! of execution steps with explicit `depends_on` edges, emitted in
//! topological order. Step ids are stable and content-derived so resume can
//! match persisted task state to plan steps.

pub mod condition;
pub mod planner;
pub mod refs;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub use planner::build_plan;

/// What kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Source,
    Load,
    Transform,
    Export,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Source => "source",
            StepType::Load => "load",
            StepType::Transform => "transform",
            StepType::Export => "export",
        }
    }
}

/// One element of the serialized execution plan.
///
/// `query` is a SQL string for transform/export steps and a config object for
/// source/load steps. `metadata` carries step-specific extras (target table,
/// destination, options) that don't warrant top-level fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub query: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upsert_keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ExecutionStep {
    /// SQL text for transform/export steps.
    pub fn sql(&self) -> Option<&str> {
        self.query.as_str()
    }

    /// A named string out of the metadata map.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// The serialized execution plan: pipeline name plus ordered steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub pipeline: String,
    pub steps: Vec<ExecutionStep>,
}

impl ExecutionPlan {
    pub fn step(&self, id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Content hash of the plan, stored on the run record so resume can
    /// verify it is replaying the same plan.
    pub fn hash(&self) -> String {
        let json = serde_json::to_string(&self.steps).expect("plan serializes");
        let digest = Sha256::digest(json.as_bytes());
        hex::encode(digest)
    }

    pub fn to_json(&self) -> crate::errors::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> crate::errors::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Short content hash used to disambiguate colliding step ids.
pub(crate) fn short_hash(payload: &Value) -> String {
    let json = serde_json::to_string(payload).expect("payload serializes");
    let digest = Sha256::digest(json.as_bytes());
    hex::encode(&digest[..4])
}
