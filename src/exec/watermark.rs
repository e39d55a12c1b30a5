use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use datafusion::scalar::ScalarValue;
use serde_json::{json, Value};
use tracing::debug;

use crate::engine::SqlEngine;
use crate::errors::{Result, SqlFlowError};
use crate::state::StateBackend;

/// A typed watermark: the highest cursor value successfully processed for a
/// `(pipeline, table, column)`. Values are opaque scalars, but the type is
/// preserved so a later run binds the same type the cursor column has.
#[derive(Debug, Clone, PartialEq)]
pub enum WatermarkValue {
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl WatermarkValue {
    /// Lift an engine scalar (e.g. the result of `MAX(col)`) into a
    /// watermark. `None` for SQL NULL or unsupported types.
    pub fn from_scalar(scalar: &ScalarValue) -> Option<Self> {
        match scalar {
            ScalarValue::Int8(Some(v)) => Some(Self::Int(*v as i64)),
            ScalarValue::Int16(Some(v)) => Some(Self::Int(*v as i64)),
            ScalarValue::Int32(Some(v)) => Some(Self::Int(*v as i64)),
            ScalarValue::Int64(Some(v)) => Some(Self::Int(*v)),
            ScalarValue::UInt8(Some(v)) => Some(Self::Int(*v as i64)),
            ScalarValue::UInt16(Some(v)) => Some(Self::Int(*v as i64)),
            ScalarValue::UInt32(Some(v)) => Some(Self::Int(*v as i64)),
            ScalarValue::UInt64(Some(v)) => Some(Self::Int(*v as i64)),
            ScalarValue::Float32(Some(v)) => Some(Self::Float(*v as f64)),
            ScalarValue::Float64(Some(v)) => Some(Self::Float(*v)),
            ScalarValue::Utf8(Some(v)) | ScalarValue::LargeUtf8(Some(v)) => {
                Some(Self::Text(v.clone()))
            }
            ScalarValue::Date32(Some(days)) => {
                let ts = DateTime::from_timestamp((*days as i64) * 86_400, 0)?;
                Some(Self::Timestamp(ts))
            }
            ScalarValue::TimestampSecond(Some(v), _) => {
                Some(Self::Timestamp(DateTime::from_timestamp(*v, 0)?))
            }
            ScalarValue::TimestampMillisecond(Some(v), _) => Some(Self::Timestamp(
                DateTime::from_timestamp_millis(*v)?,
            )),
            ScalarValue::TimestampMicrosecond(Some(v), _) => Some(Self::Timestamp(
                DateTime::from_timestamp_micros(*v)?,
            )),
            ScalarValue::TimestampNanosecond(Some(v), _) => {
                Some(Self::Timestamp(DateTime::from_timestamp_nanos(*v)))
            }
            _ => None,
        }
    }

    /// The engine parameter this watermark binds as.
    pub fn to_scalar(&self) -> ScalarValue {
        match self {
            Self::Int(v) => ScalarValue::Int64(Some(*v)),
            Self::Float(v) => ScalarValue::Float64(Some(*v)),
            // Timestamps bind as ISO strings; the engine coerces string
            // literals against timestamp columns.
            Self::Timestamp(ts) => {
                ScalarValue::Utf8(Some(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
            }
            Self::Text(v) => ScalarValue::Utf8(Some(v.clone())),
        }
    }

    /// Tagged JSON encoding for the state store.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Int(v) => json!({"type": "int", "value": v}),
            Self::Float(v) => json!({"type": "float", "value": v}),
            Self::Timestamp(ts) => json!({
                "type": "timestamp",
                "value": ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            }),
            Self::Text(v) => json!({"type": "text", "value": v}),
        }
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SqlFlowError::State("watermark value missing type tag".into()))?;
        let inner = value
            .get("value")
            .ok_or_else(|| SqlFlowError::State("watermark value missing payload".into()))?;
        match kind {
            "int" => Ok(Self::Int(inner.as_i64().ok_or_else(|| {
                SqlFlowError::State("watermark int payload malformed".into())
            })?)),
            "float" => Ok(Self::Float(inner.as_f64().ok_or_else(|| {
                SqlFlowError::State("watermark float payload malformed".into())
            })?)),
            "timestamp" => {
                let raw = inner.as_str().ok_or_else(|| {
                    SqlFlowError::State("watermark timestamp payload malformed".into())
                })?;
                let ts = DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| SqlFlowError::State(format!("bad watermark timestamp: {e}")))?;
                Ok(Self::Timestamp(ts.with_timezone(&Utc)))
            }
            "text" => Ok(Self::Text(
                inner
                    .as_str()
                    .ok_or_else(|| SqlFlowError::State("watermark text payload malformed".into()))?
                    .to_string(),
            )),
            other => Err(SqlFlowError::State(format!(
                "unknown watermark type {other:?}"
            ))),
        }
    }

    /// Subtract a lookback from the watermark to get the window start.
    /// Timestamps (and timestamp-shaped text) shift back; plain numeric
    /// cursors are returned unchanged, a lookback has no meaning for them.
    pub fn minus(&self, lookback: Duration) -> WatermarkValue {
        match self {
            Self::Timestamp(ts) => Self::Timestamp(*ts - lookback),
            Self::Text(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(ts) => {
                    let shifted = ts.with_timezone(&Utc) - lookback;
                    Self::Text(shifted.to_rfc3339_opts(SecondsFormat::AutoSi, true))
                }
                Err(_) => self.clone(),
            },
            _ => self.clone(),
        }
    }

    /// Strictly-greater comparison between like-typed watermarks. Unlike
    /// types compare false, which keeps an existing watermark in place.
    pub fn gt(&self, other: &WatermarkValue) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a > b,
            (Self::Float(a), Self::Float(b)) => a > b,
            (Self::Int(a), Self::Float(b)) => (*a as f64) > *b,
            (Self::Float(a), Self::Int(b)) => *a > (*b as f64),
            (Self::Timestamp(a), Self::Timestamp(b)) => a > b,
            (Self::Text(a), Self::Text(b)) => a > b,
            _ => false,
        }
    }
}

type Key = (String, String, String);

/// Two-tier watermark lookup with a copy-on-write read cache.
///
/// Reads hit the cache (an `Arc` swap, no lock held during use), then the
/// state backend, then fall back to `SELECT MAX(col)` over the target table
/// when the metadata row is absent. Writes go through the task commit; the
/// cache is refreshed by the committer.
pub struct WatermarkStore {
    state: Arc<dyn StateBackend>,
    cache: RwLock<Arc<HashMap<Key, WatermarkValue>>>,
}

impl WatermarkStore {
    pub fn new(state: Arc<dyn StateBackend>) -> Self {
        Self {
            state,
            cache: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    fn cached(&self, key: &Key) -> Option<WatermarkValue> {
        let snapshot = Arc::clone(&self.cache.read().expect("watermark cache poisoned"));
        snapshot.get(key).cloned()
    }

    /// Record a committed watermark in the cache (clone-and-swap).
    pub fn put(&self, pipeline: &str, table: &str, column: &str, value: WatermarkValue) {
        let mut guard = self.cache.write().expect("watermark cache poisoned");
        let mut next: HashMap<Key, WatermarkValue> = (**guard).clone();
        next.insert(
            (pipeline.to_string(), table.to_string(), column.to_string()),
            value,
        );
        *guard = Arc::new(next);
    }

    /// Drop a cache entry (after `reset_watermark`).
    pub fn evict(&self, pipeline: &str, table: &str, column: &str) {
        let mut guard = self.cache.write().expect("watermark cache poisoned");
        let mut next: HashMap<Key, WatermarkValue> = (**guard).clone();
        next.remove(&(pipeline.to_string(), table.to_string(), column.to_string()));
        *guard = Arc::new(next);
    }

    /// Resolve the current watermark for `(pipeline, table, column)`.
    pub async fn get(
        &self,
        engine: &dyn SqlEngine,
        pipeline: &str,
        table: &str,
        column: &str,
    ) -> Result<Option<WatermarkValue>> {
        let key = (pipeline.to_string(), table.to_string(), column.to_string());
        if let Some(hit) = self.cached(&key) {
            return Ok(Some(hit));
        }

        if let Some(stored) = self.state.get_watermark(pipeline, table, column).await? {
            let value = WatermarkValue::from_json(&stored)?;
            self.put(pipeline, table, column, value.clone());
            return Ok(Some(value));
        }

        // Metadata absent: derive from the table itself if it exists.
        if engine.table_exists(table).await? {
            let scalar = engine
                .query_scalar(&format!("SELECT MAX({column}) FROM {table}"), Vec::new())
                .await?;
            if let Some(value) = scalar.as_ref().and_then(WatermarkValue::from_scalar) {
                debug!(pipeline, table, column, "derived watermark from MAX() fallback");
                self.put(pipeline, table, column, value.clone());
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_preserves_type() {
        let cases = vec![
            WatermarkValue::Int(42),
            WatermarkValue::Float(1.5),
            WatermarkValue::Timestamp(Utc::now()),
            WatermarkValue::Text("2024-01-05T00:00:00Z".into()),
        ];
        for value in cases {
            let json = value.to_json();
            let back = WatermarkValue::from_json(&json).unwrap();
            match (&value, &back) {
                (WatermarkValue::Timestamp(a), WatermarkValue::Timestamp(b)) => {
                    assert_eq!(a.timestamp_micros(), b.timestamp_micros())
                }
                _ => assert_eq!(value, back),
            }
        }
    }

    #[test]
    fn minus_shifts_timestamps_and_iso_text() {
        let ts = DateTime::parse_from_rfc3339("2024-01-05T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let shifted = WatermarkValue::Timestamp(ts).minus(Duration::days(1));
        assert_eq!(
            shifted,
            WatermarkValue::Timestamp(ts - Duration::days(1))
        );

        let text = WatermarkValue::Text("2024-01-05T12:00:00Z".into()).minus(Duration::hours(12));
        assert_eq!(text, WatermarkValue::Text("2024-01-05T00:00:00Z".into()));

        let int = WatermarkValue::Int(10).minus(Duration::days(1));
        assert_eq!(int, WatermarkValue::Int(10));
    }

    #[test]
    fn gt_compares_like_types_only() {
        assert!(WatermarkValue::Int(2).gt(&WatermarkValue::Int(1)));
        assert!(!WatermarkValue::Int(1).gt(&WatermarkValue::Int(1)));
        assert!(WatermarkValue::Text("b".into()).gt(&WatermarkValue::Text("a".into())));
        assert!(!WatermarkValue::Text("b".into()).gt(&WatermarkValue::Int(1)));
    }
}
