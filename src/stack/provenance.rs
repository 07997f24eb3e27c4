//! Append-only record of the operations applied to a stack.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of operation recorded in the provenance log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    Select,
    MaxProjection,
    Apply,
    /// A named pipeline component (filter, registration step, ...).
    Component(String),
}

impl From<String> for OperationKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Select" => OperationKind::Select,
            "MaxProjection" => OperationKind::MaxProjection,
            "Apply" => OperationKind::Apply,
            _ => OperationKind::Component(value),
        }
    }
}

impl From<OperationKind> for String {
    fn from(value: OperationKind) -> Self {
        value.to_string()
    }
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Select => f.write_str("Select"),
            OperationKind::MaxProjection => f.write_str("MaxProjection"),
            OperationKind::Apply => f.write_str("Apply"),
            OperationKind::Component(name) => f.write_str(name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub method: OperationKind,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvenanceLog {
    entries: Vec<ProvenanceRecord>,
}

impl ProvenanceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, method: OperationKind, arguments: Map<String, Value>) {
        self.entries.push(ProvenanceRecord { method, arguments });
    }

    pub fn entries(&self) -> &[ProvenanceRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialises the log as `{"log": [...]}`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let mut document = Map::new();
        document.insert(LOG_KEY.to_string(), serde_json::to_value(self)?);
        serde_json::to_string(&document)
    }

    /// Parses a document written by [`ProvenanceLog::to_json`].
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(default)]
            log: ProvenanceLog,
        }
        serde_json::from_str::<Wrapper>(text).map(|wrapper| wrapper.log)
    }
}

pub const LOG_KEY: &str = "log";

/// Builds an argument map from `serde_json::json!({...})` output.
pub fn arguments(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_in_order() {
        let mut log = ProvenanceLog::new();
        log.record(
            OperationKind::Component("GaussianHighPass".into()),
            arguments(json!({"sigma": [3, 3], "is_volume": false})),
        );
        log.record(OperationKind::Select, Map::new());
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[0].method.to_string(), "GaussianHighPass");
        assert_eq!(log.entries()[1].method, OperationKind::Select);
    }

    #[test]
    fn json_round_trip() {
        let mut log = ProvenanceLog::new();
        log.record(OperationKind::Apply, arguments(json!({"group_by": ["r", "c"]})));
        log.record(OperationKind::Component("Clip".into()), Map::new());
        let text = log.to_json().unwrap();
        assert!(text.starts_with("{\"log\":"));
        assert_eq!(ProvenanceLog::from_json(&text).unwrap(), log);
    }

    #[test]
    fn copies_are_independent() {
        let mut log = ProvenanceLog::new();
        log.record(OperationKind::Select, Map::new());
        let mut copy = log.clone();
        copy.record(OperationKind::Apply, Map::new());
        assert_eq!(log.len(), 1);
        assert_eq!(copy.len(), 2);
    }
}
