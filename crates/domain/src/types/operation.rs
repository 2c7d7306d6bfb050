//! Operations and their idempotency fingerprints

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::VOLATILE_PARAMETER_KEYS;

/// Stable hash of (tool, action, normalized parameters)
///
/// Object keys are ordered and volatile keys (timestamps, nonces, request
/// ids) are removed at every depth before hashing, so two requests that
/// differ only in those fields share a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(tool: &str, action: &str, parameters: &Value) -> Self {
        let normalized = normalize(parameters);
        let mut hasher = blake3::Hasher::new();
        hasher.update(tool.as_bytes());
        hasher.update(&[0]);
        hasher.update(action.as_bytes());
        hasher.update(&[0]);
        hasher.update(normalized.to_string().as_bytes());
        Self(hex::encode(hasher.finalize().as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical form of a parameter tree: sorted keys, volatile keys dropped
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> = map
                .iter()
                .filter(|(key, _)| !VOLATILE_PARAMETER_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key, normalize(value)))
                .collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect::<Map<_, _>>())
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Hex digest of a JSON value's canonical form, used for checksum-style
/// expected state
pub fn content_checksum(value: &Value) -> String {
    hex::encode(blake3::hash(normalize(value).to_string().as_bytes()).as_bytes())
}

/// Caller-supplied snapshot for optimistic conflict detection
///
/// `values` is compared structurally against the current upstream values;
/// `checksum` is compared against [`content_checksum`] of them. Either or
/// both may be given. `range` overrides the range named in the operation's
/// parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ExpectedState {
    pub fn values(values: Value) -> Self {
        Self { values: Some(values), ..Self::default() }
    }

    pub fn checksum(checksum: impl Into<String>) -> Self {
        Self { checksum: Some(checksum.into()), ..Self::default() }
    }

    #[must_use]
    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }

    /// Whether `current` satisfies every constraint this snapshot carries
    pub fn matches(&self, current: &Value) -> bool {
        let values_match =
            self.values.as_ref().map_or(true, |expected| normalize(expected) == normalize(current));
        let checksum_match =
            self.checksum.as_ref().map_or(true, |expected| *expected == content_checksum(current));
        values_match && checksum_match
    }
}

/// Location of upstream state an operation reads or mutates
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTarget {
    pub spreadsheet_id: String,
    pub range: String,
}

/// Wire shape of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub tool: String,
    pub action: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_state: Option<ExpectedState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<Box<OperationRequest>>,
}

/// A single call against the upstream API
///
/// Immutable once built; the fingerprint is computed at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "OperationRequest", into = "OperationRequest")]
pub struct Operation {
    tool: String,
    action: String,
    parameters: Value,
    expected_state: Option<ExpectedState>,
    compensation: Option<Box<Operation>>,
    fingerprint: Fingerprint,
}

impl Operation {
    pub fn new(tool: impl Into<String>, action: impl Into<String>, parameters: Value) -> Self {
        let tool = tool.into();
        let action = action.into();
        let fingerprint = Fingerprint::compute(&tool, &action, &parameters);
        Self { tool, action, parameters, expected_state: None, compensation: None, fingerprint }
    }

    /// Attach an optimistic-concurrency precondition
    #[must_use]
    pub fn with_expected_state(mut self, expected: ExpectedState) -> Self {
        self.expected_state = Some(expected);
        self
    }

    /// Attach an explicit inverse, used instead of prior-value capture when
    /// this operation has to be undone
    #[must_use]
    pub fn with_compensation(mut self, compensation: Operation) -> Self {
        self.compensation = Some(Box::new(compensation));
        self
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    pub fn expected_state(&self) -> Option<&ExpectedState> {
        self.expected_state.as_ref()
    }

    pub fn compensation(&self) -> Option<&Operation> {
        self.compensation.as_deref()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// `tool.action`, the key used by the action table
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.tool, self.action)
    }

    pub fn spreadsheet_id(&self) -> Option<&str> {
        self.string_parameter("spreadsheetId")
    }

    pub fn range(&self) -> Option<&str> {
        self.string_parameter("range")
    }

    /// Where this operation's state lives, if it can be resolved
    ///
    /// An expected-state range takes precedence over the `range` parameter.
    pub fn state_target(&self) -> Option<StateTarget> {
        let spreadsheet_id = self.spreadsheet_id()?;
        let range = self
            .expected_state
            .as_ref()
            .and_then(|expected| expected.range.as_deref())
            .or_else(|| self.range())?;
        Some(StateTarget { spreadsheet_id: spreadsheet_id.to_string(), range: range.to_string() })
    }

    fn string_parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

impl From<OperationRequest> for Operation {
    fn from(request: OperationRequest) -> Self {
        let mut operation = Operation::new(request.tool, request.action, request.parameters);
        operation.expected_state = request.expected_state;
        operation.compensation =
            request.compensation.map(|inverse| Box::new(Operation::from(*inverse)));
        operation
    }
}

impl From<Operation> for OperationRequest {
    fn from(operation: Operation) -> Self {
        Self {
            tool: operation.tool,
            action: operation.action,
            parameters: operation.parameters,
            expected_state: operation.expected_state,
            compensation: operation
                .compensation
                .map(|inverse| Box::new(OperationRequest::from(*inverse))),
        }
    }
}
