//! Browser capabilities and new-session payloads
//!
//! A capability set is an open mapping from string keys to JSON values
//! describing a browser kind. Matching is asymmetric: a slot's *stereotype*
//! matches a *requested* set iff every key the request names is present in
//! the stereotype with an equal value. Extra stereotype keys are allowed;
//! the scheduler never interprets what the keys mean.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// An open set of browser capabilities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(Map<String, Value>);

impl Capabilities {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Add a capability, builder style
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Does this stereotype satisfy `requested`?
    ///
    /// Every key present in the request must be present here with an equal
    /// value. A key missing from the stereotype is a mismatch; extra
    /// stereotype keys are fine.
    pub fn matches(&self, requested: &Capabilities) -> bool {
        requested
            .0
            .iter()
            .all(|(key, value)| self.0.get(key) == Some(value))
    }

    /// Merge `other` on top of this set, failing on conflicting values.
    ///
    /// Used to combine `alwaysMatch` with each `firstMatch` entry, and to
    /// compute the negotiated capabilities of a started session.
    pub fn merged_with(&self, other: &Capabilities) -> Result<Capabilities, CapabilityError> {
        let mut merged = self.0.clone();
        for (key, value) in &other.0 {
            match merged.get(key) {
                Some(existing) if existing != value => {
                    return Err(CapabilityError::ConflictingKey(key.clone()));
                }
                _ => {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(Capabilities(merged))
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

impl From<Map<String, Value>> for Capabilities {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Errors raised while interpreting capability payloads
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("firstMatch entry conflicts with alwaysMatch on key '{0}'")]
    ConflictingKey(String),

    #[error("payload contains no capability alternatives")]
    Empty,
}

/// Wire payload of a new-session request
///
/// `{"capabilities": {"alwaysMatch": {...}, "firstMatch": [{...}, ...]}}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSessionPayload {
    pub capabilities: CapabilityRequest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityRequest {
    #[serde(default, rename = "alwaysMatch")]
    pub always_match: Capabilities,

    #[serde(default, rename = "firstMatch")]
    pub first_match: Vec<Capabilities>,
}

impl NewSessionPayload {
    /// Build a payload with a single desired capability set
    pub fn single(capabilities: Capabilities) -> Self {
        Self {
            capabilities: CapabilityRequest {
                always_match: capabilities,
                first_match: Vec::new(),
            },
        }
    }

    /// Expand the payload into its desired-capability alternatives: the
    /// cartesian merge of `alwaysMatch` with each `firstMatch` entry, in
    /// `firstMatch` order. An absent `firstMatch` yields `alwaysMatch`
    /// alone.
    pub fn alternatives(&self) -> Result<Vec<Capabilities>, CapabilityError> {
        let always = &self.capabilities.always_match;
        if self.capabilities.first_match.is_empty() {
            if always.is_empty() {
                return Err(CapabilityError::Empty);
            }
            return Ok(vec![always.clone()]);
        }

        self.capabilities
            .first_match
            .iter()
            .map(|first| always.merged_with(first))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn caps(value: Value) -> Capabilities {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_matching_is_asymmetric() {
        let stereotype = Capabilities::new()
            .with("browserName", "firefox")
            .with("platformName", "linux");
        let requested = Capabilities::new().with("browserName", "firefox");

        // Extra stereotype keys are allowed
        assert!(stereotype.matches(&requested));
        // But the reverse does not hold: the stereotype asks for a platform
        assert!(!requested.matches(&stereotype));
    }

    #[test]
    fn test_missing_key_is_a_mismatch() {
        let stereotype = Capabilities::new().with("browserName", "firefox");
        let requested = Capabilities::new()
            .with("browserName", "firefox")
            .with("platformName", "linux");

        assert!(!stereotype.matches(&requested));
    }

    #[test]
    fn test_unequal_value_is_a_mismatch() {
        let stereotype = Capabilities::new().with("browserName", "firefox");
        let requested = Capabilities::new().with("browserName", "chrome");

        assert!(!stereotype.matches(&requested));
    }

    #[test]
    fn test_empty_request_matches_anything() {
        let stereotype = Capabilities::new().with("browserName", "firefox");
        assert!(stereotype.matches(&Capabilities::new()));
    }

    #[test]
    fn test_alternatives_merges_always_with_first_match() {
        let payload: NewSessionPayload = serde_json::from_value(json!({
            "capabilities": {
                "alwaysMatch": {"acceptInsecureCerts": true},
                "firstMatch": [
                    {"browserName": "chrome"},
                    {"browserName": "firefox"}
                ]
            }
        }))
        .unwrap();

        let alts = payload.alternatives().unwrap();
        assert_eq!(alts.len(), 2);
        assert_eq!(alts[0].get("browserName"), Some(&json!("chrome")));
        assert_eq!(alts[0].get("acceptInsecureCerts"), Some(&json!(true)));
        assert_eq!(alts[1].get("browserName"), Some(&json!("firefox")));
    }

    #[test]
    fn test_alternatives_without_first_match() {
        let payload = NewSessionPayload::single(caps(json!({"browserName": "chrome"})));
        let alts = payload.alternatives().unwrap();
        assert_eq!(alts.len(), 1);
        assert_eq!(alts[0].get("browserName"), Some(&json!("chrome")));
    }

    #[test]
    fn test_alternatives_rejects_conflicts() {
        let payload: NewSessionPayload = serde_json::from_value(json!({
            "capabilities": {
                "alwaysMatch": {"browserName": "chrome"},
                "firstMatch": [{"browserName": "firefox"}]
            }
        }))
        .unwrap();

        assert_eq!(
            payload.alternatives(),
            Err(CapabilityError::ConflictingKey("browserName".to_string()))
        );
    }

    #[test]
    fn test_alternatives_rejects_empty_payload() {
        let payload = NewSessionPayload::default();
        assert_eq!(payload.alternatives(), Err(CapabilityError::Empty));
    }

    #[test]
    fn test_serde_round_trip() {
        let original = Capabilities::new()
            .with("browserName", "edge")
            .with("se:downloadsEnabled", true);
        let json = serde_json::to_string(&original).unwrap();
        let parsed: Capabilities = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }
}
