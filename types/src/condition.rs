use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single observation about the state of a resource, mirroring the
/// shape of `metav1.Condition`. Stored in the status of both
/// [`NodeGroup`](crate::NodeGroup) and [`VPSNode`](crate::VPSNode).
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Condition {
    /// Type of the condition, e.g. `Ready` or `Scaling`.
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: `True`, `False` or `Unknown`.
    pub status: String,

    /// Machine-readable reason for the last transition.
    pub reason: Option<String>,

    /// Human-readable details about the last transition.
    pub message: Option<String>,

    /// RFC3339 timestamp of the last transition.
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    /// Builds a condition with the transition time set to now.
    pub fn new(type_: &str, status: bool, reason: &str, message: &str) -> Self {
        Condition {
            type_: type_.to_owned(),
            status: if status { "True" } else { "False" }.to_owned(),
            reason: Some(reason.to_owned()),
            message: Some(message.to_owned()),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// Returns true if the condition's status is `True`.
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Replaces the condition with the same type in `conditions`, preserving
/// the previous transition time when the status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let unchanged = existing.status == condition.status;
            let last_transition_time = existing.last_transition_time.clone();
            *existing = condition;
            if unchanged {
                existing.last_transition_time = last_transition_time;
            }
        }
        None => conditions.push(condition),
    }
}

/// Returns the condition with the given type, if present.
pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_condition_replaces_by_type() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, Condition::new("Ready", false, "Init", ""));
        set_condition(&mut conditions, Condition::new("Scaling", true, "Up", ""));
        set_condition(&mut conditions, Condition::new("Ready", true, "AllNodesReady", ""));
        assert_eq!(conditions.len(), 2);
        assert!(get_condition(&conditions, "Ready").unwrap().is_true());
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let mut conditions = Vec::new();
        let mut first = Condition::new("Ready", true, "AllNodesReady", "");
        first.last_transition_time = Some("2026-01-01T00:00:00+00:00".to_owned());
        set_condition(&mut conditions, first);
        set_condition(&mut conditions, Condition::new("Ready", true, "AllNodesReady", "still fine"));
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2026-01-01T00:00:00+00:00")
        );
        assert_eq!(conditions[0].message.as_deref(), Some("still fine"));
    }
}
