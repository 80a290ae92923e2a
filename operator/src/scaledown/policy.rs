use chrono::{DateTime, Timelike, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::time::Duration;

use crate::util::{ALLOWED_HOURS_ANNOTATION, SCALE_DOWN_DISABLED_ANNOTATION};

/// Outcome of a policy evaluation.
#[derive(Clone, Debug, PartialEq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
}

impl PolicyDecision {
    fn deny(reason: impl Into<String>) -> Self {
        PolicyDecision::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// Global policy configuration.
#[derive(Clone, Debug)]
pub struct PolicyConfig {
    /// Minimum interval between successive scale-downs on the same
    /// node group.
    pub cooldown: Duration,

    /// Optional global window (minutes since midnight, inclusive start,
    /// inclusive end) outside of which scale-down is denied.
    pub global_window: Option<(u32, u32)>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            cooldown: Duration::from_secs(600),
            global_window: None,
        }
    }
}

/// Time-window and annotation-based gating of scale-down intent. The
/// engine never sleeps; it answers yes or no for the given instant.
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        PolicyEngine { config }
    }

    pub fn evaluate(
        &self,
        node: &Node,
        last_scale: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PolicyDecision {
        if node
            .annotations()
            .get(SCALE_DOWN_DISABLED_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false)
        {
            return PolicyDecision::deny("scale-down disabled by annotation");
        }

        let minute_of_day = now.hour() * 60 + now.minute();
        if let Some(window) = node.annotations().get(ALLOWED_HOURS_ANNOTATION) {
            match parse_window(window) {
                Some((start, end)) => {
                    if !within_window(minute_of_day, start, end) {
                        return PolicyDecision::deny(format!(
                            "outside allowed hours {}",
                            window
                        ));
                    }
                }
                None => {
                    // Invalid values fail open so a typo cannot pin a
                    // node forever.
                    tracing::warn!(
                        node = %node.name_any(),
                        value = %window,
                        "ignoring unparseable scale-down window annotation"
                    );
                }
            }
        }

        if let Some((start, end)) = self.config.global_window {
            if !within_window(minute_of_day, start, end) {
                return PolicyDecision::deny("outside the configured maintenance window");
            }
        }

        if let Some(last) = last_scale {
            let elapsed = now.signed_duration_since(last);
            let cooldown = chrono::Duration::from_std(self.config.cooldown)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
            if elapsed < cooldown {
                return PolicyDecision::deny(format!(
                    "cooldown active for another {}s",
                    (cooldown - elapsed).num_seconds().max(0)
                ));
            }
        }

        PolicyDecision::Allow
    }
}

/// Parses `HH:MM-HH:MM` into minutes since midnight.
pub(crate) fn parse_window(value: &str) -> Option<(u32, u32)> {
    let (start, end) = value.split_once('-')?;
    Some((parse_hhmm(start.trim())?, parse_hhmm(end.trim())?))
}

fn parse_hhmm(value: &str) -> Option<u32> {
    let (hours, minutes) = value.split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// Inclusive window membership with overnight wrap-around: a window
/// whose end precedes its start covers midnight.
pub(crate) fn within_window(minute_of_day: u32, start: u32, end: u32) -> bool {
    if start <= end {
        minute_of_day >= start && minute_of_day <= end
    } else {
        minute_of_day >= start || minute_of_day <= end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn node_with_annotations(annotations: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("worker-1".to_owned()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn at(time: &str) -> DateTime<Utc> {
        format!("2026-03-02T{}:00Z", time).parse().unwrap()
    }

    fn engine() -> PolicyEngine {
        PolicyEngine::new(PolicyConfig::default())
    }

    #[test]
    fn disabled_annotation_is_a_hard_block() {
        let node = node_with_annotations(&[(SCALE_DOWN_DISABLED_ANNOTATION, "true")]);
        assert!(!engine().evaluate(&node, None, at("12:00")).is_allowed());
    }

    #[test]
    fn allowed_hours_gate_the_decision() {
        let node = node_with_annotations(&[(ALLOWED_HOURS_ANNOTATION, "09:00-17:00")]);
        assert!(engine().evaluate(&node, None, at("12:00")).is_allowed());
        assert!(!engine().evaluate(&node, None, at("18:30")).is_allowed());
        assert!(engine().evaluate(&node, None, at("09:00")).is_allowed());
        assert!(engine().evaluate(&node, None, at("17:00")).is_allowed());
    }

    #[test]
    fn overnight_windows_wrap_midnight() {
        let node = node_with_annotations(&[(ALLOWED_HOURS_ANNOTATION, "22:00-06:00")]);
        assert!(engine().evaluate(&node, None, at("23:30")).is_allowed());
        assert!(engine().evaluate(&node, None, at("02:00")).is_allowed());
        assert!(!engine().evaluate(&node, None, at("12:00")).is_allowed());
    }

    #[test]
    fn invalid_windows_fail_open() {
        for bad in ["garbage", "25:00-26:00", "09:61-10:00", "09:00"] {
            let node = node_with_annotations(&[(ALLOWED_HOURS_ANNOTATION, bad)]);
            assert!(
                engine().evaluate(&node, None, at("03:00")).is_allowed(),
                "window {:?} should fail open",
                bad
            );
        }
    }

    #[test]
    fn cooldown_defers_repeat_scale_downs() {
        let node = node_with_annotations(&[]);
        let last = at("11:55");
        assert!(!engine().evaluate(&node, Some(last), at("12:00")).is_allowed());
        assert!(engine().evaluate(&node, Some(last), at("12:10")).is_allowed());
    }

    #[test]
    fn global_window_applies_without_annotations() {
        let engine = PolicyEngine::new(PolicyConfig {
            cooldown: Duration::from_secs(0),
            global_window: Some((60, 120)),
        });
        let node = node_with_annotations(&[]);
        assert!(engine.evaluate(&node, None, at("01:30")).is_allowed());
        assert!(!engine.evaluate(&node, None, at("03:00")).is_allowed());
    }
}
