use kube::{
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client, Resource,
};

use super::MANAGER_NAME;

/// Builds an event recorder publishing against the given resource.
pub fn recorder<T>(client: Client, instance: &T) -> Recorder
where
    T: Resource<DynamicType = ()>,
{
    let reporter = Reporter {
        controller: MANAGER_NAME.into(),
        instance: None,
    };
    Recorder::new(client, reporter, instance.object_ref(&()))
}

/// Publishes a Normal event. Failures to record are logged and
/// swallowed; events are best-effort.
pub async fn normal(recorder: &Recorder, action: &str, reason: &str, note: String) {
    publish(recorder, EventType::Normal, action, reason, note).await
}

/// Publishes a Warning event. Failures to record are logged and
/// swallowed; events are best-effort.
pub async fn warning(recorder: &Recorder, action: &str, reason: &str, note: String) {
    publish(recorder, EventType::Warning, action, reason, note).await
}

async fn publish(recorder: &Recorder, type_: EventType, action: &str, reason: &str, note: String) {
    let event = Event {
        type_,
        reason: reason.to_owned(),
        note: Some(note),
        action: action.to_owned(),
        secondary: None,
    };
    if let Err(err) = recorder.publish(event).await {
        tracing::warn!(%reason, error = %err, "failed to publish event");
    }
}
