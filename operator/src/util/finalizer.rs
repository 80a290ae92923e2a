use kube::{
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
    Api, Client, Error, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::{clone::Clone, fmt::Debug};

/// Adds the named finalizer to a `T` kind of resource. If the finalizer
/// is already present this action has no effect.
pub async fn add<T: Clone + Resource + Serialize + DeserializeOwned + Debug>(
    client: Client,
    name: &str,
    namespace: &str,
    finalizer: &str,
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Resource<Scope = NamespaceResourceScope>,
{
    let api: Api<T> = Api::namespaced(client, namespace);
    let current = api.get(name).await?;
    let mut finalizers = current.finalizers().to_vec();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(current);
    }
    finalizers.push(finalizer.to_owned());
    let patch: Value = json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
}

/// Removes the named finalizer from a `T` resource, leaving any other
/// finalizers in place. If the finalizer is absent this has no effect.
pub async fn remove<T: Clone + Resource + Serialize + DeserializeOwned + Debug>(
    client: Client,
    name: &str,
    namespace: &str,
    finalizer: &str,
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Resource<Scope = NamespaceResourceScope>,
{
    let api: Api<T> = Api::namespaced(client, namespace);
    let current = api.get(name).await?;
    let finalizers: Vec<String> = current
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    let patch: Value = json!({
        "metadata": {
            "finalizers": if finalizers.is_empty() { Value::Null } else { json!(finalizers) }
        }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
}
