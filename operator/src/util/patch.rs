use super::MANAGER_NAME;
use kube::{
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
    Api, Client, Error, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use std::{clone::Clone, fmt::Debug};
use vpsie_types::*;

pub trait Object<S: Status> {
    /// Returns a mutable reference to the status object, initializing
    /// it with the default value if it does not exist.
    fn mut_status(&mut self) -> &mut S;
}

pub trait Status: Serialize {
    /// Sets the last updated timestamp to the given value.
    fn set_last_updated(&mut self, last_updated: String);
}

impl Object<NodeGroupStatus> for NodeGroup {
    fn mut_status(&mut self) -> &mut NodeGroupStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Status for NodeGroupStatus {
    fn set_last_updated(&mut self, last_updated: String) {
        self.last_updated = Some(last_updated);
    }
}

impl Object<VPSNodeStatus> for VPSNode {
    fn mut_status(&mut self) -> &mut VPSNodeStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Status for VPSNodeStatus {
    fn set_last_updated(&mut self, last_updated: String) {
        self.last_updated = Some(last_updated);
    }
}

/// Patch the resource's status object with the provided function.
/// The function is passed a mutable reference to the status object,
/// which is to be mutated in-place. Move closures are supported.
///
/// The patch is a merge-patch against the status subresource carrying
/// the observed `resourceVersion`, so a concurrent writer surfaces as a
/// 409 conflict instead of being overwritten. Callers treat a conflict
/// as a requeue signal, not an error.
pub async fn patch_status<
    S: Status,
    T: Clone + Resource + Object<S> + Serialize + DeserializeOwned + Debug,
>(
    client: Client,
    instance: &T,
    f: impl FnOnce(&mut S),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Resource<Scope = NamespaceResourceScope>,
{
    let mut modified = instance.clone();
    {
        let status = modified.mut_status();
        f(status);
        status.set_last_updated(chrono::Utc::now().to_rfc3339());
    }
    let body = json!({
        "metadata": {
            "resourceVersion": instance.resource_version(),
        },
        "status": serde_json::to_value(modified.mut_status())
            .map_err(kube::Error::SerdeError)?,
    });
    let name = instance.meta().name.as_deref().unwrap();
    let namespace = instance.meta().namespace.as_deref().unwrap();
    let api: Api<T> = Api::namespaced(client, namespace);
    api.patch_status(name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(&body))
        .await
}
