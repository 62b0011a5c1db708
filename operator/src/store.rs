//! Access to the Extension and Cluster resources.
//!
//! The [`ExtensionStore`] trait exposes raw, version-guarded writes; the free
//! functions of this module layer the conflict handling on top of them: on a
//! 409 the object is read again and the change is applied to the fresh copy.
use crate::{Error, Result};
use async_trait::async_trait;
use common::{Cluster, Extension, ExtensionStatus, OPERATION_ANNOTATION};
use kube::{
    api::{Api, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::json;
use tracing::debug;

/// Attempts made on a write before giving up on conflicts
pub const MAX_CONFLICT_RETRIES: usize = 5;

#[async_trait]
pub trait ExtensionStore: Send + Sync {
    async fn get_extension(&self, namespace: &str, name: &str) -> Result<Option<Extension>>;

    /// Write the status, guarded by the resourceVersion of `ext`
    async fn update_status(&self, ext: &Extension, status: &ExtensionStatus) -> Result<Extension>;

    /// Replace the finalizer list, guarded by the resourceVersion of `ext`
    async fn update_finalizers(&self, ext: &Extension, finalizers: Vec<String>) -> Result<Extension>;

    /// Drop the operation annotation without any version guard
    async fn clear_operation(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>>;
}

pub struct KubeExtensionStore {
    client: Client,
}

impl KubeExtensionStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Extension> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(common::context::get_client_name()),
        ..PatchParams::default()
    }
}

#[async_trait]
impl ExtensionStore for KubeExtensionStore {
    async fn get_extension(&self, namespace: &str, name: &str) -> Result<Option<Extension>> {
        self.api(namespace).get_opt(name).await.map_err(Error::KubeError)
    }

    async fn update_status(&self, ext: &Extension, status: &ExtensionStatus) -> Result<Extension> {
        let ns = ext.namespace().unwrap_or_default();
        let patch = json!({
            "metadata": { "resourceVersion": ext.resource_version() },
            "status": status,
        });
        self.api(&ns)
            .patch_status(&ext.name_any(), &patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, &object_key(ext)))
    }

    async fn update_finalizers(&self, ext: &Extension, finalizers: Vec<String>) -> Result<Extension> {
        let ns = ext.namespace().unwrap_or_default();
        let patch = json!({
            "metadata": {
                "resourceVersion": ext.resource_version(),
                "finalizers": finalizers,
            },
        });
        self.api(&ns)
            .patch(&ext.name_any(), &patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(e, &object_key(ext)))
    }

    async fn clear_operation(&self, namespace: &str, name: &str) -> Result<()> {
        let patch = json!({
            "metadata": { "annotations": { OPERATION_ANNOTATION: null } },
        });
        self.api(namespace)
            .patch(name, &patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>> {
        Api::<Cluster>::all(self.client.clone())
            .get_opt(name)
            .await
            .map_err(Error::KubeError)
    }
}

/// `namespace/name` of an object, the key of the work queue
#[must_use]
pub fn object_key(ext: &Extension) -> String {
    format!("{}/{}", ext.namespace().unwrap_or_default(), ext.name_any())
}

async fn reread(store: &dyn ExtensionStore, ext: &Extension) -> Result<Option<Extension>> {
    debug!("conflict on {}, reading it again", object_key(ext));
    store
        .get_extension(&ext.namespace().unwrap_or_default(), &ext.name_any())
        .await
}

/// Apply `mutate` on the status of `ext` and write it back
pub async fn write_status<F>(store: &dyn ExtensionStore, ext: &Extension, mutate: F) -> Result<Extension>
where
    F: Fn(&mut ExtensionStatus) + Send + Sync,
{
    let mut current = ext.clone();
    for _ in 0..MAX_CONFLICT_RETRIES {
        let mut status = current.status.clone().unwrap_or_default();
        mutate(&mut status);
        match store.update_status(&current, &status).await {
            Err(Error::Conflict(_)) => {
                current = reread(store, &current)
                    .await?
                    .ok_or_else(|| Error::NotFound(object_key(ext)))?;
            }
            res => return res,
        }
    }
    Err(Error::Conflict(object_key(ext)))
}

/// Make sure `finalizer` is set; returns the updated object
pub async fn add_finalizer(store: &dyn ExtensionStore, ext: &Extension, finalizer: &str) -> Result<Extension> {
    let mut current = ext.clone();
    for _ in 0..MAX_CONFLICT_RETRIES {
        if current.has_finalizer(finalizer) {
            return Ok(current);
        }
        let mut finalizers = current.finalizers().to_vec();
        finalizers.push(finalizer.to_string());
        match store.update_finalizers(&current, finalizers).await {
            Err(Error::Conflict(_)) => {
                current = reread(store, &current)
                    .await?
                    .ok_or_else(|| Error::NotFound(object_key(ext)))?;
            }
            res => return res,
        }
    }
    Err(Error::Conflict(object_key(ext)))
}

/// Remove `finalizer`; an object already gone counts as done
pub async fn remove_finalizer(store: &dyn ExtensionStore, ext: &Extension, finalizer: &str) -> Result<()> {
    let mut current = ext.clone();
    for _ in 0..MAX_CONFLICT_RETRIES {
        if !current.has_finalizer(finalizer) {
            return Ok(());
        }
        let finalizers = current
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        match store.update_finalizers(&current, finalizers).await {
            Ok(_) | Err(Error::NotFound(_)) => return Ok(()),
            Err(Error::Conflict(_)) => match reread(store, &current).await? {
                Some(fresh) => current = fresh,
                None => return Ok(()),
            },
            Err(e) => return Err(e),
        }
    }
    Err(Error::Conflict(object_key(ext)))
}
