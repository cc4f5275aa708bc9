//! Access to the target's scale subresource and the autoscaler object.
//!
//! The scale target is referenced by group/kind; candidate API resources
//! are resolved through discovery and tried in turn until one serves the
//! scale subresource, mirroring how ambiguous group-kinds are handled by
//! the orchestrator itself.

use async_trait::async_trait;
use k8s_openapi::api::autoscaling::v1::Scale;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::{self, ApiResource};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use tidemark_common::crd::{WatermarkAutoscaler, WatermarkAutoscalerSpec, WatermarkAutoscalerStatus};
use tidemark_common::{Error, FIELD_MANAGER};

/// Identity of the workload whose scale subresource is manipulated
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScaleTarget {
    /// Namespace of the workload
    pub namespace: String,
    /// Name of the workload
    pub name: String,
    /// API version from the scale target reference (e.g. "apps/v1")
    pub api_version: String,
    /// Kind from the scale target reference (e.g. "Deployment")
    pub kind: String,
}

impl ScaleTarget {
    /// Build the target referenced by an autoscaler
    pub fn from_autoscaler(wma: &WatermarkAutoscaler) -> Self {
        Self {
            namespace: wma.namespace().unwrap_or_default(),
            name: wma.spec.scale_target_ref.name.clone(),
            api_version: wma.spec.scale_target_ref.api_version.clone(),
            kind: wma.spec.scale_target_ref.kind.clone(),
        }
    }
}

/// Read/write access to the target's scale subresource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScaleClient: Send + Sync {
    /// Fetch the current scale of the target
    async fn get_scale(&self, target: &ScaleTarget) -> Result<Scale, Error>;

    /// Write a new replica count to the target's scale subresource
    async fn update_replicas(&self, target: &ScaleTarget, replicas: i32) -> Result<Scale, Error>;
}

/// Write access to the autoscaler object itself
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AutoscalerClient: Send + Sync {
    /// Patch the status subresource
    async fn patch_status(
        &self,
        wma: &WatermarkAutoscaler,
        status: &WatermarkAutoscalerStatus,
    ) -> Result<(), Error>;

    /// Persist a defaulted spec back onto the object
    async fn apply_defaults(
        &self,
        wma: &WatermarkAutoscaler,
        spec: &WatermarkAutoscalerSpec,
    ) -> Result<(), Error>;
}

/// Production scale client resolving targets through API discovery
pub struct KubeScaleClient {
    client: Client,
}

impl KubeScaleClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Resolve the candidate API resources for the target's group-kind.
    ///
    /// The version named in the target reference is tried first, then the
    /// remaining versions the API server advertises for the group.
    async fn candidate_apis(&self, target: &ScaleTarget) -> Result<Vec<Api<DynamicObject>>, Error> {
        let (group, preferred_version) = parse_group_version(&target.api_version);
        let apigroup = discovery::group(&self.client, group).await.map_err(|e| {
            Error::scale_resolution(&target.kind, format!("discovery for group {group:?}: {e}"))
        })?;

        let mut versions: Vec<String> = Vec::new();
        if !preferred_version.is_empty() {
            versions.push(preferred_version.to_string());
        }
        for version in apigroup.versions() {
            if !versions.iter().any(|v| v == version) {
                versions.push(version.to_string());
            }
        }

        let mut resources: Vec<ApiResource> = Vec::new();
        for version in &versions {
            for (resource, _caps) in apigroup.versioned_resources(version) {
                if resource.kind == target.kind
                    && !resources.iter().any(|r| r.version == resource.version)
                {
                    resources.push(resource);
                }
            }
        }
        if resources.is_empty() {
            return Err(Error::scale_resolution(
                &target.kind,
                format!(
                    "no API resource for group {group:?} kind {:?}",
                    target.kind
                ),
            ));
        }

        Ok(resources
            .iter()
            .map(|resource| {
                Api::namespaced_with(self.client.clone(), &target.namespace, resource)
            })
            .collect())
    }
}

#[async_trait]
impl ScaleClient for KubeScaleClient {
    async fn get_scale(&self, target: &ScaleTarget) -> Result<Scale, Error> {
        let apis = self.candidate_apis(target).await?;
        let tried = apis.len();
        let mut not_found = 0;
        let mut errors = Vec::new();
        for api in apis {
            match api.get_scale(&target.name).await {
                Ok(scale) => return Ok(scale),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    not_found += 1;
                    errors.push(ae.message);
                }
                Err(e) => errors.push(e.to_string()),
            }
        }
        if not_found == tried {
            return Err(Error::TargetNotFound {
                kind: target.kind.clone(),
                name: target.name.clone(),
            });
        }
        Err(Error::scale_resolution(&target.kind, errors.join("; ")))
    }

    async fn update_replicas(&self, target: &ScaleTarget, replicas: i32) -> Result<Scale, Error> {
        let patch = serde_json::json!({"spec": {"replicas": replicas}});
        let apis = self.candidate_apis(target).await?;
        let mut errors = Vec::new();
        for api in apis {
            match api
                .patch_scale(
                    &target.name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(&patch),
                )
                .await
            {
                Ok(scale) => return Ok(scale),
                Err(e) => errors.push(e.to_string()),
            }
        }
        Err(Error::scale_resolution(&target.kind, errors.join("; ")))
    }
}

/// Production autoscaler client using merge patches
pub struct KubeAutoscalerClient {
    client: Client,
}

impl KubeAutoscalerClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, wma: &WatermarkAutoscaler) -> Api<WatermarkAutoscaler> {
        Api::namespaced(self.client.clone(), &wma.namespace().unwrap_or_default())
    }
}

#[async_trait]
impl AutoscalerClient for KubeAutoscalerClient {
    async fn patch_status(
        &self,
        wma: &WatermarkAutoscaler,
        status: &WatermarkAutoscalerStatus,
    ) -> Result<(), Error> {
        self.api_for(wma)
            .patch_status(
                &wma.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&serde_json::json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    async fn apply_defaults(
        &self,
        wma: &WatermarkAutoscaler,
        spec: &WatermarkAutoscalerSpec,
    ) -> Result<(), Error> {
        self.api_for(wma)
            .patch(
                &wma.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&serde_json::json!({ "spec": spec })),
            )
            .await?;
        Ok(())
    }
}

fn parse_group_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        // core group resources use a bare version ("v1")
        None => ("", api_version),
    }
}
