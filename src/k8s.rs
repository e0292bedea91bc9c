//! Cluster API adapter: the set of Kubernetes operations the remediation
//! engine needs, behind an abstract trait, plus a `kube`-crate backed
//! implementation covering `Pod`, `Deployment`, `ReplicaSet`, `Namespace`,
//! and `Event`.

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Event, Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::error::ClusterApiError;

/// Minimal pod owner-chain fact needed by `resolve_owning_deployment`: a
/// `ReplicaSet`'s name and its own owner references.
#[derive(Debug, Clone)]
pub struct ReplicaSetOwnerInfo {
    pub name: String,
    pub owner_references: Vec<OwnerReference>,
}

/// Pure data traversal: pod → owning `ReplicaSet` → owning `Deployment`,
/// isolated from the cluster client so it can be unit tested against
/// synthesized owner graphs.
#[must_use]
pub fn resolve_owning_deployment(
    pod_owner_references: &[OwnerReference],
    replicasets: &[ReplicaSetOwnerInfo],
) -> Option<String> {
    let rs_name = pod_owner_references
        .iter()
        .find(|o| o.kind == "ReplicaSet")?
        .name
        .clone();

    let rs = replicasets.iter().find(|rs| rs.name == rs_name)?;
    rs.owner_references
        .iter()
        .find(|o| o.kind == "Deployment")
        .map(|o| o.name.clone())
}

/// The set of Kubernetes operations required by the remediation engine and
/// dashboard. Implementations must tolerate cluster-API unavailability by
/// surfacing `ClusterApiError::Unavailable` rather than panicking.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterApiError>;
    async fn list_pods(&self, namespace: &str, label_selector: Option<&str>)
        -> Result<Vec<Pod>, ClusterApiError>;
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_secs: u32,
    ) -> Result<(), ClusterApiError>;

    async fn get_deployment_replicas(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<i32, ClusterApiError>;
    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ClusterApiError>;
    async fn patch_deployment_rollback(
        &self,
        namespace: &str,
        name: &str,
        to_revision: u64,
    ) -> Result<(), ClusterApiError>;

    async fn list_replicasets(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<ReplicaSetOwnerInfo>, ClusterApiError>;

    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterApiError>;
    async fn list_events(&self, namespace: &str) -> Result<Vec<Event>, ClusterApiError>;

    /// Pod → ReplicaSet → Deployment resolution, driving
    /// `list_pods`/`list_replicasets` and the pure
    /// `resolve_owning_deployment` traversal.
    async fn resolve_deployment_for_pod(
        &self,
        namespace: &str,
        pod_name: &str,
    ) -> Result<String, ClusterApiError> {
        let pod = self.get_pod(namespace, pod_name).await?;
        let owner_refs = pod
            .metadata
            .owner_references
            .clone()
            .unwrap_or_default();
        let replicasets = self.list_replicasets(namespace, None).await?;
        resolve_owning_deployment(&owner_refs, &replicasets).ok_or_else(|| {
            ClusterApiError::OwnerResolution {
                pod: pod_name.to_string(),
                reason: "no ReplicaSet/Deployment owner chain found".to_string(),
            }
        })
    }
}

/// Authentication mode: either an in-cluster service account or a
/// kubeconfig file. Both must be supported.
pub enum ClusterAuth {
    InCluster,
    Kubeconfig(std::path::PathBuf),
}

/// `kube`-crate backed `ClusterApi`.
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// # Errors
    /// Returns `ClusterApiError::Unavailable` if neither in-cluster config
    /// nor the provided kubeconfig can be loaded. Callers should treat this
    /// as "remediation disabled" rather than a fatal startup error.
    pub async fn connect(auth: ClusterAuth) -> Result<Self, ClusterApiError> {
        let client = match auth {
            ClusterAuth::InCluster => Client::try_default()
                .await
                .map_err(|e| ClusterApiError::Unavailable(e.to_string()))?,
            ClusterAuth::Kubeconfig(path) => {
                let kubeconfig = Kubeconfig::read_from(&path)
                    .map_err(|e| ClusterApiError::Unavailable(e.to_string()))?;
                let config = kube::Config::from_custom_kubeconfig(
                    kubeconfig,
                    &KubeConfigOptions::default(),
                )
                .await
                .map_err(|e| ClusterApiError::Unavailable(e.to_string()))?;
                Client::try_from(config)
                    .map_err(|e| ClusterApiError::Unavailable(e.to_string()))?
            }
        };
        Ok(Self { client })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn replicasets(&self, namespace: &str) -> Api<k8s_openapi::api::apps::v1::ReplicaSet> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_kube_error(e: kube::Error) -> ClusterApiError {
    match &e {
        kube::Error::Api(ae) if ae.code == 404 => ClusterApiError::NotFound(ae.message.clone()),
        _ => ClusterApiError::Kube(e.to_string()),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterApiError> {
        self.pods(namespace).get(name).await.map_err(map_kube_error)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Pod>, ClusterApiError> {
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let list = self
            .pods(namespace)
            .list(&lp)
            .await
            .map_err(map_kube_error)?;
        Ok(list.items)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_secs: u32,
    ) -> Result<(), ClusterApiError> {
        let dp = DeleteParams {
            grace_period_seconds: Some(grace_period_secs),
            ..Default::default()
        };
        self.pods(namespace)
            .delete(name, &dp)
            .await
            .map_err(map_kube_error)?;
        info!(namespace, pod = name, "deleted pod");
        Ok(())
    }

    async fn get_deployment_replicas(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<i32, ClusterApiError> {
        let deployment = self
            .deployments(namespace)
            .get(name)
            .await
            .map_err(map_kube_error)?;
        Ok(deployment
            .spec
            .and_then(|s| s.replicas)
            .unwrap_or(0))
    }

    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ClusterApiError> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.deployments(namespace)
            .patch(
                name,
                &PatchParams::apply("kube-sentinel"),
                &Patch::Merge(patch),
            )
            .await
            .map_err(map_kube_error)?;
        info!(namespace, deployment = name, replicas, "scaled deployment");
        Ok(())
    }

    async fn patch_deployment_rollback(
        &self,
        namespace: &str,
        name: &str,
        to_revision: u64,
    ) -> Result<(), ClusterApiError> {
        // `0` means "previous revision": rolling back is expressed as a
        // rollback annotation understood by the deployment controller.
        let patch = json!({
            "metadata": {
                "annotations": {
                    "deployment.kubernetes.io/revision-to-rollback": to_revision.to_string()
                }
            }
        });
        self.deployments(namespace)
            .patch(
                name,
                &PatchParams::apply("kube-sentinel"),
                &Patch::Merge(patch),
            )
            .await
            .map_err(map_kube_error)?;
        warn!(namespace, deployment = name, to_revision, "patched deployment rollback");
        Ok(())
    }

    async fn list_replicasets(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<ReplicaSetOwnerInfo>, ClusterApiError> {
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let list = self
            .replicasets(namespace)
            .list(&lp)
            .await
            .map_err(map_kube_error)?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|rs| {
                let name = rs.metadata.name?;
                let owner_references = rs.metadata.owner_references.unwrap_or_default();
                Some(ReplicaSetOwnerInfo {
                    name,
                    owner_references,
                })
            })
            .collect())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterApiError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.map_err(map_kube_error)?;
        Ok(list.items.into_iter().filter_map(|ns| ns.metadata.name).collect())
    }

    async fn list_events(&self, namespace: &str) -> Result<Vec<Event>, ClusterApiError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await.map_err(map_kube_error)?;
        Ok(list.items)
    }
}

/// Synthesize a label selector of the form `key=value,...` from a label
/// map, for use with `list_pods`/`list_replicasets`.
#[must_use]
pub fn label_selector(labels: &HashMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
