//! The cluster seam
//!
//! Everything the controller needs from Kubernetes goes through the
//! [`Orchestrator`] trait so the lifecycle logic can be exercised against a
//! fake. [`KubeOrchestrator`] is the kube-rs implementation.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams, PostParams,
};
use kube::Client;
use serde_json::Value;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use kuberun_common::kube_utils::{
    build_api_resource, create_client, load_kubeconfig, resolve_api_resource, resolve_kubeconfig,
    resolve_namespace,
};
use kuberun_common::{Error, FIELD_MANAGER};

use crate::quota::{QuotaExceeded, QUOTA_MARKER};
use crate::run::{PodPhase, PodView, TypeRef};

/// Why the orchestrator refused to create a workload
#[derive(Debug)]
pub enum Rejection {
    /// The namespace's resource quota would be exceeded
    Quota(QuotaExceeded),
    /// Any other refusal
    Other(String),
}

impl Rejection {
    /// Quota rejections that could still fit are worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Quota(q) if q.is_satisfiable())
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Quota(q) => write!(f, "{}", q),
            Self::Other(msg) => f.write_str(msg),
        }
    }
}

impl From<kube::Error> for Rejection {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(ae) if ae.code == 403 && ae.message.contains(QUOTA_MARKER) => {
                match QuotaExceeded::parse(&ae.message) {
                    Some(quota) => Self::Quota(quota),
                    None => Self::Other(ae.message.clone()),
                }
            }
            kube::Error::Api(ae) => Self::Other(ae.message.clone()),
            _ => Self::Other(e.to_string()),
        }
    }
}

/// An object (or set of objects) to delete during teardown
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeleteTarget {
    /// A single object by name
    Named {
        /// Object type
        type_ref: TypeRef,
        /// Object name
        name: String,
    },
    /// Every object of a type matching a label selector
    Labelled {
        /// Object type
        type_ref: TypeRef,
        /// Label selector (e.g., "run=abc123")
        selector: String,
    },
}

impl fmt::Display for DeleteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named { type_ref, name } => write!(f, "{} {}", type_ref.kind, name),
            Self::Labelled { type_ref, selector } => {
                write!(f, "{} objects matching {}", type_ref.kind, selector)
            }
        }
    }
}

/// Operations the run controller needs from the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Namespace every object is created in
    fn namespace(&self) -> String;

    /// Kubeconfig context in use, if one was selected explicitly
    fn context(&self) -> Option<String>;

    /// Create (Pod/Job) or apply (anything else) a tagged descriptor
    async fn create(&self, descriptor: &Value) -> Result<(), Rejection>;

    /// List the pods matching a label selector
    async fn list_pods(&self, selector: &str) -> Result<Vec<PodView>, Error>;

    /// Fetch the full log of a pod
    async fn pod_logs(&self, name: &str) -> Result<String, Error>;

    /// Delete objects. Already-deleted objects are not an error.
    async fn delete(&self, target: &DeleteTarget) -> Result<(), Error>;
}

/// Orchestrator backed by a Kubernetes API server
pub struct KubeOrchestrator {
    client: Client,
    namespace: String,
    context: Option<String>,
}

impl KubeOrchestrator {
    /// Wrap an existing client
    pub fn new(client: Client, namespace: impl Into<String>, context: Option<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            context,
        }
    }

    /// Connect using the kubeconfig resolution chain.
    ///
    /// The namespace falls back to the selected context's namespace, then
    /// `default`.
    pub async fn connect(
        kubeconfig: Option<&Path>,
        namespace: Option<&str>,
        context: Option<&str>,
    ) -> Result<Self, Error> {
        let kubeconfig = resolve_kubeconfig(kubeconfig);
        let loaded = load_kubeconfig(kubeconfig.as_deref())?;
        let namespace = resolve_namespace(namespace, loaded.as_ref(), context);
        let client = create_client(kubeconfig.as_deref(), context).await?;
        debug!(namespace = %namespace, context = ?context, "connected to cluster");
        Ok(Self::new(client, namespace, context.map(str::to_string)))
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn api_for(&self, type_ref: &TypeRef) -> Api<DynamicObject> {
        let ar = if *type_ref == TypeRef::pod() || *type_ref == TypeRef::job() {
            build_api_resource(&type_ref.api_version, &type_ref.kind)
        } else {
            resolve_api_resource(&self.client, &type_ref.api_version, &type_ref.kind).await
        };
        Api::namespaced_with(self.client.clone(), &self.namespace, &ar)
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    fn namespace(&self) -> String {
        self.namespace.clone()
    }

    fn context(&self) -> Option<String> {
        self.context.clone()
    }

    async fn create(&self, descriptor: &Value) -> Result<(), Rejection> {
        let type_ref = TypeRef::of(descriptor)
            .ok_or_else(|| Rejection::Other("descriptor has no apiVersion/kind".to_string()))?;
        let name = descriptor
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| Rejection::Other("descriptor has no metadata.name".to_string()))?;
        let api = self.api_for(&type_ref).await;

        if type_ref == TypeRef::pod() || type_ref == TypeRef::job() {
            let obj: DynamicObject = serde_json::from_value(descriptor.clone())
                .map_err(|e| Rejection::Other(format!("invalid descriptor: {}", e)))?;
            api.create(&PostParams::default(), &obj).await?;
        } else {
            let params = PatchParams::apply(FIELD_MANAGER).force();
            api.patch(name, &params, &Patch::Apply(descriptor)).await?;
        }

        debug!(
            kind = %type_ref.kind,
            name = %name,
            namespace = %self.namespace,
            "workload created"
        );
        Ok(())
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<PodView>, Error> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(pods.items.iter().filter_map(pod_view).collect())
    }

    async fn pod_logs(&self, name: &str) -> Result<String, Error> {
        let api = self.pods();
        let pod = api.get(name).await?;
        let containers: Vec<String> = pod
            .spec
            .map(|s| s.containers.into_iter().map(|c| c.name).collect())
            .unwrap_or_default();

        if containers.len() <= 1 {
            return Ok(api.logs(name, &LogParams::default()).await?);
        }

        let mut out = String::new();
        for container in containers {
            let params = LogParams {
                container: Some(container.clone()),
                ..Default::default()
            };
            out.push_str(&format!("--- container {} ---\n", container));
            match api.logs(name, &params).await {
                Ok(logs) => out.push_str(&logs),
                Err(e) => {
                    warn!(pod = %name, container = %container, error = %e, "failed to fetch container logs");
                    out.push_str(&format!("<failed to fetch logs: {}>\n", e));
                }
            }
        }
        Ok(out)
    }

    async fn delete(&self, target: &DeleteTarget) -> Result<(), Error> {
        let result = match target {
            DeleteTarget::Named { type_ref, name } => self
                .api_for(type_ref)
                .await
                .delete(name, &DeleteParams::background())
                .await
                .map(|_| ()),
            DeleteTarget::Labelled { type_ref, selector } => self
                .api_for(type_ref)
                .await
                .delete_collection(
                    &DeleteParams::background(),
                    &ListParams::default().labels(selector),
                )
                .await
                .map(|_| ()),
        };

        if was_present(result)? {
            debug!(object = %target, "deleted");
        } else {
            debug!(object = %target, "already deleted");
        }
        Ok(())
    }
}

/// Outcome of a delete call: a 404 means someone got there first
fn was_present(result: Result<(), kube::Error>) -> Result<bool, Error> {
    match result.map_err(Error::from) {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Map a pod to the controller's view of it. Pods without a name are skipped.
pub fn pod_view(pod: &Pod) -> Option<PodView> {
    let name = pod.metadata.name.clone()?;
    Some(PodView::new(name, pod_phase(pod)))
}

fn pod_phase(pod: &Pod) -> PodPhase {
    let status = pod.status.as_ref();

    let crash_looping = status
        .into_iter()
        .flat_map(|s| {
            s.container_statuses
                .iter()
                .flatten()
                .chain(s.init_container_statuses.iter().flatten())
        })
        .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
        .any(|reason| reason == "CrashLoopBackOff");
    if crash_looping {
        return PodPhase::CrashLoopBackOff;
    }

    let phase = status
        .and_then(|s| s.phase.as_deref())
        .map(PodPhase::from)
        .unwrap_or(PodPhase::Pending);
    if phase.is_terminal() {
        return phase;
    }

    if pod.metadata.deletion_timestamp.is_some() {
        return PodPhase::Terminating;
    }
    phase
}
