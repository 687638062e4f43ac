//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction for a named kubeconfig context, namespace resolution,
//! and `ApiResource` building for descriptors whose type is only known at
//! runtime.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kube::api::GroupVersionKind;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::{debug, warn};

use crate::Error;

/// Environment variable overriding the kubeconfig path
pub const KUBERUN_KUBECONFIG_ENV: &str = "KUBERUN_KUBECONFIG";

/// Namespace used when neither the caller nor the kubeconfig names one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolve a kubeconfig path using the priority chain.
///
/// Priority:
/// 1. `explicit` — the `--kubeconfig` CLI flag
/// 2. `KUBERUN_KUBECONFIG` env var
/// 3. `None` — fall back to kube defaults (`KUBECONFIG` / `~/.kube/config`)
pub fn resolve_kubeconfig(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    match std::env::var(KUBERUN_KUBECONFIG_ENV) {
        Ok(path) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => None,
    }
}

/// Load a kubeconfig from an explicit path, or from kube's default locations.
///
/// Returns `Ok(None)` when no explicit path is given and no default kubeconfig
/// exists (e.g., running in-cluster).
pub fn load_kubeconfig(path: Option<&Path>) -> Result<Option<Kubeconfig>, Error> {
    match path {
        Some(path) => Kubeconfig::read_from(path).map(Some).map_err(|e| {
            Error::internal_with_context(
                "kubeconfig",
                format!("failed to read kubeconfig {}: {}", path.display(), e),
            )
        }),
        None => match Kubeconfig::read() {
            Ok(config) => Ok(Some(config)),
            Err(e) => {
                debug!(error = %e, "no default kubeconfig found");
                Ok(None)
            }
        },
    }
}

/// Resolve the namespace a run should target.
///
/// An explicit namespace always wins. Otherwise the namespace of the selected
/// context is used (the explicit `context`, else the kubeconfig's
/// `current-context`, else its first context), falling back to `"default"`.
pub fn resolve_namespace(
    explicit: Option<&str>,
    kubeconfig: Option<&Kubeconfig>,
    context: Option<&str>,
) -> String {
    if let Some(ns) = explicit.filter(|ns| !ns.is_empty()) {
        return ns.to_string();
    }

    let Some(kubeconfig) = kubeconfig else {
        return DEFAULT_NAMESPACE.to_string();
    };

    let selected = context.or(kubeconfig.current_context.as_deref());
    let named = match selected {
        Some(name) => kubeconfig.contexts.iter().find(|c| c.name == name),
        None => kubeconfig.contexts.first(),
    };

    named
        .and_then(|c| c.context.as_ref())
        .and_then(|c| c.namespace.clone())
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
}

/// Create a kube client for an optional kubeconfig path and context
pub async fn create_client(
    kubeconfig: Option<&Path>,
    context: Option<&str>,
) -> Result<Client, Error> {
    create_client_with_timeout(
        kubeconfig,
        context,
        DEFAULT_CONNECT_TIMEOUT,
        DEFAULT_READ_TIMEOUT,
    )
    .await
}

/// Create a kube client with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    context: Option<&str>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };

    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None if context.is_some() => Config::from_kubeconfig(&options).await.map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to load kubeconfig context: {}", e),
            )
        })?,
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };

    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use kuberun_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("batch/v1");
/// assert_eq!(group, "batch");
/// assert_eq!(version, "v1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from an apiVersion and kind, guessing the plural
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Resolve an ApiResource through API discovery, falling back to a guessed
/// plural when discovery fails (e.g., missing RBAC on the discovery endpoints).
pub async fn resolve_api_resource(client: &Client, api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    let gvk = GroupVersionKind::gvk(&group, &version, kind);
    match kube::discovery::pinned_kind(client, &gvk).await {
        Ok((ar, _caps)) => ar,
        Err(e) => {
            warn!(
                api_version = %api_version,
                kind = %kind,
                error = %e,
                "API discovery failed, guessing resource plural"
            );
            build_api_resource(api_version, kind)
        }
    }
}

/// Kinds whose plural doesn't follow the simple rules
const KIND_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("podsecuritypolicy", "podsecuritypolicies"),
    ("networkpolicy", "networkpolicies"),
    ("ingress", "ingresses"),
    ("ingressclass", "ingressclasses"),
    ("priorityclass", "priorityclasses"),
    ("storageclass", "storageclasses"),
    ("mpijob", "mpijobs"),
    ("pytorchjob", "pytorchjobs"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for irregular kinds, falling back to simple
/// English pluralization rules.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Build an equality label selector (`key=value`)
pub fn label_selector(key: &str, value: &str) -> String {
    format!("{}={}", key, value)
}
