//! Descriptor tagging
//!
//! Every object of a run carries the trace label `run=<id>` so pods can be
//! discovered and everything can be deleted by selector. The root object is
//! renamed `<prefix>-<base>-<id>` so repeated submissions of one template
//! never collide, and each container gets the run id in its environment.
//!
//! Tagging is pure and idempotent for a given id: the original base name is
//! remembered in an annotation, so re-tagging yields the same tree.

use serde_json::{json, Map, Value};

use kuberun_common::{
    BASE_NAME_ANNOTATION, LABEL_MANAGED_BY, LABEL_MANAGED_BY_KUBERUN, TRACE_LABEL_KEY,
};

use crate::error::RunError;
use crate::run::RunId;

/// Environment variable injected into every container
pub const RUN_ID_ENV: &str = "KUBERUN_RUN_ID";

/// Base name used when the root object has no metadata at all
pub const DEFAULT_BASE_NAME: &str = "workload";

/// Maximum length of a Kubernetes object name (DNS label)
const MAX_NAME_LEN: usize = 63;

const CONTAINER_LIST_KEYS: &[&str] = &["containers", "initContainers", "ephemeralContainers"];

/// Run identity applied to a descriptor
#[derive(Clone, Debug)]
pub struct RunTag {
    /// The run identifier
    pub id: RunId,
    /// Prefix of the derived root name
    pub prefix: String,
}

impl RunTag {
    /// Create a tag
    pub fn new(id: RunId, prefix: impl Into<String>) -> Self {
        Self {
            id,
            prefix: prefix.into(),
        }
    }

    /// Derive the root object's name from its base name.
    ///
    /// The base is shortened so the result fits in a DNS label.
    pub fn derive_name(&self, base: &str) -> String {
        let fixed = self.prefix.len() + self.id.as_str().len() + 2;
        let budget = MAX_NAME_LEN.saturating_sub(fixed);
        let base: String = base.chars().take(budget).collect();
        let base = base.trim_end_matches(['-', '.']);
        if base.is_empty() {
            format!("{}-{}", self.prefix, self.id)
        } else {
            format!("{}-{}-{}", self.prefix, base, self.id)
        }
    }
}

/// Return a tagged copy of `descriptor`.
///
/// The root gets a derived name (`generateName` is consumed), every nested
/// object with `metadata` and every pod template gets the trace label, and
/// every container gets the run id environment variable.
pub fn tag_descriptor(descriptor: &Value, tag: &RunTag) -> Result<Value, RunError> {
    let mut tagged = descriptor.clone();
    let root = tagged
        .as_object_mut()
        .ok_or_else(|| RunError::configuration("descriptor must be a mapping"))?;

    name_root(root, tag)?;
    stamp_tree(&mut tagged, None, tag);
    Ok(tagged)
}

fn name_root(root: &mut Map<String, Value>, tag: &RunTag) -> Result<(), RunError> {
    let metadata = match root.remove("metadata") {
        Some(Value::Object(metadata)) => Some(metadata),
        None | Some(Value::Null) => None,
        Some(_) => return Err(RunError::configuration("metadata must be a mapping")),
    };

    let base = match &metadata {
        Some(metadata) => base_name(metadata).ok_or_else(|| {
            RunError::configuration("descriptor metadata needs a name or generateName")
        })?,
        None => DEFAULT_BASE_NAME.to_string(),
    };

    let mut metadata = metadata.unwrap_or_default();
    metadata.insert("name".to_string(), json!(tag.derive_name(&base)));
    metadata.remove("generateName");
    with_child_map(&mut metadata, "annotations", |annotations| {
        annotations.insert(BASE_NAME_ANNOTATION.to_string(), json!(base));
    });
    root.insert("metadata".to_string(), Value::Object(metadata));
    Ok(())
}

/// The name the descriptor was authored with, before any tagging
fn base_name(metadata: &Map<String, Value>) -> Option<String> {
    let non_empty = |key: &str| {
        metadata
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    metadata
        .get("annotations")
        .and_then(|a| a.get(BASE_NAME_ANNOTATION))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| non_empty("name"))
        .or_else(|| {
            non_empty("generateName")
                .map(|g| g.trim_end_matches('-').to_string())
                .filter(|g| !g.is_empty())
        })
}

fn stamp_tree(value: &mut Value, parent_key: Option<&str>, tag: &RunTag) {
    match value {
        Value::Object(map) => {
            if is_pod_template(map) && !map.get("metadata").is_some_and(Value::is_object) {
                map.insert("metadata".to_string(), Value::Object(Map::new()));
            }
            if let Some(Value::Object(metadata)) = map.get_mut("metadata") {
                stamp_labels(metadata, tag);
            }
            for (key, child) in map.iter_mut() {
                stamp_tree(child, Some(key.as_str()), tag);
            }
        }
        Value::Array(items) => {
            let containers = parent_key.is_some_and(|k| CONTAINER_LIST_KEYS.contains(&k));
            for item in items.iter_mut() {
                if containers {
                    if let Value::Object(container) = item {
                        stamp_env(container, tag);
                    }
                }
                stamp_tree(item, None, tag);
            }
        }
        _ => {}
    }
}

/// Pods created from this mapping must be discoverable by the trace label,
/// so it needs metadata even when the author left it out.
fn is_pod_template(map: &Map<String, Value>) -> bool {
    map.get("spec")
        .and_then(|spec| spec.get("containers"))
        .is_some_and(Value::is_array)
}

fn stamp_labels(metadata: &mut Map<String, Value>, tag: &RunTag) {
    with_child_map(metadata, "labels", |labels| {
        labels.insert(TRACE_LABEL_KEY.to_string(), json!(tag.id.as_str()));
        labels.insert(
            LABEL_MANAGED_BY.to_string(),
            json!(LABEL_MANAGED_BY_KUBERUN),
        );
    });
}

fn stamp_env(container: &mut Map<String, Value>, tag: &RunTag) {
    let entry = json!({"name": RUN_ID_ENV, "value": tag.id.as_str()});
    let mut vars = match container.remove("env") {
        Some(Value::Array(vars)) => vars,
        _ => Vec::new(),
    };

    match vars
        .iter_mut()
        .find(|v| v.get("name").and_then(Value::as_str) == Some(RUN_ID_ENV))
    {
        Some(existing) => *existing = entry,
        None => vars.push(entry),
    }
    container.insert("env".to_string(), Value::Array(vars));
}

/// Edit `key` as a mapping, replacing anything else found there
fn with_child_map(
    parent: &mut Map<String, Value>,
    key: &str,
    edit: impl FnOnce(&mut Map<String, Value>),
) {
    let mut child = match parent.remove(key) {
        Some(Value::Object(child)) => child,
        _ => Map::new(),
    };
    edit(&mut child);
    parent.insert(key.to_string(), Value::Object(child));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(id: &str) -> RunTag {
        RunTag::new(RunId::new(id).unwrap(), "kr")
    }

    fn job() -> Value {
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"generateName": "train-", "labels": {"team": "ml"}},
            "spec": {
                "completions": 2,
                "template": {
                    "metadata": {"annotations": {"a": "b"}},
                    "spec": {
                        "initContainers": [{"name": "setup", "image": "busybox"}],
                        "containers": [{
                            "name": "main",
                            "image": "trainer",
                            "env": [{"name": "EPOCHS", "value": "3"}]
                        }]
                    }
                }
            }
        })
    }

    #[test]
    fn root_is_renamed_and_generate_name_consumed() {
        let tagged = tag_descriptor(&job(), &tag("abc123")).unwrap();
        let meta = &tagged["metadata"];
        assert_eq!(meta["name"], "kr-train-abc123");
        assert!(meta.get("generateName").is_none());
        assert_eq!(meta["annotations"][BASE_NAME_ANNOTATION], "train");
        assert_eq!(meta["labels"]["team"], "ml");
        assert_eq!(meta["labels"][TRACE_LABEL_KEY], "abc123");
    }

    #[test]
    fn nested_objects_are_labelled_but_not_renamed() {
        let tagged = tag_descriptor(&job(), &tag("abc123")).unwrap();
        let template = &tagged["spec"]["template"]["metadata"];
        assert_eq!(template["labels"][TRACE_LABEL_KEY], "abc123");
        assert_eq!(template["labels"][LABEL_MANAGED_BY], LABEL_MANAGED_BY_KUBERUN);
        assert_eq!(template["annotations"]["a"], "b");
        assert!(template.get("name").is_none());
    }

    #[test]
    fn pod_templates_without_metadata_are_labelled() {
        let job = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "train"},
            "spec": {"template": {"spec": {"containers": [{"name": "main"}]}}}
        });
        let tagged = tag_descriptor(&job, &tag("abc123")).unwrap();
        let labels = &tagged["spec"]["template"]["metadata"]["labels"];
        assert_eq!(labels[TRACE_LABEL_KEY], "abc123");
        assert_eq!(labels[LABEL_MANAGED_BY], LABEL_MANAGED_BY_KUBERUN);
        assert_eq!(tag_descriptor(&tagged, &tag("abc123")).unwrap(), tagged);
    }

    #[test]
    fn replica_templates_of_custom_kinds_are_labelled() {
        let mpi = json!({
            "apiVersion": "kubeflow.org/v2beta1",
            "kind": "MPIJob",
            "metadata": {"name": "allreduce"},
            "spec": {
                "mpiReplicaSpecs": {
                    "Launcher": {"template": {"spec": {"containers": [{"name": "l"}]}}},
                    "Worker": {"template": {"metadata": null, "spec": {"containers": []}}}
                }
            }
        });
        let tagged = tag_descriptor(&mpi, &tag("abc123")).unwrap();
        for role in ["Launcher", "Worker"] {
            let template = &tagged["spec"]["mpiReplicaSpecs"][role]["template"];
            assert_eq!(template["metadata"]["labels"][TRACE_LABEL_KEY], "abc123");
        }
    }

    #[test]
    fn containers_get_run_id_env() {
        let tagged = tag_descriptor(&job(), &tag("abc123")).unwrap();
        let pod_spec = &tagged["spec"]["template"]["spec"];

        let main_env = pod_spec["containers"][0]["env"].as_array().unwrap();
        assert_eq!(main_env.len(), 2);
        assert_eq!(main_env[0]["name"], "EPOCHS");
        assert_eq!(main_env[1], json!({"name": RUN_ID_ENV, "value": "abc123"}));

        let init_env = pod_spec["initContainers"][0]["env"].as_array().unwrap();
        assert_eq!(init_env.len(), 1);
    }

    #[test]
    fn tagging_is_idempotent_for_one_id() {
        let t = tag("abc123");
        let once = tag_descriptor(&job(), &t).unwrap();
        let twice = tag_descriptor(&once, &t).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn distinct_ids_never_collide() {
        let a = tag_descriptor(&job(), &RunTag::new(RunId::generate(), "kr")).unwrap();
        let b = tag_descriptor(&job(), &RunTag::new(RunId::generate(), "kr")).unwrap();
        assert_ne!(a["metadata"]["name"], b["metadata"]["name"]);
        assert_ne!(
            a["metadata"]["labels"][TRACE_LABEL_KEY],
            b["metadata"]["labels"][TRACE_LABEL_KEY]
        );
    }

    #[test]
    fn retagging_with_new_id_keeps_original_base() {
        let first = tag_descriptor(&job(), &tag("aaa111")).unwrap();
        let second = tag_descriptor(&first, &tag("bbb222")).unwrap();
        assert_eq!(second["metadata"]["name"], "kr-train-bbb222");
        assert_eq!(second["metadata"]["labels"][TRACE_LABEL_KEY], "bbb222");
    }

    #[test]
    fn explicit_name_is_used_as_base() {
        let pod = json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "hello"}});
        let tagged = tag_descriptor(&pod, &tag("abc123")).unwrap();
        assert_eq!(tagged["metadata"]["name"], "kr-hello-abc123");
    }

    #[test]
    fn missing_metadata_uses_default_base() {
        let pod = json!({"apiVersion": "v1", "kind": "Pod", "spec": {"containers": []}});
        let tagged = tag_descriptor(&pod, &tag("abc123")).unwrap();
        assert_eq!(tagged["metadata"]["name"], "kr-workload-abc123");
    }

    #[test]
    fn metadata_without_any_name_is_rejected() {
        let pod = json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"labels": {}}});
        assert!(matches!(
            tag_descriptor(&pod, &tag("abc123")),
            Err(RunError::Configuration { .. })
        ));
    }

    #[test]
    fn long_names_fit_a_dns_label() {
        let long = "x".repeat(80);
        let pod = json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": long}});
        let tagged = tag_descriptor(&pod, &tag("abc123")).unwrap();
        let name = tagged["metadata"]["name"].as_str().unwrap();
        assert_eq!(name.len(), MAX_NAME_LEN);
        assert!(name.starts_with("kr-x"));
        assert!(name.ends_with("-abc123"));
    }
}
