//! In-memory orchestrator for lifecycle tests

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use kuberun_common::Error;

use crate::orchestrator::{DeleteTarget, Orchestrator, Rejection};
use crate::run::{PodPhase, PodView, Run, RunId, RunState, WorkloadKind};

/// A running run with no collector, for tests that drive state directly
pub(crate) fn test_run(kind: WorkloadKind) -> Run {
    Run {
        id: RunId::new("abc123").unwrap(),
        name: "kr-demo-abc123".to_string(),
        namespace: "default".to_string(),
        context: None,
        kind,
        replica_count: 1,
        state: RunState::Running,
        submit_time: tokio::time::Instant::now(),
        cancel_time: None,
        time_limit: None,
        pending_error: None,
        output: PathBuf::from("/tmp/kuberun-test/run.out"),
        descriptor_copy: PathBuf::from("/tmp/kuberun-test/run.yaml"),
        collector: None,
        logs_settled: false,
        torn_down: false,
    }
}

/// A bare Pod descriptor carrying the trace label of run `id`
pub(crate) fn labelled_pod(id: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": format!("kr-demo-{}", id), "labels": {"run": id}},
        "spec": {"containers": [{"name": "main", "image": "busybox"}]}
    })
}

#[derive(Default)]
struct FakeState {
    pods: Vec<PodView>,
    logs: HashMap<String, String>,
    created: Vec<Value>,
    create_results: VecDeque<Result<(), Rejection>>,
    deletes: Vec<DeleteTarget>,
    fail_listing: bool,
}

/// Scriptable cluster: pods and logs are set by the test, creates and
/// deletes are recorded.
///
/// Pods carry the labels of the pod template in the last created
/// descriptor, and listing filters on them, so a workload whose pods would
/// not carry the trace label is never observed.
#[derive(Default)]
pub(crate) struct FakeOrchestrator {
    state: Mutex<FakeState>,
}

impl FakeOrchestrator {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_pods(&self, pods: &[(&str, PodPhase)]) {
        self.state.lock().unwrap().pods = pods
            .iter()
            .map(|(name, phase)| PodView::new(*name, phase.clone()))
            .collect();
    }

    pub(crate) fn set_log(&self, pod: &str, text: &str) {
        self.state
            .lock()
            .unwrap()
            .logs
            .insert(pod.to_string(), text.to_string());
    }

    pub(crate) fn fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_listing = fail;
    }

    pub(crate) fn push_create_result(&self, result: Result<(), Rejection>) {
        self.state.lock().unwrap().create_results.push_back(result);
    }

    pub(crate) fn created(&self) -> Vec<Value> {
        self.state.lock().unwrap().created.clone()
    }

    pub(crate) fn deletes(&self) -> Vec<DeleteTarget> {
        self.state.lock().unwrap().deletes.clone()
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    fn namespace(&self) -> String {
        "default".to_string()
    }

    fn context(&self) -> Option<String> {
        None
    }

    async fn create(&self, descriptor: &Value) -> Result<(), Rejection> {
        let mut state = self.state.lock().unwrap();
        state.created.push(descriptor.clone());
        state.create_results.pop_front().unwrap_or(Ok(()))
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<PodView>, Error> {
        let state = self.state.lock().unwrap();
        if state.fail_listing {
            return Err(Error::internal_with_context("list_pods", "api server unavailable"));
        }
        let labels = state
            .created
            .last()
            .and_then(pod_template_labels)
            .unwrap_or_default();
        if matches_selector(&labels, selector) {
            Ok(state.pods.clone())
        } else {
            Ok(Vec::new())
        }
    }

    async fn pod_logs(&self, name: &str) -> Result<String, Error> {
        self.state
            .lock()
            .unwrap()
            .logs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::internal_with_context("pod_logs", format!("no logs for {}", name)))
    }

    async fn delete(&self, target: &DeleteTarget) -> Result<(), Error> {
        self.state.lock().unwrap().deletes.push(target.clone());
        Ok(())
    }
}

/// Labels pods created from `descriptor` would get: those of the first
/// mapping shaped like a pod (a `spec` holding `containers`)
fn pod_template_labels(descriptor: &Value) -> Option<Map<String, Value>> {
    match descriptor {
        Value::Object(map) => {
            let is_pod = map
                .get("spec")
                .and_then(|spec| spec.get("containers"))
                .is_some_and(Value::is_array);
            if is_pod {
                return Some(
                    map.get("metadata")
                        .and_then(|m| m.get("labels"))
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default(),
                );
            }
            map.values().find_map(pod_template_labels)
        }
        Value::Array(items) => items.iter().find_map(pod_template_labels),
        _ => None,
    }
}

/// Equality-based selectors only (`k=v,k2=v2`)
fn matches_selector(labels: &Map<String, Value>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).and_then(Value::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}
