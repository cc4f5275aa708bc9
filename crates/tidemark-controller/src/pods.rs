//! Pod readiness filtering.
//!
//! Partitions the target's pods into ready, ignored and missing sets with a
//! grace window for pods still warming up, and counts "tolerated as ready"
//! pods for the external metric path. Pod reads go through the informer
//! cache, never live API calls.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Duration;
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use kube::runtime::reflector::Store;
use kube::ResourceExt;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use tidemark_common::Error;

use crate::metrics_client::PodSample;

// pod phase strings the filter cares about
const PHASE_RUNNING: &str = "Running";
const PHASE_PENDING: &str = "Pending";
const PHASE_FAILED: &str = "Failed";

/// Read access to the pods of a namespace, backed by a local cache
#[cfg_attr(test, automock)]
pub trait PodLister: Send + Sync {
    /// List the pods of `namespace` matching `selector`
    fn list(&self, namespace: &str, selector: &TargetSelector) -> Result<Vec<Pod>, Error>;
}

/// Production lister reading the reflector store fed by the pod watcher
pub struct StorePodLister {
    store: Store<Pod>,
}

impl StorePodLister {
    /// Wrap a reflector store
    pub fn new(store: Store<Pod>) -> Self {
        Self { store }
    }
}

impl PodLister for StorePodLister {
    fn list(&self, namespace: &str, selector: &TargetSelector) -> Result<Vec<Pod>, Error> {
        Ok(self
            .store
            .state()
            .into_iter()
            .filter(|pod| pod.namespace().as_deref() == Some(namespace))
            .filter(|pod| selector.matches(pod.labels()))
            .map(|pod| (*pod).clone())
            .collect())
    }
}

/// Equality-based label selector parsed from a Scale status selector string
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetSelector {
    raw: String,
    requirements: Vec<Requirement>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Eq(String, String),
    NotEq(String, String),
}

impl TargetSelector {
    /// Parse a selector string of comma-separated `k=v`, `k==v` and `k!=v`
    /// requirements. An empty string matches every pod.
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let mut requirements = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let requirement = if let Some((k, v)) = part.split_once("!=") {
                Requirement::NotEq(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = part.split_once("==") {
                Requirement::Eq(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = part.split_once('=') {
                Requirement::Eq(k.trim().to_string(), v.trim().to_string())
            } else {
                return Err(Error::validation(format!(
                    "unsupported selector requirement {part:?}"
                )));
            };
            match &requirement {
                Requirement::Eq(k, _) | Requirement::NotEq(k, _) if k.is_empty() => {
                    return Err(Error::validation(format!(
                        "selector requirement {part:?} has an empty key"
                    )));
                }
                _ => requirements.push(requirement),
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            requirements,
        })
    }

    /// Whether the given label set satisfies every requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Eq(k, v) => labels.get(k) == Some(v),
            Requirement::NotEq(k, v) => labels.get(k) != Some(v),
        })
    }
}

impl std::fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Partition of the target's pods computed by [`group_pods`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodGroups {
    /// Pods whose metric samples drive the decision
    pub ready: BTreeSet<String>,
    /// Pods excluded from the decision (failed, pending, warming up)
    pub ignored: BTreeSet<String>,
    /// Pods with no metric sample
    pub missing: BTreeSet<String>,
}

/// Partition pods into ready, ignored and missing sets.
///
/// Used by the resource metric path. Rules, in order:
/// 1. `Failed` pods are ignored.
/// 2. `Pending` pods are ignored.
/// 3. Pods without a metric sample are missing.
/// 4. Pods whose `Ready` condition is `False` and that have never been
///    ready (the condition transitioned within `readiness_delay` of the pod
///    start) are ignored.
/// 5. Everything else is ready.
pub fn group_pods(
    pods: &[Pod],
    samples: &HashMap<String, PodSample>,
    readiness_delay: Duration,
) -> PodGroups {
    let mut groups = PodGroups::default();
    for pod in pods {
        let name = pod.name_any();
        let status = pod.status.as_ref();
        let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or_default();

        if phase == PHASE_FAILED {
            groups.ignored.insert(name);
            continue;
        }
        if phase == PHASE_PENDING {
            groups.ignored.insert(name);
            continue;
        }
        if !samples.contains_key(&name) {
            groups.missing.insert(name);
            continue;
        }

        let ignore = match (ready_condition(pod), start_time(pod)) {
            (Some(condition), Some(start)) => {
                condition.status == "False"
                    && condition
                        .last_transition_time
                        .as_ref()
                        .is_some_and(|t| start + readiness_delay > t.0)
            }
            // no Ready condition or no start time yet: treat as warming up
            _ => true,
        };
        if ignore {
            groups.ignored.insert(name);
        } else {
            groups.ready.insert(name);
        }
    }
    debug!(
        ready = groups.ready.len(),
        ignored = groups.ignored.len(),
        missing = groups.missing.len(),
        "Grouped pods for readiness"
    );
    groups
}

/// Count the pods tolerated as ready for the external metric path.
///
/// Running pods with a `True` Ready condition count, and so do Pending pods
/// whose Ready condition last transitioned within `readiness_delay` of the
/// pod start (image pulls included). Unresponsive pods that were once ready
/// do not get the grace window.
pub fn ready_pods_count(
    pods: &[Pod],
    readiness_delay: Duration,
    selector: &TargetSelector,
) -> Result<i32, Error> {
    if pods.is_empty() {
        return Err(Error::NoPodsMatched {
            selector: selector.to_string(),
        });
    }

    let mut tolerated = 0;
    for pod in pods {
        let (Some(condition), Some(start)) = (ready_condition(pod), start_time(pod)) else {
            debug!(pod = %pod.name_any(), "Pod unready");
            continue;
        };
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or_default();

        let running_ready = phase == PHASE_RUNNING && condition.status == "True";
        let pending_in_grace = phase == PHASE_PENDING
            && condition
                .last_transition_time
                .as_ref()
                .is_some_and(|t| t.0 - start < readiness_delay);
        if running_ready || pending_in_grace {
            tolerated += 1;
        }
    }

    if tolerated == 0 {
        return Err(Error::NoReadyPods {
            selector: selector.to_string(),
            pod_count: pods.len(),
        });
    }
    Ok(tolerated)
}

/// Drop the samples of every pod in `pods`
pub fn remove_samples_for(samples: &mut HashMap<String, PodSample>, pods: &BTreeSet<String>) {
    for pod in pods {
        samples.remove(pod);
    }
}

fn ready_condition(pod: &Pod) -> Option<&PodCondition> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Ready")
}

fn start_time(pod: &Pod) -> Option<chrono::DateTime<chrono::Utc>> {
    pod.status.as_ref()?.start_time.as_ref().map(|t| t.0)
}
