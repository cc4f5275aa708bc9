//! Clients for the resource and external metrics services.
//!
//! The decision engine only depends on the [`MetricsClient`] trait; the
//! production implementation issues REST requests against
//! `metrics.k8s.io/v1beta1` and `external.metrics.k8s.io/v1beta1` through
//! the kube client, so it inherits its auth, TLS and timeout configuration.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::Client;
use serde::Deserialize;

#[cfg(test)]
use mockall::automock;

use tidemark_common::crd::quantity::milli_value;
use tidemark_common::Error;

/// One pod's contribution to a resource metric
#[derive(Clone, Debug, PartialEq)]
pub struct PodSample {
    /// Sample value in milli-units
    pub value_milli: i64,
    /// When the sample was taken
    pub timestamp: DateTime<Utc>,
}

/// Access to fresh metric samples
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetricsClient: Send + Sync {
    /// Fetch per-pod usage of a resource (e.g. "cpu") for pods matching the
    /// selector, in milli-units, along with the sample timestamp
    async fn get_resource_metric(
        &self,
        resource: &str,
        namespace: &str,
        selector: &str,
    ) -> Result<(HashMap<String, PodSample>, DateTime<Utc>), Error>;

    /// Fetch the series of an external metric matching the selector, in
    /// milli-units, along with the sample timestamp
    async fn get_external_metric(
        &self,
        metric_name: &str,
        namespace: &str,
        selector: &str,
    ) -> Result<(Vec<i64>, DateTime<Utc>), Error>;
}

/// Production client talking to the metrics API groups
pub struct RestMetricsClient {
    client: Client,
}

impl RestMetricsClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, Error> {
        let request = http::Request::builder()
            .uri(path)
            .body(Vec::new())
            .map_err(|e| Error::internal_with_context("metrics-client", e.to_string()))?;
        Ok(self.client.request::<T>(request).await?)
    }
}

#[async_trait]
impl MetricsClient for RestMetricsClient {
    async fn get_resource_metric(
        &self,
        resource: &str,
        namespace: &str,
        selector: &str,
    ) -> Result<(HashMap<String, PodSample>, DateTime<Utc>), Error> {
        let path = format!(
            "/apis/metrics.k8s.io/v1beta1/namespaces/{namespace}/pods{}",
            selector_query(selector)
        );
        let list: PodMetricsList = self.get_json(&path).await?;

        let mut samples = HashMap::with_capacity(list.items.len());
        let mut earliest: Option<DateTime<Utc>> = None;
        for item in list.items {
            let Some(name) = item.metadata.name else {
                continue;
            };
            let timestamp = parse_timestamp(item.timestamp.as_deref());
            earliest = Some(match earliest {
                Some(t) => t.min(timestamp),
                None => timestamp,
            });

            let mut value_milli = 0;
            for container in &item.containers {
                if let Some(quantity) = container.usage.get(resource) {
                    value_milli += milli_value(quantity)?;
                }
            }
            samples.insert(
                name,
                PodSample {
                    value_milli,
                    timestamp,
                },
            );
        }
        Ok((samples, earliest.unwrap_or_else(Utc::now)))
    }

    async fn get_external_metric(
        &self,
        metric_name: &str,
        namespace: &str,
        selector: &str,
    ) -> Result<(Vec<i64>, DateTime<Utc>), Error> {
        let path = format!(
            "/apis/external.metrics.k8s.io/v1beta1/namespaces/{namespace}/{metric_name}{}",
            selector_query(selector)
        );
        let list: ExternalMetricValueList = self.get_json(&path).await?;

        let mut values = Vec::with_capacity(list.items.len());
        let mut earliest: Option<DateTime<Utc>> = None;
        for item in list.items {
            values.push(milli_value(&item.value)?);
            let timestamp = parse_timestamp(item.timestamp.as_deref());
            earliest = Some(match earliest {
                Some(t) => t.min(timestamp),
                None => timestamp,
            });
        }
        Ok((values, earliest.unwrap_or_else(Utc::now)))
    }
}

fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn selector_query(selector: &str) -> String {
    if selector.is_empty() {
        String::new()
    } else {
        format!("?labelSelector={}", percent_encode(selector))
    }
}

fn percent_encode(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'=' | b','
            | b'!' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

// Wire types for the metrics API groups. k8s-openapi does not ship these,
// so only the fields the controller reads are modeled.

#[derive(Debug, Deserialize)]
struct PodMetricsList {
    #[serde(default)]
    items: Vec<PodMetrics>,
}

#[derive(Debug, Deserialize)]
struct PodMetrics {
    #[serde(default)]
    metadata: PodMetricsMeta,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Default, Deserialize)]
struct PodMetricsMeta {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerMetrics {
    #[serde(default)]
    usage: BTreeMap<String, Quantity>,
}

#[derive(Debug, Deserialize)]
struct ExternalMetricValueList {
    #[serde(default)]
    items: Vec<ExternalMetricValue>,
}

#[derive(Debug, Deserialize)]
struct ExternalMetricValue {
    value: Quantity,
    #[serde(default)]
    timestamp: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_metrics_list_parses_and_sums_containers() {
        let json = r#"{
            "kind": "PodMetricsList",
            "items": [{
                "metadata": {"name": "web-0"},
                "timestamp": "2021-06-01T12:00:00Z",
                "containers": [
                    {"name": "app", "usage": {"cpu": "250m", "memory": "100Mi"}},
                    {"name": "sidecar", "usage": {"cpu": "50m"}}
                ]
            }]
        }"#;
        let list: PodMetricsList = serde_json::from_str(json).unwrap();
        assert_eq!(list.items.len(), 1);

        let pod = &list.items[0];
        let cpu: i64 = pod
            .containers
            .iter()
            .filter_map(|c| c.usage.get("cpu"))
            .map(|q| milli_value(q).unwrap())
            .sum();
        assert_eq!(cpu, 300);
    }

    #[test]
    fn external_metric_list_parses() {
        let json = r#"{
            "kind": "ExternalMetricValueList",
            "items": [
                {"metricName": "queue_depth", "value": "45", "timestamp": "2021-06-01T12:00:00Z"},
                {"metricName": "queue_depth", "value": "500m"}
            ]
        }"#;
        let list: ExternalMetricValueList = serde_json::from_str(json).unwrap();
        let values: Vec<i64> = list
            .items
            .iter()
            .map(|i| milli_value(&i.value).unwrap())
            .collect();
        assert_eq!(values, vec![45_000, 500]);
    }

    #[test]
    fn selector_query_is_percent_encoded() {
        assert_eq!(selector_query(""), "");
        assert_eq!(selector_query("app=web"), "?labelSelector=app=web");
        assert_eq!(
            selector_query("tier in (a,b)"),
            "?labelSelector=tier%20in%20%28a,b%29"
        );
    }

    #[test]
    fn timestamps_fall_back_to_now() {
        let parsed = parse_timestamp(Some("2021-06-01T12:00:00Z"));
        assert_eq!(parsed.to_rfc3339(), "2021-06-01T12:00:00+00:00");
        // malformed timestamps don't fail the fetch
        let fallback = parse_timestamp(Some("not-a-time"));
        assert!(fallback <= Utc::now());
    }
}
