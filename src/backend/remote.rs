// src/backend/remote.rs

//! REST backend.
//!
//! Every operation is a JSON call against `<url>/<kind>/...`. Lists follow the
//! `next` cursor until exhausted. A submission that times out is not resent:
//! the asset is polled with `get` until it shows up or `retry_timeout`
//! elapses.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::errors::{FedplanError, Result};
use crate::exec::performance::Performances;
use crate::models::{Asset, AssetKind, ComputePlan, Organization, StoredAsset};
use crate::schemas::UpdateRequest;
use crate::store::filters::{Filters, MATCH_FILTER, METADATA_FILTER};

const API_VERSION_HEADER: &str = "application/json;version=0.0";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// One page of a list endpoint.
#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    results: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct RemoteBackend {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    insecure: bool,
    retry_timeout: Duration,
    poll_interval: Duration,
}

impl RemoteBackend {
    pub fn new(
        url: &str,
        token: Option<String>,
        insecure: bool,
        retry_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(insecure)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            base_url: url.trim_end_matches('/').to_string(),
            token,
            insecure,
            retry_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Override the per-request timeout (mostly for tests).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(self.insecure)
            .build()
            .context("building HTTP client")?;
        Ok(self)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, parts: &[&str]) -> String {
        let mut url = self.base_url.clone();
        for part in parts {
            url.push('/');
            url.push_str(part);
        }
        url.push('/');
        url
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header(reqwest::header::ACCEPT, API_VERSION_HEADER);
        match &self.token {
            Some(token) => builder.header(reqwest::header::AUTHORIZATION, format!("Token {token}")),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        check_status(response).await
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.send(builder).await?;
        Ok(response.json::<T>().await?)
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub async fn get_asset(&self, kind: AssetKind, key: &str) -> Result<Asset> {
        let url = self.url(&[kind.url_segment(), key]);
        debug!(%kind, key, "remote get");
        let value: Value = self.send_json(self.request(Method::GET, &url)).await?;
        Asset::from_value(kind, value)
    }

    pub async fn get<T: StoredAsset>(&self, key: &str) -> Result<T> {
        T::try_from_asset(self.get_asset(T::KIND, key).await?)
    }

    pub async fn list_assets(
        &self,
        kind: AssetKind,
        filters: &Filters,
        order_by: Option<&str>,
        ascending: bool,
    ) -> Result<Vec<Asset>> {
        let mut query = filter_query(filters);
        if let Some(field) = order_by {
            let ordering = if ascending {
                field.to_string()
            } else {
                format!("-{field}")
            };
            query.push(("ordering".to_string(), ordering));
        }

        let values = self
            .paginate(self.request(Method::GET, &self.url(&[kind.url_segment()])).query(&query))
            .await?;
        values
            .into_iter()
            .map(|v| Asset::from_value(kind, v))
            .collect()
    }

    /// Collect `results` of every page, following `next`.
    async fn paginate(&self, first: RequestBuilder) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        let mut page = self.send_json::<Value>(first).await?;

        loop {
            // Some endpoints answer with a bare array.
            let Page { next, results } = match page {
                Value::Array(items) => Page {
                    next: None,
                    results: items,
                },
                other => serde_json::from_value(other)?,
            };
            out.extend(results);

            match next {
                Some(url) => {
                    debug!(url = %url, "fetching next page");
                    page = self.send_json(self.request(Method::GET, &url)).await?;
                }
                None => return Ok(out),
            }
        }
    }

    pub async fn list_organizations(&self) -> Result<Vec<Organization>> {
        let values = self
            .paginate(self.request(Method::GET, &self.url(&["organization"])))
            .await?;
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(FedplanError::from))
            .collect()
    }

    pub async fn get_performances(&self, compute_plan_key: &str) -> Result<Performances> {
        let values = self
            .paginate(self.request(
                Method::GET,
                &self.url(&[AssetKind::ComputePlan.url_segment(), compute_plan_key, "perf"]),
            ))
            .await?;
        let entries = values
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Performances {
            compute_plan_key: compute_plan_key.to_string(),
            entries,
        })
    }

    pub async fn describe(&self, kind: AssetKind, key: &str) -> Result<String> {
        let url = self.url(&[kind.url_segment(), key, "description"]);
        let response = self.send(self.request(Method::GET, &url)).await?;
        Ok(response.text().await?)
    }

    /// Fetch the file behind an asset into `dest_dir`.
    pub async fn download(&self, kind: AssetKind, key: &str, dest_dir: &Path) -> Result<PathBuf> {
        let (endpoint, file_name) = match kind {
            AssetKind::Dataset => ("opener", "opener.py".to_string()),
            AssetKind::Function => ("file", format!("function-{key}.tar.gz")),
            AssetKind::Model => ("file", format!("model_{key}")),
            other => {
                return Err(FedplanError::InvalidRequest(format!(
                    "{other} assets have no downloadable file"
                )));
            }
        };
        let url = self.url(&[kind.url_segment(), key, endpoint]);
        let response = self.send(self.request(Method::GET, &url)).await?;
        let bytes = response.bytes().await?;

        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(file_name);
        tokio::fs::write(&path, &bytes).await?;
        info!(%kind, key, path = ?path, bytes = bytes.len(), "downloaded asset file");
        Ok(path)
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Create one asset. A 409 answer is surfaced as `AlreadyExists`; a
    /// timeout falls back to polling for `key`.
    pub async fn create(&self, kind: AssetKind, key: &str, body: &Value) -> Result<String> {
        let url = self.url(&[kind.url_segment()]);
        info!(%kind, key, "remote create");
        match self.send(self.request(Method::POST, &url).json(body)).await {
            Ok(_) => Ok(key.to_string()),
            Err(FedplanError::Timeout(msg)) => {
                warn!(%kind, key, error = %msg, "create timed out; polling for the asset");
                self.wait_for_asset(kind, key).await?;
                Ok(key.to_string())
            }
            Err(err) => Err(err),
        }
    }

    /// Like [`RemoteBackend::create`], treating "already exists" as success.
    pub async fn create_or_existing(
        &self,
        kind: AssetKind,
        key: &str,
        body: &Value,
    ) -> Result<String> {
        match self.create(kind, key, body).await {
            Err(FedplanError::AlreadyExists { keys }) => {
                let existing = keys.into_iter().next().unwrap_or_else(|| key.to_string());
                warn!(%kind, key = %existing, "asset already exists; using the existing key");
                Ok(existing)
            }
            other => other,
        }
    }

    /// Submit tasks in one request. On timeout, every task is polled.
    pub async fn bulk_create_tasks(
        &self,
        compute_plan_key: &str,
        tasks: Vec<Value>,
    ) -> Result<Vec<String>> {
        let keys: Vec<String> = tasks
            .iter()
            .filter_map(|t| t.get("key").and_then(Value::as_str).map(str::to_string))
            .collect();
        let body = json!({ "compute_plan_key": compute_plan_key, "tasks": tasks });
        let url = self.url(&[AssetKind::Task.url_segment(), "bulk_create"]);

        info!(compute_plan = %compute_plan_key, tasks = keys.len(), "remote bulk create");
        match self.send(self.request(Method::POST, &url).json(&body)).await {
            Ok(_) => Ok(keys),
            Err(FedplanError::Timeout(msg)) => {
                warn!(compute_plan = %compute_plan_key, error = %msg, "bulk create timed out; polling");
                for key in &keys {
                    self.wait_for_asset(AssetKind::Task, key).await?;
                }
                Ok(keys)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn update(&self, kind: AssetKind, key: &str, request: &UpdateRequest) -> Result<()> {
        let url = self.url(&[kind.url_segment(), key]);
        self.send(self.request(Method::PUT, &url).json(request)).await?;
        Ok(())
    }

    pub async fn link_dataset_with_data_samples(
        &self,
        dataset_key: &str,
        data_sample_keys: &[String],
    ) -> Result<Vec<String>> {
        let url = self.url(&[AssetKind::DataSample.url_segment(), "bulk_update"]);
        let body = json!({
            "data_manager_keys": [dataset_key],
            "data_sample_keys": data_sample_keys,
        });
        self.send(self.request(Method::POST, &url).json(&body)).await?;
        Ok(data_sample_keys.to_vec())
    }

    pub async fn cancel_compute_plan(&self, key: &str) -> Result<ComputePlan> {
        let url = self.url(&[AssetKind::ComputePlan.url_segment(), key, "cancel"]);
        self.send(self.request(Method::POST, &url)).await?;
        self.get(key).await
    }

    /// Poll `get` until the asset exists or `retry_timeout` elapses.
    pub async fn wait_for_asset(&self, kind: AssetKind, key: &str) -> Result<Asset> {
        let started = Instant::now();
        loop {
            match self.get_asset(kind, key).await {
                Ok(asset) => return Ok(asset),
                Err(FedplanError::NotFound(_) | FedplanError::Timeout(_)) => {}
                Err(err) => return Err(err),
            }
            if started.elapsed() >= self.retry_timeout {
                return Err(FedplanError::RequestTimeout {
                    key: key.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Poll a plan until it reaches a terminal status or `timeout` elapses.
    pub async fn wait_compute_plan(&self, key: &str, timeout: Duration) -> Result<ComputePlan> {
        let started = Instant::now();
        loop {
            let plan: ComputePlan = self.get(key).await?;
            if plan.status.is_terminal() {
                return Ok(plan);
            }
            if started.elapsed() >= timeout {
                return Err(FedplanError::RequestTimeout {
                    key: key.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            debug!(compute_plan = %key, status = ?plan.status, "waiting for compute plan");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Query parameters for a filter map: OR lists are comma-joined, `metadata`
/// is sent as one JSON array, `match` is passed through.
fn filter_query(filters: &Filters) -> Vec<(String, String)> {
    filters
        .iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(field, values)| {
            let value = match field.as_str() {
                METADATA_FILTER => {
                    let parsed: Vec<Value> = values
                        .iter()
                        .filter_map(|v| serde_json::from_str(v).ok())
                        .collect();
                    Value::Array(parsed).to_string()
                }
                MATCH_FILTER => values.join(" "),
                _ => values.join(","),
            };
            (field.clone(), value)
        })
        .collect()
}

/// Map non-success statuses to the error taxonomy.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), url = %url, "remote error response");

    Err(match status {
        StatusCode::NOT_FOUND => FedplanError::NotFound(url),
        StatusCode::CONFLICT => FedplanError::AlreadyExists {
            keys: conflicting_keys(&body),
        },
        StatusCode::BAD_REQUEST => FedplanError::InvalidRequest(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => FedplanError::Timeout(url),
        _ => FedplanError::HttpError {
            status: status.as_u16(),
            body,
        },
    })
}

/// Keys reported in a 409 body: `{"key": ..}`, `{"keys": [..]}` or `[..]`.
fn conflicting_keys(body: &str) -> Vec<String> {
    let strings = |items: &[Value]| -> Vec<String> {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    };
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) => strings(&items),
        Ok(Value::Object(map)) => match (map.get("key"), map.get("keys")) {
            (Some(Value::String(key)), _) => vec![key.clone()],
            (_, Some(Value::Array(items))) => strings(items),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}
