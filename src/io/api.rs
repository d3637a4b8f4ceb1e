//! HTTP clients for the dispatcher back end
//!
//! The engine talks to three narrow traits so tests can swap in mocks;
//! `HttpApiClient` implements all of them over one pooled reqwest client.

use crate::domain::roster::{DispatchLogRecord, VehicleAssignmentRecord};
use crate::domain::types::{DispatchLogId, OverspeedIncident};
use crate::infra::config::Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait DispatchApi: Send + Sync {
    /// Open an alley segment, returning the new dispatch log id
    async fn start_alley(&self, vehicle_assignment_id: i64, route: &str) -> Result<DispatchLogId>;

    async fn end_alley(&self, dispatch_log_id: DispatchLogId) -> Result<()>;

    /// Open a road segment, returning the new dispatch log id
    async fn start_dispatch(&self, vehicle_assignment_id: i64, route: &str)
        -> Result<DispatchLogId>;

    async fn end_dispatch(&self, dispatch_log_id: DispatchLogId) -> Result<()>;

    async fn get_all_dispatches(&self) -> Result<Vec<DispatchLogRecord>>;

    async fn get_vehicle_assignments(&self) -> Result<Vec<VehicleAssignmentRecord>>;
}

#[async_trait]
pub trait OverspeedApi: Send + Sync {
    async fn create_overspeed_record(&self, incident: &OverspeedIncident) -> Result<()>;
}

#[async_trait]
pub trait LocationGateApi: Send + Sync {
    async fn reset_blocked_locations(&self) -> Result<()>;
}

/// The external collaborators the engine calls
#[derive(Clone)]
pub struct ApiSet {
    pub dispatch: Arc<dyn DispatchApi>,
    pub overspeed: Arc<dyn OverspeedApi>,
    pub locations: Arc<dyn LocationGateApi>,
}

impl ApiSet {
    /// Use one client for every API
    pub fn from_client<C>(client: Arc<C>) -> Self
    where
        C: DispatchApi + OverspeedApi + LocationGateApi + 'static,
    {
        Self { dispatch: client.clone(), overspeed: client.clone(), locations: client }
    }
}

#[derive(Serialize)]
struct SegmentRequest<'a> {
    route: &'a str,
    vehicle_assignment_id: i64,
}

#[derive(Serialize)]
struct OverspeedRequest<'a> {
    dispatch_logs_id: Option<i64>,
    vehicle_id: &'a str,
    speed: f64,
    latitude: f64,
    longitude: f64,
}

/// Find `dispatch_logs_id` at the top level or under `data` / `dispatch_log`
pub fn extract_dispatch_log_id(body: &Value) -> Option<DispatchLogId> {
    fn read(v: &Value) -> Option<DispatchLogId> {
        let id = v.get("dispatch_logs_id")?;
        id.as_i64().or_else(|| id.as_str()?.trim().parse().ok()).map(DispatchLogId)
    }

    read(body)
        .or_else(|| body.get("data").and_then(read))
        .or_else(|| body.get("dispatch_log").and_then(read))
        .or_else(|| body.get("data")?.get("dispatch_log").and_then(read))
}

/// List endpoints return a bare array; some deployments wrap it in `data`
fn unwrap_list<T: DeserializeOwned>(body: Value) -> Result<Vec<T>> {
    let list = match body {
        Value::Object(mut map) if map.contains_key("data") => map.remove("data").unwrap_or_default(),
        other => other,
    };
    serde_json::from_value(list).context("Unexpected list response shape")
}

pub struct HttpApiClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpApiClient {
    pub fn new(config: &Config) -> Result<Self> {
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder()
            .timeout(config.api_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: format!("{}/api", config.api_base_url()),
            token: config.api_token().map(str::to_string),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("Failed to send {what} request"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{what} failed with status {status}: {body}");
        }

        let bytes = response.bytes().await.with_context(|| format!("Failed to read {what} response"))?;
        debug!(call = %what, bytes = bytes.len(), "api_response");
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {what} response"))
    }

    async fn start_segment(&self, path: &str, what: &str, vehicle_assignment_id: i64, route: &str) -> Result<DispatchLogId> {
        let body = SegmentRequest { route, vehicle_assignment_id };
        let response = self.send(self.client.post(self.url(path)).json(&body), what).await?;
        extract_dispatch_log_id(&response)
            .with_context(|| format!("{what} response has no dispatch_logs_id"))
    }

    async fn get_list<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<Vec<T>> {
        let body = self.send(self.client.get(self.url(path)), what).await?;
        unwrap_list(body).with_context(|| format!("Failed to decode {what}"))
    }
}

#[async_trait]
impl DispatchApi for HttpApiClient {
    async fn start_alley(&self, vehicle_assignment_id: i64, route: &str) -> Result<DispatchLogId> {
        self.start_segment(
            "/user/dispatcher/dispatch_logs/alley/start",
            "start_alley",
            vehicle_assignment_id,
            route,
        )
        .await
    }

    async fn end_alley(&self, dispatch_log_id: DispatchLogId) -> Result<()> {
        let path = format!("/user/dispatcher/dispatch_logs/alley/end/{dispatch_log_id}");
        self.send(self.client.patch(self.url(&path)), "end_alley").await.map(|_| ())
    }

    async fn start_dispatch(
        &self,
        vehicle_assignment_id: i64,
        route: &str,
    ) -> Result<DispatchLogId> {
        self.start_segment(
            "/user/dispatcher/dispatch_logs/dispatch/start",
            "start_dispatch",
            vehicle_assignment_id,
            route,
        )
        .await
    }

    async fn end_dispatch(&self, dispatch_log_id: DispatchLogId) -> Result<()> {
        let path = format!("/user/dispatcher/dispatch_logs/dispatch/end/{dispatch_log_id}");
        self.send(self.client.patch(self.url(&path)), "end_dispatch").await.map(|_| ())
    }

    async fn get_all_dispatches(&self) -> Result<Vec<DispatchLogRecord>> {
        self.get_list("/user/dispatcher/dispatch_logs/all", "get_all_dispatches").await
    }

    async fn get_vehicle_assignments(&self) -> Result<Vec<VehicleAssignmentRecord>> {
        self.get_list("/user/dispatcher/assignments/all", "get_vehicle_assignments").await
    }
}

#[async_trait]
impl OverspeedApi for HttpApiClient {
    async fn create_overspeed_record(&self, incident: &OverspeedIncident) -> Result<()> {
        let body = OverspeedRequest {
            dispatch_logs_id: incident.dispatch_log_id.map(|id| id.0),
            vehicle_id: &incident.vehicle_id,
            speed: incident.speed_kmh,
            latitude: incident.latitude,
            longitude: incident.longitude,
        };
        let request = self.client.post(self.url("/user/dispatcher/overspeed_tracking/create")).json(&body);
        self.send(request, "create_overspeed_record").await.map(|_| ())
    }
}

#[async_trait]
impl LocationGateApi for HttpApiClient {
    async fn reset_blocked_locations(&self) -> Result<()> {
        let request = self.client.post(self.url("/user/dispatcher/blocked_locations/reset"));
        self.send(request, "reset_blocked_locations").await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_dispatch_log_id() {
        assert_eq!(extract_dispatch_log_id(&json!({"dispatch_logs_id": 7})), Some(DispatchLogId(7)));
        assert_eq!(
            extract_dispatch_log_id(&json!({"data": {"dispatch_logs_id": "8"}})),
            Some(DispatchLogId(8))
        );
        assert_eq!(
            extract_dispatch_log_id(&json!({"message": "ok", "dispatch_log": {"dispatch_logs_id": 9}})),
            Some(DispatchLogId(9))
        );
        assert_eq!(
            extract_dispatch_log_id(&json!({"data": {"dispatch_log": {"dispatch_logs_id": 10}}})),
            Some(DispatchLogId(10))
        );
        assert_eq!(extract_dispatch_log_id(&json!({"message": "ok"})), None);
        assert_eq!(extract_dispatch_log_id(&Value::Null), None);
    }

    #[test]
    fn test_unwrap_list_shapes() {
        let bare = json!([{"vehicle_assignment_id": 1, "vehicle": {"vehicle_id": 101}}]);
        let records: Vec<VehicleAssignmentRecord> = unwrap_list(bare).unwrap();
        assert_eq!(records[0].vehicle.vehicle_id, "101");

        let wrapped = json!({"data": [{"dispatch_logs_id": 3, "vehicle_assignment_id": 1, "status": "on road"}]});
        let records: Vec<DispatchLogRecord> = unwrap_list(wrapped).unwrap();
        assert_eq!(records[0].dispatch_logs_id, DispatchLogId(3));

        assert!(unwrap_list::<DispatchLogRecord>(json!({"error": "nope"})).is_err());
    }

    #[test]
    fn test_client_urls() {
        let client = HttpApiClient::new(&Config::default()).unwrap();
        assert_eq!(
            client.url("/user/dispatcher/blocked_locations/reset"),
            "http://localhost:8000/api/user/dispatcher/blocked_locations/reset"
        );
    }

    #[test]
    fn test_overspeed_body() {
        let body = OverspeedRequest {
            dispatch_logs_id: None,
            vehicle_id: "101",
            speed: 61.5,
            latitude: 8.47,
            longitude: 124.63,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["dispatch_logs_id"], Value::Null);
        assert_eq!(value["speed"], json!(61.5));
    }
}
