use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::model::MeasurementId;
use async_trait::async_trait;
use futures::stream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::sync::Arc;

pub const DEVICE_ID_HEADER: &str = "X-Device-Id";
pub const MEASUREMENT_ID_HEADER: &str = "X-Measurement-Id";

/// Called with the uploaded fraction in `0.0..=1.0`
pub type UploadProgress = Arc<dyn Fn(f64) + Send + Sync>;

/// Server reply with its body decoded where possible
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Option<serde_json::Value>,
}

impl HttpResponse {
    /// A JSON body is kept for any status. A non-JSON body is tolerated on success and on
    /// conflict; on 400 and 401 it becomes the matching named error, otherwise a parse failure.
    pub fn parse(status: u16, body: &str) -> Result<Self, SyncError> {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
            return Ok(Self {
                status,
                body: Some(json),
            });
        }
        match status {
            200..=299 | 409 => Ok(Self { status, body: None }),
            400 => Err(SyncError::BadRequest(body.to_string())),
            401 => Err(SyncError::Unauthorized(body.to_string())),
            _ => Err(SyncError::MalformedResponse {
                status,
                detail: body.to_string(),
            }),
        }
    }

    fn reason(&self) -> String {
        match &self.body {
            Some(serde_json::Value::Object(map)) => map
                .get("message")
                .or_else(|| map.get("error"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| serde_json::Value::Object(map.clone()).to_string()),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// Accepted upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Created,
    /// The collector already had this measurement
    AlreadyPresent,
}

/// Map a parsed response to an outcome; only 201 and 409 count as delivered
pub fn interpret(response: &HttpResponse) -> Result<UploadOutcome, SyncError> {
    match response.status {
        201 => Ok(UploadOutcome::Created),
        409 => Ok(UploadOutcome::AlreadyPresent),
        400 => Err(SyncError::BadRequest(response.reason())),
        401 => Err(SyncError::Unauthorized(response.reason())),
        status => Err(SyncError::RequestRejected {
            status,
            reason: response.reason(),
        }),
    }
}

/// One measurement ready for transfer
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub endpoint: String,
    pub token: String,
    pub device_id: String,
    pub measurement_id: MeasurementId,
    /// Compressed serialized measurement
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: UploadProgress,
    ) -> Result<UploadOutcome, SyncError>;
}

/// Uploads over HTTP with reqwest, streaming the body in fixed-size chunks
pub struct HttpUploader {
    client: reqwest::Client,
    chunk_bytes: usize,
}

impl HttpUploader {
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.upload_timeout())
            .user_agent(concat!("capture_sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::ClientSetup(e.to_string()))?;

        Ok(Self {
            client,
            chunk_bytes: config.upload_chunk_bytes.max(1),
        })
    }
}

fn measurements_url(endpoint: &str) -> String {
    format!("{}/measurements", endpoint.trim_end_matches('/'))
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: UploadProgress,
    ) -> Result<UploadOutcome, SyncError> {
        let total = request.body.len().max(1);
        let chunks: Vec<Vec<u8>> = request
            .body
            .chunks(self.chunk_bytes)
            .map(<[u8]>::to_vec)
            .collect();

        let listener = progress.clone();
        let mut sent = 0usize;
        let body = stream::iter(chunks.into_iter().map(move |chunk| {
            let started = sent as f64 / total as f64;
            sent += chunk.len();
            listener(started);
            Ok::<_, std::io::Error>(chunk)
        }));

        let url = measurements_url(&request.endpoint);
        log::debug!(
            "Uploading measurement {} ({} bytes) to {}",
            request.measurement_id,
            request.body.len(),
            url
        );
        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", request.token))
            .header(DEVICE_ID_HEADER, &request.device_id)
            .header(MEASUREMENT_ID_HEADER, request.measurement_id.to_string())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(|e| SyncError::RemoteUnreachable(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| SyncError::RemoteUnreachable(format!("Failed to read response: {}", e)))?;
        let outcome = interpret(&HttpResponse::parse(status, &text)?)?;
        progress(1.0);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use crate::config::StorageConfig;
    use crate::model::{GeoLocation, MeasurementStatus, Vehicle};
    use crate::preferences::{
        MemoryPreferences, DEVICE_IDENTIFIER_KEY, SYNC_ENDPOINT_URL_SETTINGS_KEY,
    };
    use crate::storage::MeasurementStore;
    use crate::sync::{StaticCredentials, SyncEngine, SyncProgress};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[test]
    fn test_parse_keeps_json_bodies() {
        let response = HttpResponse::parse(400, r#"{"message": "invalid version"}"#).unwrap();
        assert_eq!(response.status, 400);
        assert!(matches!(
            interpret(&response),
            Err(SyncError::BadRequest(reason)) if reason == "invalid version"
        ));
    }

    #[test]
    fn test_parse_non_json_bodies() {
        assert_eq!(HttpResponse::parse(201, "").unwrap().body, None);
        assert!(matches!(HttpResponse::parse(400, "nope"), Err(SyncError::BadRequest(_))));
        assert!(matches!(HttpResponse::parse(401, "nope"), Err(SyncError::Unauthorized(_))));
        assert!(matches!(
            HttpResponse::parse(500, "<html>"),
            Err(SyncError::MalformedResponse { status: 500, .. })
        ));
    }

    #[test]
    fn test_interpret_statuses() {
        let response = |status| HttpResponse { status, body: None };
        assert_eq!(interpret(&response(201)).unwrap(), UploadOutcome::Created);
        assert_eq!(interpret(&response(409)).unwrap(), UploadOutcome::AlreadyPresent);
        assert!(matches!(
            interpret(&response(503)),
            Err(SyncError::RequestRejected { status: 503, .. })
        ));
        assert!(interpret(&response(200)).is_err());
    }

    #[test]
    fn test_measurements_url_joins_cleanly() {
        assert_eq!(measurements_url("http://host/api/"), "http://host/api/measurements");
        assert_eq!(measurements_url("http://host/api"), "http://host/api/measurements");
    }

    #[derive(Clone, Default)]
    struct Received {
        requests: Arc<Mutex<Vec<(HeaderMap, Vec<u8>)>>>,
        /// Statuses answered in order before falling back to the per-id answers
        scripted: Arc<Mutex<VecDeque<StatusCode>>>,
    }

    async fn collect(
        State(received): State<Received>,
        headers: HeaderMap,
        body: axum::body::Bytes,
    ) -> (StatusCode, String) {
        let scripted = received.scripted.lock().unwrap().pop_front();
        let id = headers.get(MEASUREMENT_ID_HEADER).and_then(|v| v.to_str().ok());
        let status = match (scripted, id) {
            (Some(status), _) => status,
            (None, Some("2")) => StatusCode::CONFLICT,
            (None, Some("3")) => StatusCode::BAD_REQUEST,
            _ => StatusCode::CREATED,
        };
        received.requests.lock().unwrap().push((headers, body.to_vec()));
        (status, String::new())
    }

    async fn serve(received: Received) -> String {
        let app = Router::new()
            .route("/api/measurements", post(collect))
            .with_state(received);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/api", addr)
    }

    fn request(endpoint: &str, id: u64, body: Vec<u8>) -> UploadRequest {
        UploadRequest {
            endpoint: endpoint.to_string(),
            token: "secret".to_string(),
            device_id: "device-7".to_string(),
            measurement_id: MeasurementId(id),
            body,
        }
    }

    #[tokio::test]
    async fn test_upload_streams_body_with_headers() {
        let received = Received::default();
        let endpoint = serve(received.clone()).await;
        let uploader = HttpUploader::new(&SyncConfig {
            upload_chunk_bytes: 10,
            ..SyncConfig::default()
        })
        .unwrap();
        let fractions = Arc::new(Mutex::new(Vec::new()));
        let sink = fractions.clone();
        let progress: UploadProgress = Arc::new(move |f| sink.lock().unwrap().push(f));

        let body: Vec<u8> = (0..35u8).collect();
        let outcome = uploader
            .upload(request(&endpoint, 1, body.clone()), progress)
            .await
            .unwrap();

        assert_eq!(outcome, UploadOutcome::Created);
        let requests = received.requests.lock().unwrap();
        let (headers, uploaded) = &requests[0];
        assert_eq!(uploaded, &body);
        assert_eq!(headers["authorization"], "Bearer secret");
        assert_eq!(headers["x-device-id"], "device-7");
        assert_eq!(headers["x-measurement-id"], "1");

        let fractions = fractions.lock().unwrap();
        assert_eq!(fractions.len(), 5);
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(fractions.last(), Some(&1.0));
    }

    #[tokio::test]
    async fn test_upload_maps_conflict_and_rejection() {
        let endpoint = serve(Received::default()).await;
        let uploader = HttpUploader::new(&SyncConfig::default()).unwrap();
        let progress: UploadProgress = Arc::new(|_| {});

        let conflict = uploader
            .upload(request(&endpoint, 2, vec![1, 2, 3]), progress.clone())
            .await
            .unwrap();
        assert_eq!(conflict, UploadOutcome::AlreadyPresent);

        let rejected = uploader
            .upload(request(&endpoint, 3, vec![1, 2, 3]), progress)
            .await
            .unwrap_err();
        assert!(matches!(rejected, SyncError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_unreachable_collector() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = HttpUploader::new(&SyncConfig::default())
            .unwrap()
            .upload(request(&endpoint, 1, vec![0]), Arc::new(|_| {}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RemoteUnreachable(_)));
    }

    fn store_with_finished(count: usize) -> (Arc<MeasurementStore>, Vec<MeasurementId>) {
        let store = Arc::new(MeasurementStore::open_in_memory(&StorageConfig::default()).unwrap());
        let ids = (0..count)
            .map(|n| {
                let id = store.create_measurement(Vehicle::Car).unwrap();
                store
                    .append_locations(id, &[GeoLocation::new(1_000 + n as i64, 51.0, 13.0, 2.0, 5.0)])
                    .unwrap();
                store.set_status(id, MeasurementStatus::Finished).unwrap();
                id
            })
            .collect();
        (store, ids)
    }

    fn collector_engine(store: &Arc<MeasurementStore>, endpoint: &str) -> SyncEngine {
        let preferences = MemoryPreferences::new()
            .with(SYNC_ENDPOINT_URL_SETTINGS_KEY, endpoint)
            .with(DEVICE_IDENTIFIER_KEY, "device-7");
        SyncEngine::new(
            store.clone(),
            Arc::new(preferences),
            Arc::new(StaticCredentials(Some("secret".to_string()))),
            Arc::new(HttpUploader::new(&SyncConfig::default()).unwrap()),
            SyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_cycle_against_collector_syncs_and_purges() {
        let received = Received::default();
        let endpoint = serve(received.clone()).await;
        let (store, ids) = store_with_finished(1);

        let report = collector_engine(&store, &endpoint)
            .run_cycle("alice", Arc::new(|_: SyncProgress| {}))
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.synced, ids);
        assert!(report.already_present.is_empty());
        assert_eq!(store.load_status(ids[0]).unwrap(), MeasurementStatus::Synced);
        assert_eq!(store.count_locations(ids[0]).unwrap(), 0);

        let requests = received.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0["authorization"], "Bearer secret");
        assert!(!requests[0].1.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_against_collector_stops_at_bad_request() {
        let received = Received::default();
        received
            .scripted
            .lock()
            .unwrap()
            .push_back(StatusCode::BAD_REQUEST);
        let endpoint = serve(received.clone()).await;
        let (store, ids) = store_with_finished(2);

        let report = collector_engine(&store, &endpoint)
            .run_cycle("alice", Arc::new(|_: SyncProgress| {}))
            .await
            .unwrap();

        let failure = report.aborted.unwrap();
        assert_eq!(failure.measurement_id, ids[0]);
        assert!(matches!(failure.error, SyncError::BadRequest(_)));
        assert!(report.synced.is_empty());
        assert_eq!(received.requests.lock().unwrap().len(), 1);
        for id in ids {
            assert_eq!(store.load_status(id).unwrap(), MeasurementStatus::Finished);
            assert_eq!(store.count_locations(id).unwrap(), 1);
        }
    }
}
