use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::model::{MeasurementId, MeasurementStatus};
use crate::preferences::{Preferences, DEVICE_IDENTIFIER_KEY, SYNC_ENDPOINT_URL_SETTINGS_KEY};
use crate::serializer::MeasurementSerializer;
use crate::storage::MeasurementStore;
use crate::sync::http::{UploadOutcome, UploadProgress, UploadRequest, Uploader};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Source of bearer tokens for an account
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// `None` if the account has no valid token
    async fn auth_token(&self, account: &str) -> Option<String>;
}

/// Credential provider holding one fixed token
pub struct StaticCredentials(pub Option<String>);

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn auth_token(&self, _account: &str) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub measurement_id: MeasurementId,
    pub fraction: f64,
}

pub type ProgressListener = Arc<dyn Fn(SyncProgress) + Send + Sync>;

/// The measurement a cycle stopped at
#[derive(Debug)]
pub struct SyncFailure {
    pub measurement_id: MeasurementId,
    pub error: SyncError,
}

/// Result of one cycle that got past its preconditions
#[derive(Debug, Default)]
pub struct SyncReport {
    pub synced: Vec<MeasurementId>,
    /// Subset of `synced` the collector already had
    pub already_present: Vec<MeasurementId>,
    /// Set if the cycle was cut short; later measurements were not attempted
    pub aborted: Option<SyncFailure>,
}

impl SyncReport {
    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }
}

/// Uploads every finished measurement and reconciles local state with the answers
pub struct SyncEngine {
    store: Arc<MeasurementStore>,
    preferences: Arc<dyn Preferences>,
    credentials: Arc<dyn CredentialProvider>,
    uploader: Arc<dyn Uploader>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        store: Arc<MeasurementStore>,
        preferences: Arc<dyn Preferences>,
        credentials: Arc<dyn CredentialProvider>,
        uploader: Arc<dyn Uploader>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            preferences,
            credentials,
            uploader,
            config,
        }
    }

    /// Run one cycle. Missing credentials or settings fail the whole cycle before any
    /// work; a failure on one measurement ends the cycle and is recorded in the report.
    pub async fn run_cycle(
        &self,
        account: &str,
        progress: ProgressListener,
    ) -> Result<SyncReport, SyncError> {
        let token = self.token(account).await?;
        let endpoint = self
            .preferences
            .get_string(SYNC_ENDPOINT_URL_SETTINGS_KEY)
            .ok_or(SyncError::EndpointUnconfigured)?;
        let device_id = self
            .preferences
            .get_string(DEVICE_IDENTIFIER_KEY)
            .ok_or(SyncError::DeviceIdUnconfigured)?;

        let syncable = self.store.load_syncable()?;
        log::info!("Sync cycle for {} measurements", syncable.len());

        let mut report = SyncReport::default();
        for id in syncable {
            match self.sync_one(id, &endpoint, &token, &device_id, &progress).await {
                Ok(outcome) => {
                    if outcome == UploadOutcome::AlreadyPresent {
                        report.already_present.push(id);
                    }
                    report.synced.push(id);
                }
                Err(error) => {
                    log::warn!("Sync of measurement {} failed, ending cycle: {}", id, error);
                    report.aborted = Some(SyncFailure {
                        measurement_id: id,
                        error,
                    });
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn token(&self, account: &str) -> Result<String, SyncError> {
        let timeout = self.config.credential_timeout();
        match tokio::time::timeout(timeout, self.credentials.auth_token(account)).await {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(SyncError::CredentialUnavailable(format!(
                "no token for account {}",
                account
            ))),
            Err(_) => Err(SyncError::CredentialUnavailable(format!(
                "token request timed out after {} ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn sync_one(
        &self,
        id: MeasurementId,
        endpoint: &str,
        token: &str,
        device_id: &str,
        progress: &ProgressListener,
    ) -> Result<UploadOutcome, SyncError> {
        let store = self.store.clone();
        let body = tokio::task::spawn_blocking(move || {
            MeasurementSerializer::new(&store).to_compressed_bytes(id)
        })
        .await
        .map_err(|e| SyncError::Serialization(std::io::Error::other(e.to_string())))??;

        let listener = progress.clone();
        let upload_progress: UploadProgress = Arc::new(move |fraction| {
            listener(SyncProgress {
                measurement_id: id,
                fraction,
            })
        });
        let request = UploadRequest {
            endpoint: endpoint.to_string(),
            token: token.to_string(),
            device_id: device_id.to_string(),
            measurement_id: id,
            body,
        };
        let outcome = self.uploader.upload(request, upload_progress).await?;

        let deleted = self.store.clean_measurement(id)?;
        self.store.set_status(id, MeasurementStatus::Synced)?;
        log::info!(
            "Synced measurement {} ({:?}, {} points purged)",
            id,
            outcome,
            deleted
        );
        Ok(outcome)
    }
}
