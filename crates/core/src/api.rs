//! Authenticated HTTP client for the recording service.
//!
//! A session is established by posting the worker's credentials; the bearer
//! token's lifetime is read from its payload claims (without signature
//! verification) and refreshed a safety margin before the server would
//! reject it. Every request retries exactly once on 401; the retry never
//! applies to the credential POST itself.

use std::path::Path;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, warn};

use crate::types::{Job, ProcessingState, RatThreshold, RecordingType, TrackInfo};

const TIMEOUT: Duration = Duration::from_secs(60);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Re-authenticate this long before the claimed expiry so requests in
/// flight never race the server-side cutoff.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);
/// Assumed token lifetime when the payload claims cannot be read.
const FALLBACK_LIFETIME: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Whether this error is a transient network/service failure, as opposed
    /// to a request the service actively rejected.
    pub fn is_network(&self) -> bool {
        match self {
            ApiError::Transport(_) | ApiError::Io(_) => true,
            ApiError::Status { status, .. } => status.is_server_error(),
            ApiError::InvalidUrl(_) => false,
        }
    }
}

/// One authenticated session against the recording service.
///
/// Sessions are per worker and never shared across tasks; the token and its
/// deadline live behind `&mut self`.
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    user: String,
    password: String,
    token: String,
    token_deadline: Instant,
}

impl ApiClient {
    /// Build a client and perform the initial login.
    pub async fn connect(api_url: &str, user: &str, password: &str) -> Result<Self, ApiError> {
        let base = Url::parse(api_url)
            .map_err(|err| ApiError::InvalidUrl(format!("{api_url}: {err}")))?;
        let http = reqwest::Client::builder().timeout(TIMEOUT).build()?;
        let mut client = Self {
            http,
            base,
            user: user.to_string(),
            password: password.to_string(),
            token: String::new(),
            token_deadline: Instant::now(),
        };
        client.authenticate().await?;
        Ok(client)
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|err| ApiError::InvalidUrl(format!("{path}: {err}")))
    }

    async fn authenticate(&mut self) -> Result<(), ApiError> {
        let requested_at = Instant::now();
        let url = self.url("api/v1/users/authenticate")?;
        let res = self
            .http
            .post(url)
            .form(&[
                ("email", self.user.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await?;
        let res = check_status(res).await?;

        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }
        let body: TokenResponse = res.json().await?;

        let lifetime = token_lifetime(&body.token).unwrap_or_else(|| {
            warn!(
                "could not read token expiry claims, assuming {}s",
                FALLBACK_LIFETIME.as_secs()
            );
            FALLBACK_LIFETIME
        });
        self.token = body.token;
        self.token_deadline = requested_at + lifetime.saturating_sub(EXPIRY_MARGIN);
        debug!(lifetime_secs = lifetime.as_secs(), "authenticated");
        Ok(())
    }

    async fn ensure_token(&mut self) -> Result<(), ApiError> {
        if Instant::now() >= self.token_deadline {
            debug!("token deadline passed, re-authenticating");
            self.authenticate().await?;
        }
        Ok(())
    }

    /// Send an authenticated request, re-authenticating and retrying exactly
    /// once if the service answers 401.
    async fn send<F>(&mut self, build: F) -> Result<reqwest::Response, ApiError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        self.ensure_token().await?;
        let res = build(&self.http, &self.token).send().await?;
        if res.status() != StatusCode::UNAUTHORIZED {
            return check_status(res).await;
        }

        warn!("request rejected with 401 before the token deadline, re-authenticating");
        self.authenticate().await?;
        let res = build(&self.http, &self.token).send().await?;
        check_status(res).await
    }

    /// Ask the processing queue for the next job of the given type/state.
    /// `204 No Content` means the queue is empty.
    pub async fn next_job(
        &mut self,
        kind: RecordingType,
        state: ProcessingState,
    ) -> Result<Option<Job>, ApiError> {
        let url = self.url("api/v1/processing")?;
        let res = self
            .send(|http, token| {
                http.get(url.clone())
                    .header("Authorization", token)
                    .query(&[("type", kind.as_str()), ("state", state.as_str())])
            })
            .await?;
        if res.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(res.json().await?))
    }

    /// Report a job as completed, optionally replacing the processed file
    /// and applying recording field updates.
    pub async fn report_done(
        &mut self,
        recording_id: u64,
        job_key: &str,
        new_file_key: Option<&str>,
        new_mime_type: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<(), ApiError> {
        let mut field_updates = metadata.unwrap_or_else(|| json!({}));
        if let Some(mime) = new_mime_type {
            if let Some(map) = field_updates.as_object_mut() {
                map.insert("fileMimeType".to_string(), json!(mime));
            }
        }
        let mut form = vec![
            ("id", recording_id.to_string()),
            ("jobKey", job_key.to_string()),
            ("success", "true".to_string()),
            ("complete", "true".to_string()),
            ("result", json!({ "fieldUpdates": field_updates }).to_string()),
        ];
        if let Some(key) = new_file_key {
            form.push(("newProcessedFileKey", key.to_string()));
        }
        let url = self.url("api/v1/processing")?;
        self.send(|http, token| {
            http.put(url.clone())
                .header("Authorization", token)
                .form(&form)
        })
        .await?;
        Ok(())
    }

    /// Report a job as failed; the service requeues it.
    pub async fn report_failed(&mut self, recording_id: u64, job_key: &str) -> Result<(), ApiError> {
        let form = [
            ("id", recording_id.to_string()),
            ("jobKey", job_key.to_string()),
            ("success", "false".to_string()),
            ("complete", "false".to_string()),
        ];
        let url = self.url("api/v1/processing")?;
        self.send(|http, token| {
            http.put(url.clone())
                .header("Authorization", token)
                .form(&form)
        })
        .await?;
        Ok(())
    }

    /// Stream the raw artifact behind a signed download token to `dest`.
    pub async fn download_file(&self, jwt: &str, dest: &Path) -> Result<(), ApiError> {
        let url = self.url("api/v1/signedUrl")?;
        let res = self
            .http
            .get(url)
            .query(&[("jwt", jwt)])
            .timeout(DOWNLOAD_TIMEOUT)
            .send()
            .await?;
        let mut res = check_status(res).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = res.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Upload a processed file; returns the new file key.
    pub async fn upload_file(&mut self, path: &Path) -> Result<String, ApiError> {
        let bytes = tokio::fs::read(path).await?;
        let data = json!({ "fileHash": hex::encode(Sha1::digest(&bytes)) }).to_string();
        let url = self.url("api/v1/processing/processed")?;
        let res = self
            .send(|http, token| {
                let part = reqwest::multipart::Part::bytes(bytes.clone()).file_name("file");
                let form = reqwest::multipart::Form::new()
                    .text("data", data.clone())
                    .part("file", part);
                http.post(url.clone())
                    .header("Authorization", token)
                    .multipart(form)
            })
            .await?;

        #[derive(Deserialize)]
        struct UploadResponse {
            #[serde(rename = "fileKey")]
            file_key: String,
        }
        Ok(res.json::<UploadResponse>().await?.file_key)
    }

    /// Create a track on a recording; returns the assigned track id.
    pub async fn add_track(
        &mut self,
        recording_id: u64,
        track: &Value,
        algorithm_id: i64,
    ) -> Result<u64, ApiError> {
        let form = [
            ("data", track.to_string()),
            ("algorithmId", algorithm_id.to_string()),
        ];
        let url = self.url(&format!("api/v1/processing/{recording_id}/tracks"))?;
        let res = self
            .send(|http, token| {
                http.post(url.clone())
                    .header("Authorization", token)
                    .form(&form)
            })
            .await?;

        #[derive(Deserialize)]
        struct AddTrackResponse {
            #[serde(rename = "trackId")]
            track_id: u64,
        }
        Ok(res.json::<AddTrackResponse>().await?.track_id)
    }

    /// Replace the data of an existing track.
    pub async fn update_track(
        &mut self,
        recording_id: u64,
        track_id: u64,
        track: &Value,
    ) -> Result<(), ApiError> {
        let form = [("data", track.to_string())];
        let url = self.url(&format!("api/v1/processing/{recording_id}/tracks/{track_id}"))?;
        self.send(|http, token| {
            http.post(url.clone())
                .header("Authorization", token)
                .form(&form)
        })
        .await?;
        Ok(())
    }

    /// Archive a track the latest pass no longer supports.
    pub async fn archive_track(&mut self, recording_id: u64, track_id: u64) -> Result<(), ApiError> {
        let url = self.url(&format!(
            "api/v1/processing/{recording_id}/tracks/{track_id}/archive"
        ))?;
        self.send(|http, token| http.post(url.clone()).header("Authorization", token))
            .await?;
        Ok(())
    }

    /// Attach a tag to a track; returns the track-tag id.
    pub async fn add_track_tag(
        &mut self,
        recording_id: u64,
        track_id: u64,
        what: &str,
        confidence: f64,
        data: &Value,
    ) -> Result<u64, ApiError> {
        let form = [
            ("what", what.to_string()),
            ("confidence", confidence.to_string()),
            ("data", data.to_string()),
        ];
        let url = self.url(&format!(
            "api/v1/processing/{recording_id}/tracks/{track_id}/tags"
        ))?;
        let res = self
            .send(|http, token| {
                http.post(url.clone())
                    .header("Authorization", token)
                    .form(&form)
            })
            .await?;

        #[derive(Deserialize)]
        struct AddTagResponse {
            #[serde(rename = "trackTagId")]
            track_tag_id: u64,
        }
        Ok(res.json::<AddTagResponse>().await?.track_tag_id)
    }

    /// List a recording's existing tracks.
    pub async fn get_track_info(&mut self, recording_id: u64) -> Result<Vec<TrackInfo>, ApiError> {
        let url = self.url(&format!("api/v1/recordings/{recording_id}/tracks"))?;
        let res = self
            .send(|http, token| http.get(url.clone()).header("Authorization", token))
            .await?;

        #[derive(Deserialize)]
        struct TracksResponse {
            #[serde(default)]
            tracks: Vec<TrackInfo>,
        }
        Ok(res.json::<TracksResponse>().await?.tracks)
    }

    /// Register an algorithm descriptor; returns its id.
    pub async fn get_algorithm_id(&mut self, algorithm: &Value) -> Result<i64, ApiError> {
        let form = [("algorithm", algorithm.to_string())];
        let url = self.url("api/v1/processing/algorithm")?;
        let res = self
            .send(|http, token| {
                http.post(url.clone())
                    .header("Authorization", token)
                    .form(&form)
            })
            .await?;

        #[derive(Deserialize)]
        struct AlgorithmResponse {
            #[serde(rename = "algorithmId")]
            algorithm_id: i64,
        }
        Ok(res.json::<AlgorithmResponse>().await?.algorithm_id)
    }

    /// Attach a recording-level tag. When `metadata` carries an `event` it
    /// becomes the tag detail; otherwise `label` does.
    pub async fn tag_recording(
        &mut self,
        recording_id: u64,
        label: &str,
        metadata: &Value,
    ) -> Result<(), ApiError> {
        let mut tag: Map<String, Value> = metadata.as_object().cloned().unwrap_or_default();
        tag.insert("automatic".to_string(), json!(true));
        match tag.remove("event") {
            Some(event) => {
                tag.insert("detail".to_string(), event);
            }
            None => {
                tag.insert("detail".to_string(), json!(label));
            }
        }
        let form = [("tag", Value::Object(tag).to_string())];
        let url = self.url(&format!("api/v1/recordings/{recording_id}/tags"))?;
        self.send(|http, token| {
            http.post(url.clone())
                .header("Authorization", token)
                .form(&form)
        })
        .await?;
        Ok(())
    }

    /// The rodent threshold grid configured for a device at a point in time,
    /// when one exists.
    pub async fn get_rat_threshold(
        &mut self,
        device_id: u64,
        at_time: Option<&str>,
    ) -> Result<Option<RatThreshold>, ApiError> {
        let url = self.url(&format!("api/v1/processing/ratthresh/{device_id}"))?;
        let res = self
            .send(|http, token| {
                let req = http.get(url.clone()).header("Authorization", token);
                match at_time {
                    Some(at) => req.query(&[("at-time", at)]),
                    None => req,
                }
            })
            .await?;

        #[derive(Deserialize)]
        struct ThresholdResponse {
            #[serde(rename = "deviceHistoryEntry")]
            device_history_entry: Option<HistoryEntry>,
        }
        #[derive(Deserialize)]
        struct HistoryEntry {
            settings: Option<Settings>,
        }
        #[derive(Deserialize)]
        struct Settings {
            #[serde(rename = "ratThresh")]
            rat_thresh: Option<RatThreshold>,
        }
        let body: ThresholdResponse = res.json().await?;
        Ok(body
            .device_history_entry
            .and_then(|entry| entry.settings)
            .and_then(|settings| settings.rat_thresh))
    }
}

async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let url = res.url().to_string();
    let body = res.text().await.unwrap_or_default();
    Err(ApiError::Status { url, status, body })
}

/// Lifetime claimed by a JWT's payload (`exp - iat`), read without
/// signature verification.
fn token_lifetime(token: &str) -> Option<Duration> {
    let raw = token.strip_prefix("JWT ").unwrap_or(token);
    let payload = raw.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;

    #[derive(Deserialize)]
    struct Claims {
        exp: i64,
        iat: i64,
    }
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    u64::try_from(claims.exp - claims.iat)
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forge_token(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("JWT {header}.{payload}.bogus-signature")
    }

    #[test]
    fn token_lifetime_reads_payload_claims() {
        let token = forge_token(&json!({"exp": 1_700_003_600, "iat": 1_700_000_000}));
        assert_eq!(token_lifetime(&token), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn token_lifetime_rejects_garbage() {
        assert_eq!(token_lifetime("JWT not-a-token"), None);
        assert_eq!(token_lifetime(""), None);

        let expired_before_issued = forge_token(&json!({"exp": 10, "iat": 20}));
        assert_eq!(token_lifetime(&expired_before_issued), None);
    }
}
