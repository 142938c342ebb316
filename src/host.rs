//! Image hosting backends.
//!
//! A backend takes a local file and returns the three URLs of the hosted
//! image, or a classified [`UploadError`]. The HTTP backend covers hosts with a
//! multipart form endpoint and a JSON response; everything about the request
//! and response layout comes from [`HostConfig`].

use crate::{Config, HostConfig, ScreensError, UploadError};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedImage {
    pub img_url: String,
    pub raw_url: String,
    pub web_url: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageHost: Send + Sync {
    async fn upload(&self, path: &Path) -> Result<HostedImage, UploadError>;
}

pub struct HttpImageHost {
    client: reqwest::Client,
    config: HostConfig,
}

impl HttpImageHost {
    pub fn new(config: HostConfig, timeout: Duration) -> Result<Self, ScreensError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("release-screens/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ScreensError::ConfigurationError(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn form(&self, file_name: String, bytes: Vec<u8>) -> Result<Form, UploadError> {
        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/png")
            .map_err(|e| UploadError::transient(e.to_string()))?;

        let mut form = Form::new().part(self.config.file_field.clone(), part);
        for (name, value) in &self.config.form_fields {
            form = form.text(name.clone(), value.clone());
        }
        if let (Some(key), None) = (&self.config.api_key, &self.config.api_key_header) {
            form = form.text(self.config.api_key_field.clone(), key.clone());
        }
        Ok(form)
    }
}

#[async_trait]
impl ImageHost for HttpImageHost {
    async fn upload(&self, path: &Path) -> Result<HostedImage, UploadError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| UploadError::transient(format!("cannot read {}: {}", path.display(), e)))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "screenshot.png".to_string());

        let mut request = self
            .client
            .post(&self.config.endpoint)
            .multipart(self.form(file_name, bytes)?);
        if let (Some(key), Some(header)) = (&self.config.api_key, &self.config.api_key_header) {
            request = request.header(header.as_str(), key.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                UploadError::transient(format!("request timed out: {e}"))
            } else {
                UploadError::transient(format!("request failed: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| UploadError::transient(format!("response body unreadable: {e}")))?;
        debug!("{} answered {} for {}", self.config.name, status, path.display());

        if let Some(error) = classify_response(status, &body, &self.config.duplicate_markers) {
            return Err(error);
        }
        parse_hosted_image(&body, &self.config)
    }
}

/// Maps a host response to a failure kind, or `None` for a success status.
///
/// 401 and 403 are credential failures; 409 or a configured duplicate marker in
/// the body means the content is already hosted; every other failure is
/// treated as transient.
pub fn classify_response(status: u16, body: &str, duplicate_markers: &[String]) -> Option<UploadError> {
    let lowered = body.to_lowercase();
    let duplicate = status == 409
        || duplicate_markers
            .iter()
            .any(|marker| !marker.is_empty() && lowered.contains(&marker.to_lowercase()));

    match status {
        401 | 403 => Some(UploadError::auth(format!("HTTP {status}: {}", snippet(body)))),
        _ if duplicate => Some(UploadError::duplicate(format!("HTTP {status}: {}", snippet(body)))),
        200..=299 => None,
        _ => Some(UploadError::transient(format!("HTTP {status}: {}", snippet(body)))),
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(200) {
        Some((end, _)) => format!("{}...", &trimmed[..end]),
        None => trimmed.to_string(),
    }
}

/// Reads the three URLs out of a JSON response through the host's pointers.
///
/// Only the full-size URL is mandatory; the thumbnail and viewer URLs fall back
/// to it.
pub fn parse_hosted_image(body: &str, host: &HostConfig) -> Result<HostedImage, UploadError> {
    let json: Value = serde_json::from_str(body)
        .map_err(|e| UploadError::transient(format!("malformed response: {e}")))?;

    let lookup = |pointer: &str| {
        json.pointer(pointer)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let raw_url = lookup(&host.response.raw_url).ok_or_else(|| {
        UploadError::transient(format!(
            "response has no image URL at {}",
            host.response.raw_url
        ))
    })?;

    Ok(HostedImage {
        img_url: lookup(&host.response.img_url).unwrap_or_else(|| raw_url.clone()),
        web_url: lookup(&host.response.web_url).unwrap_or_else(|| raw_url.clone()),
        raw_url,
    })
}

/// Backends by host name.
#[derive(Clone, Default)]
pub struct HostRegistry {
    hosts: HashMap<String, Arc<dyn ImageHost>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One HTTP backend per configured host.
    pub fn from_config(config: &Config) -> Result<Self, ScreensError> {
        let mut registry = Self::new();
        for host in &config.hosts {
            let backend = HttpImageHost::new(host.clone(), config.upload.unit_timeout)?;
            registry.insert(host.name.clone(), Arc::new(backend));
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: impl Into<String>, host: Arc<dyn ImageHost>) {
        self.hosts.insert(name.into(), host);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ImageHost>> {
        self.hosts.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hosts.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ResponseMapping, UploadFailureKind};
    use std::collections::BTreeMap;

    fn host_config() -> HostConfig {
        HostConfig {
            name: "alpha".to_string(),
            endpoint: "https://alpha.example/api/1/upload".to_string(),
            api_key: Some("secret".to_string()),
            api_key_field: "key".to_string(),
            api_key_header: None,
            file_field: "image".to_string(),
            form_fields: BTreeMap::new(),
            response: ResponseMapping::default(),
            max_concurrency: None,
            min_image_size: None,
            max_image_size: None,
            duplicate_markers: vec!["Duplicated upload".to_string()],
            domains: vec!["alpha.example".to_string()],
        }
    }

    #[test]
    fn test_response_classification() {
        let markers = vec!["duplicated upload".to_string()];
        assert!(classify_response(200, "{}", &markers).is_none());
        assert_eq!(
            classify_response(401, "bad key", &markers).unwrap().kind,
            UploadFailureKind::AuthFailure
        );
        assert_eq!(
            classify_response(403, "", &markers).unwrap().kind,
            UploadFailureKind::AuthFailure
        );
        assert_eq!(
            classify_response(409, "", &markers).unwrap().kind,
            UploadFailureKind::Duplicate
        );
        assert_eq!(
            classify_response(400, "Error: Duplicated upload", &markers).unwrap().kind,
            UploadFailureKind::Duplicate
        );
        assert_eq!(
            classify_response(503, "try later", &markers).unwrap().kind,
            UploadFailureKind::Transient
        );
        assert_eq!(
            classify_response(400, "bad request", &markers).unwrap().kind,
            UploadFailureKind::Transient
        );
    }

    #[test]
    fn test_parse_response_with_pointers() {
        let body = r#"{"data": {
            "url_viewer": "https://alpha.example/v/abc",
            "image": {"url": "https://i.alpha.example/abc.png"},
            "thumb": {"url": "https://i.alpha.example/abc.th.png"}
        }}"#;
        let image = parse_hosted_image(body, &host_config()).unwrap();
        assert_eq!(image.raw_url, "https://i.alpha.example/abc.png");
        assert_eq!(image.img_url, "https://i.alpha.example/abc.th.png");
        assert_eq!(image.web_url, "https://alpha.example/v/abc");
    }

    #[test]
    fn test_parse_response_fallbacks_and_errors() {
        let body = r#"{"data": {"image": {"url": "https://i.alpha.example/x.png"}}}"#;
        let image = parse_hosted_image(body, &host_config()).unwrap();
        assert_eq!(image.img_url, image.raw_url);
        assert_eq!(image.web_url, image.raw_url);

        let missing = parse_hosted_image(r#"{"data": {}}"#, &host_config()).unwrap_err();
        assert_eq!(missing.kind, UploadFailureKind::Transient);
        assert!(parse_hosted_image("<html>", &host_config()).is_err());
    }

    #[test]
    fn test_registry_from_config() {
        let config = Config {
            hosts: vec![host_config()],
            ..Default::default()
        };
        let registry = HostRegistry::from_config(&config).unwrap();
        assert!(registry.contains("alpha"));
        assert!(registry.get("beta").is_none());
    }

    #[tokio::test]
    async fn test_unreadable_file_is_transient() {
        let host = HttpImageHost::new(host_config(), Duration::from_secs(1)).unwrap();
        let error = host
            .upload(Path::new("/definitely/missing.png"))
            .await
            .unwrap_err();
        assert_eq!(error.kind, UploadFailureKind::Transient);
    }
}
