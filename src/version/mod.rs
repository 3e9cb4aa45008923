use crate::protocol::ProtocolVersion;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

/// Bundled protocol version, used whenever the lookup fails.
pub const DEFAULT_VERSION: ProtocolVersion = ProtocolVersion([2, 3000, 1027934701]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: ProtocolVersion,
    pub is_latest: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("http error: {0}")]
    Http(#[source] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[source] serde_json::Error),
    #[error("api error {}: {body}", .status.as_u16())]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: [u32; 3],
}

/// Never fails: an unreachable or malformed endpoint yields the bundled
/// default with `is_latest = false`.
pub async fn fetch_latest(url: &str, timeout: Duration) -> VersionInfo {
    match try_fetch(url, timeout).await {
        Ok(version) => VersionInfo {
            version,
            is_latest: true,
        },
        Err(err) => {
            tracing::warn!(error = %err, url, "protocol version lookup failed, using bundled default");
            VersionInfo {
                version: DEFAULT_VERSION,
                is_latest: false,
            }
        }
    }
}

async fn try_fetch(url: &str, timeout: Duration) -> Result<ProtocolVersion, VersionError> {
    let http = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(VersionError::Http)?;
    let resp = http.get(url).send().await.map_err(VersionError::Http)?;
    let status = resp.status();
    let body = resp.text().await.map_err(VersionError::Http)?;
    parse_version_response(status, &body)
}

fn parse_version_response(status: StatusCode, body: &str) -> Result<ProtocolVersion, VersionError> {
    if !status.is_success() {
        return Err(VersionError::Api {
            status,
            body: body.chars().take(200).collect(),
        });
    }
    let parsed: VersionResponse = serde_json::from_str(body).map_err(VersionError::Json)?;
    Ok(ProtocolVersion(parsed.version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_version_triplet() {
        let version =
            parse_version_response(StatusCode::OK, r#"{"version":[2,3000,1015901307]}"#).unwrap();
        assert_eq!(version, ProtocolVersion([2, 3000, 1015901307]));
    }

    #[test]
    fn rejects_non_success_status() {
        let err = parse_version_response(StatusCode::NOT_FOUND, "missing").unwrap_err();
        assert_eq!(err.to_string(), "api error 404: missing");
    }

    #[test]
    fn rejects_short_version_array() {
        let err = parse_version_response(StatusCode::OK, r#"{"version":[2,3000]}"#).unwrap_err();
        assert!(matches!(err, VersionError::Json(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn unreachable_endpoint_falls_back_to_default() {
        let info = fetch_latest("http://127.0.0.1:1/version.json", Duration::from_millis(200)).await;
        assert_eq!(
            info,
            VersionInfo {
                version: DEFAULT_VERSION,
                is_latest: false
            }
        );
    }
}
