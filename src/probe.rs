//! Header-only request that learns the resource size before planning.

use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, LOCATION};
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use crate::config::{authorize, Credentials};
use crate::error::{DownloadError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Resolved { total_bytes: u64, range_supported: bool },
    /// The remote moved the resource; the whole job restarts there.
    Redirect(Url),
}

/// Issues `HEAD url` with the job's authentication header.
#[instrument(level = "debug", skip_all, fields(url = %url))]
pub async fn probe(client: &Client, url: &Url, credentials: Option<&Credentials>) -> Result<ProbeOutcome> {
    let response = authorize(client.head(url.clone()), credentials)
        .send()
        .await
        .map_err(|e| DownloadError::Probe {
            url: url.to_string(),
            detail: e.to_string(),
        })?;

    let status = response.status();
    if status.is_redirection() {
        let target = redirect_target(url, response.headers())?;
        debug!(%target, "probe redirected");
        return Ok(ProbeOutcome::Redirect(target));
    }
    if is_auth_challenge(status) {
        return Err(DownloadError::AuthRequired {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    if !status.is_success() {
        return Err(DownloadError::Probe {
            url: url.to_string(),
            detail: format!("HTTP {}", status),
        });
    }

    let headers = response.headers();
    let total_bytes = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| DownloadError::Probe {
            url: url.to_string(),
            detail: "no usable Content-Length in response".to_string(),
        })?;
    let range_supported = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
        .unwrap_or(false);

    debug!(total_bytes, range_supported, "probe resolved");
    Ok(ProbeOutcome::Resolved {
        total_bytes,
        range_supported,
    })
}

pub(crate) fn is_auth_challenge(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
}

/// Resolves the `Location` header of a 3xx against the request URL.
pub(crate) fn redirect_target(base: &Url, headers: &HeaderMap) -> Result<Url> {
    let location = headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| DownloadError::Redirect {
            url: base.to_string(),
            detail: "missing Location header".to_string(),
        })?;
    base.join(location).map_err(|e| DownloadError::Redirect {
        url: base.to_string(),
        detail: format!("bad Location {:?}: {}", location, e),
    })
}
