use crate::error::{Error, Result};
use std::time::Duration;

/// HTTP client with a bounded timeout so a stalled service cannot hang a caller.
pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Pass 2xx responses through; anything else becomes `Error::HttpError`.
pub(crate) async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::HttpError {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp)
}
