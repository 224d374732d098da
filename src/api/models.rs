use std::time::Duration;

use crate::api::{TagsResponse, VersionResponse};
use crate::core::error::TransportError;
use crate::utils::url::construct_api_url;

pub async fn fetch_version(
    client: &reqwest::Client,
    base_url: &str,
    timeout: Duration,
) -> Result<VersionResponse, TransportError> {
    let url = construct_api_url(base_url, "api/version");
    get_json(client.get(url), "version probe", timeout).await
}

pub fn sort_models(tags: &mut TagsResponse) {
    tags.models.sort_by(|a, b| a.name.cmp(&b.name));
}

/// Sends `request` with a deadline and decodes a JSON body, mapping non-2xx
/// statuses to [`TransportError::Http`].
pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(
    request: reqwest::RequestBuilder,
    operation: &'static str,
    timeout: Duration,
) -> Result<T, TransportError> {
    let response = request
        .timeout(timeout)
        .send()
        .await
        .map_err(|err| TransportError::from_reqwest(err, operation, timeout))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Http {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<T>()
        .await
        .map_err(|err| TransportError::Protocol(format!("{operation}: {err}")))
}
