//! HTTP implementation of [`DocumentApi`].
//!
//! Targets a generic REST document store:
//!
//! - `POST   {base}/documents` with an `Idempotency-Key` header
//! - `PATCH  {base}/documents/{id}` with an expected-version field
//! - `GET    {base}/documents/{id}`
//! - `DELETE {base}/documents/{id}`
//! - `GET    {base}/collections`
//!
//! Status codes are mapped onto the [`ApiError`] taxonomy here so the
//! dispatcher never sees raw HTTP.

use super::{ApiError, DocumentApi, RemoteCollection};
use crate::model::{DocMeta, RemoteSnapshot};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// reqwest-backed document store client.
pub struct HttpDocumentApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpDocumentApi {
    /// Create a client for the given base URL.
    #[must_use]
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }
}

/// Classify a transport-level failure.
fn classify_send_error(err: &reqwest::Error) -> ApiError {
    // Anything that never produced a response is worth retrying.
    ApiError::Transient(err.to_string())
}

/// Classify a non-success HTTP status.
fn classify_status(status: reqwest::StatusCode, body: &str, expected_version: Option<i64>) -> ApiError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return ApiError::RateLimited;
    }
    if status == reqwest::StatusCode::CONFLICT
        || status == reqwest::StatusCode::PRECONDITION_FAILED
    {
        if let Some(expected) = expected_version {
            return ApiError::Conflict { expected };
        }
    }
    if status.is_server_error() {
        return ApiError::Transient(format!("{status}: {body}"));
    }
    ApiError::Permanent(format!("{status}: {body}"))
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    collection: &'a str,
    title: &'a str,
    content: &'a str,
    metadata: &'a DocMeta,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    title: &'a str,
    content: &'a str,
    metadata: &'a DocMeta,
    expected_version: i64,
}

#[derive(Debug, Deserialize)]
struct DocumentResponse {
    id: String,
    version: i64,
    #[serde(default)]
    modified_at: i64,
    #[serde(default)]
    content_hash: Option<String>,
}

impl From<DocumentResponse> for RemoteSnapshot {
    fn from(doc: DocumentResponse) -> Self {
        Self {
            id: doc.id,
            version: doc.version,
            modified_at: doc.modified_at,
            content_hash: doc.content_hash,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CollectionsResponse {
    collections: Vec<CollectionEntry>,
}

#[derive(Debug, Deserialize)]
struct CollectionEntry {
    id: String,
    name: String,
}

impl DocumentApi for HttpDocumentApi {
    async fn create_document(
        &self,
        collection: &str,
        title: &str,
        content: &str,
        meta: &DocMeta,
        op_key: &str,
    ) -> Result<RemoteSnapshot, ApiError> {
        let request = CreateRequest {
            collection,
            title,
            content,
            metadata: meta,
        };

        let response = self
            .request(reqwest::Method::POST, "/documents")
            .header("Idempotency-Key", op_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, None));
        }

        let doc: DocumentResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Permanent(format!("malformed create response: {e}")))?;
        Ok(doc.into())
    }

    async fn update_document(
        &self,
        id: &str,
        title: &str,
        content: &str,
        meta: &DocMeta,
        expected_version: i64,
    ) -> Result<RemoteSnapshot, ApiError> {
        let request = UpdateRequest {
            title,
            content,
            metadata: meta,
            expected_version,
        };

        let response = self
            .request(reqwest::Method::PATCH, &format!("/documents/{id}"))
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, Some(expected_version)));
        }

        let doc: DocumentResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Permanent(format!("malformed update response: {e}")))?;
        Ok(doc.into())
    }

    async fn get_document(&self, id: &str) -> Result<Option<RemoteSnapshot>, ApiError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/documents/{id}"))
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, None));
        }

        let doc: DocumentResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Permanent(format!("malformed get response: {e}")))?;
        Ok(Some(doc.into()))
    }

    async fn delete_document(&self, id: &str) -> Result<(), ApiError> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/documents/{id}"))
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let status = response.status();
        // Already gone counts as done.
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, None));
        }
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<RemoteCollection>, ApiError> {
        let response = self
            .request(reqwest::Method::GET, "/collections")
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, None));
        }

        let data: CollectionsResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Permanent(format!("malformed collections response: {e}")))?;
        Ok(data
            .collections
            .into_iter()
            .map(|c| RemoteCollection {
                id: c.id,
                name: c.name,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_429_as_rate_limited() {
        let err = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "", None);
        assert!(matches!(err, ApiError::RateLimited));
    }

    #[test]
    fn test_classify_409_as_conflict_on_update() {
        let err = classify_status(reqwest::StatusCode::CONFLICT, "", Some(7));
        assert!(matches!(err, ApiError::Conflict { expected: 7 }));
    }

    #[test]
    fn test_classify_409_without_version_is_permanent() {
        let err = classify_status(reqwest::StatusCode::CONFLICT, "", None);
        assert!(matches!(err, ApiError::Permanent(_)));
    }

    #[test]
    fn test_classify_5xx_as_transient() {
        let err = classify_status(reqwest::StatusCode::BAD_GATEWAY, "upstream", None);
        assert!(matches!(err, ApiError::Transient(_)));
    }

    #[test]
    fn test_classify_4xx_as_permanent() {
        let err = classify_status(reqwest::StatusCode::UNAUTHORIZED, "nope", None);
        assert!(matches!(err, ApiError::Permanent(_)));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let api = HttpDocumentApi::new("https://kb.example.com/api/", None);
        assert_eq!(api.base_url, "https://kb.example.com/api");
    }
}
