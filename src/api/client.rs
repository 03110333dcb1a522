//! HTTP implementation of the [`Backend`] trait.

use super::{ApiError, Backend, Record};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Wire shapes. Collections come back as `{ "data": [...] }`, single
/// items as `{ "data": {...} }`.
#[derive(Debug, Deserialize)]
struct CollectionResponse {
    data: Vec<Record>,
}

#[derive(Debug, Deserialize)]
struct ItemResponse {
    data: Record,
}

pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpBackend {
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent("roster-sync/0.1")
            .build()
            .map_err(ApiError::Http)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.base_url, collection)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_collection(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Vec<Record>, ApiError> {
        let response = request.send().await.map_err(ApiError::Http)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        let body = response.bytes().await.map_err(ApiError::Http)?;
        let parsed: CollectionResponse = serde_json::from_slice(&body)?;
        Ok(parsed.data)
    }
}

impl Backend for HttpBackend {
    async fn find_first(
        &self,
        collection: &str,
        filters: &[(&str, &str)],
    ) -> Result<Option<Record>, ApiError> {
        let mut query: Vec<(String, String)> = filters
            .iter()
            .map(|(field, value)| (format!("filters[{field}][$eq]"), value.to_string()))
            .collect();
        query.push(("pagination[limit]".to_string(), "1".to_string()));

        let request = self
            .authorize(self.http.get(self.collection_url(collection)))
            .query(&query);
        let mut records = self.read_collection(request).await?;
        Ok(if records.is_empty() {
            None
        } else {
            Some(records.swap_remove(0))
        })
    }

    async fn find_page(
        &self,
        collection: &str,
        page: u32,
        page_size: u32,
        fields: &[&str],
    ) -> Result<Vec<Record>, ApiError> {
        let query = [
            ("pagination[page]".to_string(), page.to_string()),
            ("pagination[pageSize]".to_string(), page_size.to_string()),
            ("fields".to_string(), fields.join(",")),
        ];

        let request = self
            .authorize(self.http.get(self.collection_url(collection)))
            .query(&query);
        self.read_collection(request).await
    }

    async fn create(
        &self,
        collection: &str,
        data: serde_json::Value,
    ) -> Result<Record, ApiError> {
        let request = self
            .authorize(self.http.post(self.collection_url(collection)))
            .json(&json!({ "data": data }));

        let response = request.send().await.map_err(ApiError::Http)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // The only place conflict classification happens: the
            // backend's duplicate-key payload mentions its unique
            // constraint by name.
            if body.to_ascii_lowercase().contains("unique") {
                return Err(ApiError::Conflict {
                    collection: collection.to_string(),
                    message: body,
                });
            }
            return Err(ApiError::Status { status, body });
        }

        let body = response.bytes().await.map_err(ApiError::Http)?;
        let parsed: ItemResponse = serde_json::from_slice(&body)?;
        Ok(parsed.data)
    }
}
