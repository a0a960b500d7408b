//! Paginated JSON API extraction

use async_trait::async_trait;
use batchflow_common::TabularBatch;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value as Json};
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::Extractor;
use crate::error::{EtlError, EtlResult};
use crate::jobs::HttpSourceParams;
use crate::retry::RetryPolicy;

type Record = Map<String, Json>;

/// Records of one page plus whether the body said it was the last
#[derive(Debug, Default, PartialEq)]
struct Page {
    records: Vec<Record>,
    last: bool,
}

/// Fetches pages sequentially until the source runs dry
#[derive(Debug, Clone)]
pub struct HttpExtractor {
    params: HttpSourceParams,
    client: Client,
    retry: RetryPolicy,
    bearer_token: Option<String>,
}

impl HttpExtractor {
    pub fn new(params: HttpSourceParams, retry: RetryPolicy) -> EtlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(params.timeout_secs))
            .build()
            .map_err(|e| EtlError::config(format!("failed to create HTTP client: {}", e)))?;

        let bearer_token = match &params.bearer_token_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                EtlError::config(format!("bearer token variable {} is not set", var))
            })?),
            None => None,
        };

        Ok(Self {
            params,
            client,
            retry,
            bearer_token,
        })
    }

    async fn fetch_page(&self, page: u64) -> EtlResult<Json> {
        let mut request = self
            .client
            .get(&self.params.endpoint)
            .query(&self.params.query)
            .query(&[
                (self.params.page_param.as_str(), page.to_string()),
                (self.params.size_param.as_str(), self.params.page_size.to_string()),
            ]);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EtlError::Network(format!("page {}: {}", page, e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(EtlError::Network(format!("page {}: HTTP {}", page, status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EtlError::Source {
                status: Some(status.as_u16()),
                message: format!(
                    "{} returned HTTP {} for page {}: {}",
                    self.params.endpoint,
                    status,
                    page,
                    body.chars().take(200).collect::<String>()
                ),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| EtlError::Network(format!("page {}: {}", page, e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EtlError::parse(format!("{} page {}", self.params.endpoint, page), e.to_string()))
    }
}

/// Whether the body carries an explicit end-of-data signal
fn signals_end(body: &Json, pages_fetched: u64) -> bool {
    if body.get("has_more").and_then(Json::as_bool) == Some(false) {
        return true;
    }
    ["pagination", "meta"].iter().any(|key| {
        body.get(key)
            .and_then(|section| section.get("total_pages"))
            .and_then(Json::as_u64)
            .is_some_and(|total| pages_fetched >= total)
    })
}

fn split_page(body: Json, data_key: Option<&str>, pages_fetched: u64, location: &str) -> EtlResult<Page> {
    let last = signals_end(&body, pages_fetched);
    let items = match body {
        Json::Array(items) => items,
        Json::Object(mut object) => {
            let found = match data_key {
                Some(key) => object.remove(key),
                None => object.remove("data").or_else(|| object.remove("results")),
            };
            match found {
                Some(Json::Array(items)) => items,
                Some(_) | None => {
                    return Err(EtlError::parse(
                        location,
                        format!(
                            "expected an array under '{}'",
                            data_key.unwrap_or("data")
                        ),
                    ));
                },
            }
        },
        _ => return Err(EtlError::parse(location, "expected a JSON array or object")),
    };

    let records = items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Json::Object(record) => Ok(record),
            _ => Err(EtlError::parse(location, format!("record {} is not an object", i))),
        })
        .collect::<EtlResult<Vec<_>>>()?;

    Ok(Page { records, last })
}

#[async_trait]
impl Extractor for HttpExtractor {
    #[instrument(skip(self), fields(endpoint = %self.params.endpoint))]
    async fn extract(&self) -> EtlResult<TabularBatch> {
        let mut records: Vec<Record> = Vec::new();
        let mut page = self.params.first_page;
        let mut pages_fetched = 0u64;

        loop {
            let body = self
                .retry
                .run("fetch_page", |_| self.fetch_page(page))
                .await?;
            pages_fetched += 1;

            let location = format!("{} page {}", self.params.endpoint, page);
            let Page { records: page_records, last } =
                split_page(body, self.params.data_key.as_deref(), pages_fetched, &location)?;
            let count = page_records.len();
            records.extend(page_records);
            debug!(page, rows = count, "Fetched page");

            let short = count < self.params.page_size;
            let capped = self.params.max_pages.is_some_and(|max| pages_fetched >= max);
            if count == 0 || short || last || capped {
                break;
            }
            page += 1;
        }

        let batch = TabularBatch::from_json_records(&records)?;
        info!(pages = pages_fetched, rows = batch.len(), "HTTP extraction complete");
        Ok(batch)
    }

    fn describe(&self) -> String {
        format!("http {}", self.params.endpoint)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_locations() {
        let top = split_page(json!([{"a": 1}]), None, 1, "x").unwrap();
        assert_eq!(top.records.len(), 1);

        let results = split_page(json!({"results": [{"a": 1}, {"a": 2}]}), None, 1, "x").unwrap();
        assert_eq!(results.records.len(), 2);

        let keyed = split_page(json!({"items": [{"a": 1}], "data": []}), Some("items"), 1, "x").unwrap();
        assert_eq!(keyed.records.len(), 1);

        assert!(split_page(json!({"other": []}), None, 1, "x").is_err());
        assert!(split_page(json!([1, 2]), None, 1, "x").is_err());
    }

    #[test]
    fn test_end_signals() {
        assert!(signals_end(&json!({"has_more": false, "data": []}), 1));
        assert!(!signals_end(&json!({"has_more": true}), 1));
        assert!(signals_end(&json!({"pagination": {"total_pages": 2}}), 2));
        assert!(!signals_end(&json!({"meta": {"total_pages": 3}}), 2));
        assert!(!signals_end(&json!([]), 5));
    }

    #[test]
    fn test_missing_token_variable() {
        let params: HttpSourceParams = serde_json::from_value(json!({
            "endpoint": "http://localhost/api",
            "page_size": 10,
            "bearer_token_env": "BATCHFLOW_TEST_TOKEN_THAT_IS_NEVER_SET"
        }))
        .unwrap();
        let err = HttpExtractor::new(params, RetryPolicy::none()).unwrap_err();
        assert!(err.is_config());
    }
}
