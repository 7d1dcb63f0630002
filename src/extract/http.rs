use super::Extractor;
use crate::session::error::ExtractError;
use crate::session::work::{ItemId, WorkItem};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Fetches `template` with `{id}` replaced by the item id and stores the JSON
/// body under `field` of the item's carried payload.
///
/// `{refs}` expands to the comma-joined ids listed under the reference field
/// of the payload (elements are bare ids or objects with an `id`), for APIs
/// keyed by something other than the work item.
///
/// 401/403/429 stop the session (credential or quota problem); every other
/// failure only costs the current item.
#[derive(Debug, Clone)]
pub struct HttpJsonExtractor {
    client: Client,
    template: String,
    field: String,
    query: Vec<(String, String)>,
    bearer: Option<String>,
    refs: Option<String>,
}

impl HttpJsonExtractor {
    pub fn new(template: impl Into<String>) -> anyhow::Result<Self> {
        let template = template.into();
        if !template.contains("{id}") && !template.contains("{refs}") {
            anyhow::bail!("url template {template:?} has no {{id}} or {{refs}} placeholder");
        }
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            template,
            field: "data".to_string(),
            query: Vec::new(),
            bearer: None,
            refs: None,
        })
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }

    /// Payload field whose ids fill `{refs}`.
    pub fn with_refs(mut self, field: impl Into<String>) -> Self {
        self.refs = Some(field.into());
        self
    }

    pub fn url_for(&self, item: &WorkItem) -> Result<String, ExtractError> {
        let id = item.id.to_string();
        let mut url = self.template.replace("{id}", &urlencoding::encode(&id));
        if url.contains("{refs}") {
            let Some(field) = &self.refs else {
                return Err(ExtractError::fatal("url template uses {refs} but no reference field is set"));
            };
            let refs = referenced_ids(item, field);
            if refs.is_empty() {
                return Err(ExtractError::recoverable(format!("no ids listed under {field}")));
            }
            url = url.replace("{refs}", &refs.join(","));
        }
        Ok(url)
    }
}

/// Url-encoded ids listed under `field` of the item payload.
fn referenced_ids(item: &WorkItem, field: &str) -> Vec<String> {
    let Some(list) = item
        .payload
        .as_ref()
        .and_then(|p| p.get(field))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|el| ItemId::from_value(el.get("id").unwrap_or(el)))
        .map(|id| urlencoding::encode(&id.to_string()).into_owned())
        .collect()
}

/// Status codes that mean the whole session cannot go on.
fn is_session_fatal(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
    )
}

#[async_trait]
impl Extractor for HttpJsonExtractor {
    async fn extract(&self, item: &WorkItem) -> Result<Value, ExtractError> {
        let url = self.url_for(item)?;
        let mut req = self.client.get(&url);
        if !self.query.is_empty() {
            req = req.query(&self.query);
        }
        if let Some(token) = &self.bearer {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ExtractError::recoverable(format!("request failed: {e}")))?;
        let status = resp.status();
        if is_session_fatal(status) {
            return Err(ExtractError::fatal(format!("{url} answered {status}")));
        }
        if !status.is_success() {
            return Err(ExtractError::recoverable(format!("http {status}")));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ExtractError::recoverable(format!("malformed response: {e}")))?;
        if body.is_null() {
            return Err(ExtractError::recoverable("empty response"));
        }

        let mut record = item.seed_record();
        record.insert(self.field.clone(), body);
        Ok(Value::Object(record))
    }
}
