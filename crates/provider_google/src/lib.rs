use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use core_types::{AppendReceipt, DocumentLink, DocumentStore, RangeSpec, Row, TabularStore};
use reqwest::Url;
use serde_json::{Value, json};
use token_cache::{OAuthToken, TokenCache, TokenError};
use tracing::{debug, info, warn};

const DOCUMENT_MIME_TYPE: &str = "application/vnd.google-apps.document";
const REFRESH_SKEW_SECONDS: i64 = 60;

/// Sheets v4 `values` endpoints for one spreadsheet.
pub struct GoogleSheetsStore {
    client: reqwest::Client,
    base_url: String,
    spreadsheet_id: String,
    access_token: String,
}

impl GoogleSheetsStore {
    pub fn new(
        base_url: impl Into<String>,
        spreadsheet_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            spreadsheet_id: spreadsheet_id.into(),
            access_token: access_token.into(),
        }
    }

    fn values_url(&self, range_a1: &str, suffix: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid sheets base url {}", self.base_url))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow!("sheets base url cannot hold a path: {}", self.base_url))?;
            segments.pop_if_empty().extend([
                "v4",
                "spreadsheets",
                self.spreadsheet_id.as_str(),
                "values",
            ]);
            segments.push(&format!("{range_a1}{suffix}"));
        }
        Ok(url)
    }
}

#[async_trait]
impl TabularStore for GoogleSheetsStore {
    async fn read_range(&self, sheet: &str, range: &RangeSpec) -> Result<Vec<Row>> {
        let a1 = range.to_a1(sheet);
        let url = self.values_url(&a1, "")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(self.access_token.trim())
            .send()
            .await
            .with_context(|| format!("failed to reach sheets api for {a1}"))?;
        let body = read_json(response, "sheets read").await?;
        let rows = parse_value_range(&body);
        debug!(range = %a1, rows = rows.len(), "read sheet range");
        Ok(rows)
    }

    async fn append_rows(
        &self,
        sheet: &str,
        range: &RangeSpec,
        rows: Vec<Row>,
    ) -> Result<AppendReceipt> {
        let a1 = range.to_a1(sheet);
        let url = self.values_url(&a1, ":append")?;
        let body = json!({
            "range": a1,
            "majorDimension": "ROWS",
            "values": rows,
        });
        let response = self
            .client
            .post(url)
            .bearer_auth(self.access_token.trim())
            .query(&[
                ("valueInputOption", "USER_ENTERED"),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to reach sheets api for {a1}"))?;
        let payload = read_json(response, "sheets append").await?;
        let receipt = parse_append_response(&payload);
        info!(
            range = %a1,
            updated_range = receipt.updated_range.as_deref().unwrap_or_default(),
            rows = receipt.updated_rows,
            "appended sheet rows"
        );
        Ok(receipt)
    }
}

/// Drive v3 file search restricted to native documents.
pub struct GoogleDriveStore {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl GoogleDriveStore {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            access_token: access_token.into(),
        }
    }
}

#[async_trait]
impl DocumentStore for GoogleDriveStore {
    async fn find_document_by_name(
        &self,
        folder_id: &str,
        name: &str,
    ) -> Result<Option<DocumentLink>> {
        let url = format!("{}/drive/v3/files", self.base_url.trim_end_matches('/'));
        let query = drive_query(folder_id, name);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.access_token.trim())
            .query(&[("q", query.as_str()), ("fields", "files(id, webViewLink)")])
            .send()
            .await
            .context("failed to reach drive api")?;
        let body = read_json(response, "drive search").await?;
        let link = parse_first_document(&body);
        if link.is_none() {
            debug!(folder_id, name, "no document matched");
        }
        Ok(link)
    }
}

/// Exchanges refresh tokens at the configured token endpoint.
pub struct GoogleAuth {
    client: reqwest::Client,
    token_uri: String,
}

impl GoogleAuth {
    pub fn new(token_uri: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token_uri: token_uri.into(),
        }
    }

    /// A usable cached token, refreshed and re-cached when close to expiry.
    pub async fn authorized_token(&self, cache: &TokenCache) -> Result<OAuthToken> {
        let token = cache.load()?.ok_or(TokenError::NotAuthorized)?;
        if !token.is_expired(Utc::now(), Duration::seconds(REFRESH_SKEW_SECONDS)) {
            return Ok(token);
        }
        if !token.can_refresh() {
            warn!(fingerprint = %token.fingerprint(), "cached token expired without refresh data");
            bail!("cached token expired and cannot be refreshed; import a fresh token");
        }

        let refreshed = self.refresh(&token).await?;
        cache.store(&refreshed)?;
        Ok(refreshed)
    }

    pub async fn refresh(&self, token: &OAuthToken) -> Result<OAuthToken> {
        let (Some(refresh_token), Some(client_id), Some(client_secret)) = (
            token.refresh_token.as_deref(),
            token.client_id.as_deref(),
            token.client_secret.as_deref(),
        ) else {
            bail!("token has no refresh credentials");
        };
        let token_uri = token.token_uri.as_deref().unwrap_or(&self.token_uri);

        let response = self
            .client
            .post(token_uri)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .send()
            .await
            .context("failed to reach token endpoint")?;
        let body = read_json(response, "token refresh").await?;
        let refreshed = apply_refresh_response(token, &body, Utc::now())?;
        info!(fingerprint = %refreshed.fingerprint(), "refreshed access token");
        Ok(refreshed)
    }
}

async fn read_json(response: reqwest::Response, what: &str) -> Result<Value> {
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        bail!("{what} failed: {status} {text}");
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).with_context(|| format!("{what} returned invalid json"))
}

/// `values` of a ValueRange response. A missing key means an empty range.
fn parse_value_range(body: &Value) -> Vec<Row> {
    let Some(rows) = body.get("values").and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .map(|row| {
            row.as_array()
                .map(|cells| cells.iter().map(cell_text).collect())
                .unwrap_or_default()
        })
        .collect()
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        other => other.to_string(),
    }
}

fn parse_append_response(body: &Value) -> AppendReceipt {
    let updates = body.get("updates");
    AppendReceipt {
        updated_range: updates
            .and_then(|u| u.get("updatedRange"))
            .and_then(Value::as_str)
            .map(str::to_string),
        updated_rows: updates
            .and_then(|u| u.get("updatedRows"))
            .and_then(Value::as_u64)
            .unwrap_or_default() as u32,
    }
}

fn drive_query(folder_id: &str, name: &str) -> String {
    format!(
        "'{}' in parents and name = '{}' and mimeType = '{DOCUMENT_MIME_TYPE}'",
        escape_query_literal(folder_id),
        escape_query_literal(name)
    )
}

fn escape_query_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn parse_first_document(body: &Value) -> Option<DocumentLink> {
    let file = body.get("files")?.as_array()?.first()?;
    Some(DocumentLink {
        id: file.get("id")?.as_str()?.to_string(),
        web_view_link: file
            .get("webViewLink")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

fn apply_refresh_response(
    token: &OAuthToken,
    body: &Value,
    now: chrono::DateTime<Utc>,
) -> Result<OAuthToken> {
    let access_token = body
        .get("access_token")
        .and_then(Value::as_str)
        .context("token response has no access_token")?;
    let mut refreshed = token.clone();
    refreshed.token = access_token.to_string();
    refreshed.expiry = body
        .get("expires_in")
        .and_then(Value::as_i64)
        .map(|seconds| now + Duration::seconds(seconds));
    if let Some(rotated) = body.get("refresh_token").and_then(Value::as_str) {
        refreshed.refresh_token = Some(rotated.to_string());
    }
    if let Some(scope) = body.get("scope").and_then(Value::as_str) {
        refreshed.scopes = scope.split_whitespace().map(str::to_string).collect();
    }
    Ok(refreshed)
}
