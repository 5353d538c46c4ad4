#![cfg(feature = "sink-sheets")]

//! Google Sheets sink over the v4 REST API.
//!
//! Authentication is a bearer token supplied by the deployment (service
//! account token minted out of process). Every request is bounded by the
//! agent timeout.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use url::Url;

use super::RecordSink;

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets/";

#[derive(Clone, Debug)]
pub struct SheetsConfig {
    pub sheet_key: String,
    pub worksheet: String,
    pub token: String,
    pub timeout: Duration,
}

pub struct SheetsSink {
    agent: ureq::Agent,
    base: Url,
    worksheet: String,
    auth_header: String,
}

impl SheetsSink {
    pub fn new(config: SheetsConfig) -> Result<Self> {
        if config.sheet_key.trim().is_empty() {
            return Err(anyhow!("sheet key must not be empty"));
        }
        if config.token.trim().is_empty() {
            return Err(anyhow!("sheets sink requires an access token"));
        }
        let base = Url::parse(SHEETS_API_BASE)
            .and_then(|u| u.join(&format!("{}/", config.sheet_key.trim())))
            .context("invalid sheet key")?;
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        log::info!(
            "sheets sink: spreadsheet={} worksheet={} timeout={:?}",
            config.sheet_key,
            config.worksheet,
            config.timeout
        );
        Ok(Self {
            agent,
            base,
            worksheet: config.worksheet,
            auth_header: format!("Bearer {}", config.token.trim()),
        })
    }

    /// URL for `values/<range><suffix>`.
    fn values_url(&self, range: &str, suffix: &str) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("sheets base URL cannot take a path"))?
            .pop_if_empty()
            .push("values")
            .push(&format!("{}{}", range, suffix));
        Ok(url)
    }

    fn send(&self, method: &str, url: &Url, body: Option<Value>) -> Result<Value> {
        let request = self
            .agent
            .request_url(method, url)
            .set("Authorization", &self.auth_header);
        let response = match body {
            Some(body) => request
                .set("Content-Type", "application/json")
                .send_string(&body.to_string()),
            None => request.call(),
        };
        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let detail = response.into_string().unwrap_or_default();
                return Err(anyhow!("{} {} -> HTTP {}: {}", method, url.path(), code, detail));
            }
            Err(e) => return Err(anyhow!("{} {} failed: {}", method, url.path(), e)),
        };
        let text = response
            .into_string()
            .context("failed to read sheets response")?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).context("sheets response was not JSON")
    }
}

impl RecordSink for SheetsSink {
    fn name(&self) -> &'static str {
        "sheets"
    }

    fn find_row(&mut self, record_id: &str) -> Result<Option<usize>> {
        let url = self.values_url(&format!("{}!A:A", self.worksheet), "")?;
        let body = self.send("GET", &url, None)?;
        Ok(first_column_position(&body, record_id))
    }

    fn append_row(&mut self, fields: &[String]) -> Result<()> {
        let mut url = self.values_url(&format!("{}!A1", self.worksheet), ":append")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "USER_ENTERED")
            .append_pair("insertDataOption", "INSERT_ROWS");
        self.send("POST", &url, Some(json!({ "values": [fields] })))?;
        Ok(())
    }

    fn update_cell(&mut self, row: usize, column: usize, value: &str) -> Result<()> {
        let cell = format!("{}!{}{}", self.worksheet, column_letter(column)?, row);
        let mut url = self.values_url(&cell, "")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "USER_ENTERED");
        self.send("PUT", &url, Some(json!({ "values": [[value]] })))?;
        Ok(())
    }
}

/// 1-based row of `record_id` in a `values.get` response for column A.
fn first_column_position(body: &Value, record_id: &str) -> Option<usize> {
    let rows = body.get("values")?.as_array()?;
    rows.iter()
        .position(|row| {
            let cell = row.get(0);
            let text = match cell {
                Some(Value::String(s)) => s.trim().to_string(),
                Some(Value::Number(n)) => n.to_string(),
                _ => return false,
            };
            text == record_id.trim()
        })
        .map(|i| i + 1)
}

/// Spreadsheet column name for a 1-based index (1 -> A, 27 -> AA).
fn column_letter(column: usize) -> Result<String> {
    if column == 0 {
        return Err(anyhow!("columns are 1-based"));
    }
    let mut n = column;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).context("column letters")
}
