//! Splunk REST export and HTTP Event Collector client.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{DumpEvent, ExportQuery, IngestLabels, PlatformFuture, SearchPlatform, SplunkEndpoint};
use crate::error::RangeError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(600);
const EXPORT_PATH: &str = "/services/search/jobs/export";
const HEC_PATH: &str = "/services/collector/event";

/// [`SearchPlatform`] backed by a live Splunk server.
#[derive(Clone, Debug, Default)]
pub struct SplunkClient;

impl SplunkClient {
    fn http_client(endpoint: &SplunkEndpoint) -> Result<reqwest::Client, String> {
        reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(!endpoint.verify_tls)
            .build()
            .map_err(|err| err.to_string())
    }

    async fn export_inner(
        endpoint: &SplunkEndpoint,
        query: &ExportQuery,
    ) -> Result<Vec<DumpEvent>, RangeError> {
        let client = Self::http_client(endpoint).map_err(RangeError::Search)?;
        let url = format!("{}{EXPORT_PATH}", endpoint.management_url());
        let form = [
            ("search", query.search.as_str()),
            ("earliest_time", query.earliest.as_str()),
            ("latest_time", query.latest.as_str()),
            ("output_mode", "json"),
            ("time_format", "%s.%Q"),
        ];
        let response = client
            .post(&url)
            .basic_auth(&endpoint.username, Some(&endpoint.password))
            .form(&form)
            .send()
            .await
            .map_err(|err| RangeError::Search(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| RangeError::Search(err.to_string()))?;
        if !status.is_success() {
            return Err(RangeError::Search(format!(
                "export returned {status}: {}",
                body.trim()
            )));
        }
        parse_export(&body)
    }

    async fn ingest_inner(
        endpoint: &SplunkEndpoint,
        events: &[DumpEvent],
        labels: &IngestLabels,
    ) -> Result<usize, RangeError> {
        let token = endpoint.hec_token.as_deref().ok_or_else(|| {
            RangeError::Ingest(String::from(
                "splunk_server.hec_token is required to replay events",
            ))
        })?;
        let client = Self::http_client(endpoint).map_err(RangeError::Ingest)?;
        let body = hec_payload(events, labels)?;
        let url = format!("{}{HEC_PATH}", endpoint.hec_url());
        let response = client
            .post(&url)
            .header("Authorization", format!("Splunk {token}"))
            .body(body)
            .send()
            .await
            .map_err(|err| RangeError::Ingest(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(events.len());
        }
        let text = response.text().await.unwrap_or_default();
        Err(RangeError::Ingest(format!(
            "collector returned {status}: {}",
            text.trim()
        )))
    }
}

impl SearchPlatform for SplunkClient {
    fn export<'a>(
        &'a self,
        endpoint: &'a SplunkEndpoint,
        query: &'a ExportQuery,
    ) -> PlatformFuture<'a, Vec<DumpEvent>> {
        Box::pin(Self::export_inner(endpoint, query))
    }

    fn ingest<'a>(
        &'a self,
        endpoint: &'a SplunkEndpoint,
        events: &'a [DumpEvent],
        labels: &'a IngestLabels,
    ) -> PlatformFuture<'a, usize> {
        Box::pin(Self::ingest_inner(endpoint, events, labels))
    }
}

#[derive(Debug, Deserialize)]
struct ExportRow {
    #[serde(default)]
    preview: bool,
    #[serde(default)]
    result: Option<Map<String, Value>>,
    #[serde(default)]
    messages: Vec<ExportMessage>,
}

#[derive(Debug, Deserialize)]
struct ExportMessage {
    #[serde(rename = "type")]
    kind: String,
    text: String,
}

/// Converts the newline delimited JSON returned by the export endpoint into
/// events, skipping preview rows.
///
/// # Errors
///
/// Returns [`RangeError::Search`] when a row is not JSON, Splunk reports a
/// fatal message (for example a syntax error in the search), or a result
/// carries no usable `_time` (transforming searches such as `| stats`).
pub fn parse_export(body: &str) -> Result<Vec<DumpEvent>, RangeError> {
    let mut events = Vec::new();
    for line in body.lines().filter(|line| !line.trim().is_empty()) {
        let row: ExportRow = serde_json::from_str(line)
            .map_err(|err| RangeError::Search(format!("unreadable export row: {err}")))?;
        if let Some(message) = row
            .messages
            .iter()
            .find(|message| message.kind == "FATAL" || message.kind == "ERROR")
        {
            return Err(RangeError::Search(message.text.clone()));
        }
        if row.preview {
            continue;
        }
        if let Some(result) = row.result {
            events.push(event_from_result(events.len() + 1, result)?);
        }
    }
    Ok(events)
}

fn event_from_result(
    row: usize,
    mut result: Map<String, Value>,
) -> Result<DumpEvent, RangeError> {
    let time = match result.remove("_time") {
        Some(Value::String(text)) => text,
        Some(Value::Number(number)) => number.to_string(),
        _ => {
            return Err(RangeError::Search(format!(
                "result {row} has no _time; only event searches can be dumped"
            )));
        }
    };
    let raw = match result.remove("_raw") {
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    Ok(DumpEvent {
        time,
        raw,
        fields: result.into_iter().collect(),
    })
}

fn hec_payload(events: &[DumpEvent], labels: &IngestLabels) -> Result<String, RangeError> {
    let mut body = String::new();
    for event in events {
        let time = event.epoch_seconds().map_err(RangeError::Ingest)?;
        let mut record = Map::new();
        record.insert(String::from("time"), Value::Number(time));
        record.insert(String::from("event"), Value::String(event.raw.clone()));
        if let Some(host) = event.host() {
            record.insert(String::from("host"), Value::String(host.to_owned()));
        }
        record.insert(String::from("index"), Value::String(labels.index.clone()));
        record.insert(
            String::from("sourcetype"),
            Value::String(labels.sourcetype.clone()),
        );
        record.insert(String::from("source"), Value::String(labels.source.clone()));
        let line = serde_json::to_string(&Value::Object(record))
            .map_err(|err| RangeError::Ingest(err.to_string()))?;
        body.push_str(&line);
        body.push('\n');
    }
    Ok(body)
}
