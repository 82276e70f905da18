//! Telemetry capture and replay.
//!
//! `dump` exports the results of one search into a JSON Lines file and
//! `replay` re-ingests such a file under new index, sourcetype, and source
//! labels while keeping every event's original timestamp. The file format is
//! the contract between the two: one [`DumpEvent`] per line, in export order.

mod splunk;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};

use crate::error::RangeError;

pub use splunk::{SplunkClient, parse_export};

/// Default index `replay` ingests into.
pub const DEFAULT_REPLAY_INDEX: &str = "test";

/// Default upper bound of a dump's time range.
pub const DEFAULT_LATEST: &str = "now";

/// Number of events sent per ingestion request.
pub const INGEST_BATCH_SIZE: usize = 500;

/// One exported event.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DumpEvent {
    /// Event timestamp as epoch seconds with optional fraction.
    pub time: String,
    /// Raw event text.
    pub raw: String,
    /// Every other extracted field, sorted by name.
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl DumpEvent {
    /// Host the event was originally collected from, when recorded.
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.fields.get("host").and_then(serde_json::Value::as_str)
    }

    /// Parses the timestamp, rejecting anything that is not a decimal number.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when the timestamp is unusable.
    pub fn epoch_seconds(&self) -> Result<serde_json::Number, String> {
        let trimmed = self.time.trim();
        let is_decimal = !trimmed.is_empty()
            && trimmed.chars().all(|ch| ch.is_ascii_digit() || ch == '.')
            && trimmed.chars().filter(|ch| *ch == '.').count() <= 1
            && !trimmed.starts_with('.')
            && !trimmed.ends_with('.');
        if !is_decimal {
            return Err(format!("time '{}' is not epoch seconds", self.time));
        }
        trimmed
            .parse::<serde_json::Number>()
            .map_err(|err| format!("time '{}' is not epoch seconds: {err}", self.time))
    }
}

/// Renders events as JSON Lines, one event per line.
///
/// # Errors
///
/// Returns the serialiser error message when an event cannot be encoded.
pub fn encode_events(events: &[DumpEvent]) -> Result<String, String> {
    let mut out = String::new();
    for event in events {
        let line = serde_json::to_string(event).map_err(|err| err.to_string())?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Parses a dump file produced by [`encode_events`].
///
/// Blank lines are ignored.
///
/// # Errors
///
/// Returns [`RangeError::Format`] naming the first line that is not a valid
/// record.
pub fn decode_events(path: &Utf8Path, text: &str) -> Result<Vec<DumpEvent>, RangeError> {
    let format_error = |line: usize, message: String| RangeError::Format {
        path: path.to_path_buf(),
        line,
        message,
    };
    let mut events = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: DumpEvent =
            serde_json::from_str(line).map_err(|err| format_error(index + 1, err.to_string()))?;
        event
            .epoch_seconds()
            .map_err(|message| format_error(index + 1, message))?;
        events.push(event);
    }
    Ok(events)
}

/// Connection details of the range's Splunk server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SplunkEndpoint {
    /// Address of the server.
    pub host: String,
    /// Admin user.
    pub username: String,
    /// Admin password.
    pub password: String,
    /// Management (REST) port.
    pub management_port: u16,
    /// HTTP Event Collector port.
    pub hec_port: u16,
    /// HTTP Event Collector token.
    pub hec_token: Option<String>,
    /// Whether TLS certificates are verified.
    pub verify_tls: bool,
}

impl SplunkEndpoint {
    /// Endpoint with Splunk's default ports and the `admin` user.
    #[must_use]
    pub fn new(host: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: String::from("admin"),
            password: password.into(),
            management_port: 8089,
            hec_port: 8088,
            hec_token: None,
            verify_tls: false,
        }
    }

    /// Base URL of the REST API.
    #[must_use]
    pub fn management_url(&self) -> String {
        format!("https://{}:{}", self.host, self.management_port)
    }

    /// Base URL of the HTTP Event Collector.
    #[must_use]
    pub fn hec_url(&self) -> String {
        format!("https://{}:{}", self.host, self.hec_port)
    }
}

/// A fully formed export search over one time range.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExportQuery {
    /// Search string, already ending in a time sort.
    pub search: String,
    /// Inclusive lower bound in Splunk time syntax.
    pub earliest: String,
    /// Exclusive upper bound in Splunk time syntax.
    pub latest: String,
}

/// Labels applied to replayed events.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IngestLabels {
    /// Destination index.
    pub index: String,
    /// Sourcetype stamped on every event.
    pub sourcetype: String,
    /// Source stamped on every event.
    pub source: String,
}

/// Future returned by search platform calls.
pub type PlatformFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RangeError>> + Send + 'a>>;

/// Search and ingestion capabilities `dump` and `replay` rely on.
pub trait SearchPlatform {
    /// Runs `query` and returns its results in time order.
    fn export<'a>(
        &'a self,
        endpoint: &'a SplunkEndpoint,
        query: &'a ExportQuery,
    ) -> PlatformFuture<'a, Vec<DumpEvent>>;

    /// Ingests `events` under `labels`, returning how many were accepted.
    fn ingest<'a>(
        &'a self,
        endpoint: &'a SplunkEndpoint,
        events: &'a [DumpEvent],
        labels: &'a IngestLabels,
    ) -> PlatformFuture<'a, usize>;
}

impl<P: SearchPlatform + ?Sized> SearchPlatform for &P {
    fn export<'a>(
        &'a self,
        endpoint: &'a SplunkEndpoint,
        query: &'a ExportQuery,
    ) -> PlatformFuture<'a, Vec<DumpEvent>> {
        (**self).export(endpoint, query)
    }

    fn ingest<'a>(
        &'a self,
        endpoint: &'a SplunkEndpoint,
        events: &'a [DumpEvent],
        labels: &'a IngestLabels,
    ) -> PlatformFuture<'a, usize> {
        (**self).ingest(endpoint, events, labels)
    }
}

/// Arguments of `dump`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DumpRequest {
    /// Destination file.
    pub file_name: Utf8PathBuf,
    /// Search to export.
    pub search: String,
    /// Lower bound of the time range.
    pub earliest: String,
    /// Upper bound of the time range.
    pub latest: String,
}

impl DumpRequest {
    /// Builds the export query, validating the search before anything is
    /// contacted.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Search`] for an empty search and
    /// [`RangeError::InvalidArgument`] for an empty time bound.
    pub fn query(&self) -> Result<ExportQuery, RangeError> {
        let search = self.search.trim();
        if search.is_empty() {
            return Err(RangeError::Search(String::from("search must not be empty")));
        }
        if self.earliest.trim().is_empty() {
            return Err(RangeError::InvalidArgument(String::from(
                "--earliest must not be empty",
            )));
        }
        let latest = match self.latest.trim() {
            "" => DEFAULT_LATEST,
            value => value,
        };
        Ok(ExportQuery {
            search: sorted_search(search),
            earliest: relative_time(self.earliest.trim()),
            latest: relative_time(latest),
        })
    }
}

/// Arguments of `replay`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplayRequest {
    /// Dump file to ingest.
    pub file_name: Utf8PathBuf,
    /// Destination index.
    pub index: String,
    /// Sourcetype to apply.
    pub sourcetype: String,
    /// Source to apply.
    pub source: String,
}

impl ReplayRequest {
    fn labels(&self) -> Result<IngestLabels, RangeError> {
        let require = |value: &str, flag: &str| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Err(RangeError::InvalidArgument(format!("{flag} must not be empty")))
            } else {
                Ok(trimmed.to_owned())
            }
        };
        Ok(IngestLabels {
            index: require(&self.index, "--index")?,
            sourcetype: require(&self.sourcetype, "--sourcetype")?,
            source: require(&self.source, "--source")?,
        })
    }
}

/// Prefixes `search` unless the query is a generating command, then sorts by
/// time so the dump preserves event order.
fn sorted_search(query: &str) -> String {
    if query.starts_with('|') || query.starts_with("search ") {
        format!("{query} | sort 0 _time")
    } else {
        format!("search {query} | sort 0 _time")
    }
}

/// Treats a bare span such as `2h` as relative to now (`-2h`).
fn relative_time(value: &str) -> String {
    let bare_span = value.starts_with(|ch: char| ch.is_ascii_digit())
        && value.ends_with(|ch: char| ch.is_ascii_alphabetic());
    if bare_span {
        format!("-{value}")
    } else {
        value.to_owned()
    }
}

/// Exports one search to `request.file_name`, returning the event count.
///
/// The file is written in full to a sibling temporary file and renamed into
/// place, so a failed dump never leaves a truncated file under the requested
/// name. Repeating a dump with identical arguments overwrites the file.
///
/// # Errors
///
/// Returns [`RangeError::Search`] when the search is empty or rejected or
/// yields a result without epoch seconds, and [`RangeError::Export`] when
/// the file cannot be written.
pub async fn dump<P: SearchPlatform + ?Sized>(
    platform: &P,
    endpoint: &SplunkEndpoint,
    request: &DumpRequest,
) -> Result<usize, RangeError> {
    let query = request.query()?;
    tracing::info!(
        search = %query.search,
        earliest = %query.earliest,
        latest = %query.latest,
        file = %request.file_name,
        "dumping search results"
    );
    let events = platform.export(endpoint, &query).await?;
    for (index, event) in events.iter().enumerate() {
        event.epoch_seconds().map_err(|message| {
            RangeError::Search(format!("result {}: {message}", index + 1))
        })?;
    }
    let body = encode_events(&events).map_err(|message| RangeError::Export {
        path: request.file_name.clone(),
        message,
    })?;
    write_atomically(&request.file_name, &body)?;
    tracing::info!(events = events.len(), file = %request.file_name, "dump complete");
    Ok(events.len())
}

/// Re-ingests a dump file, returning the number of events accepted.
///
/// Events keep their dumped timestamps and hosts and are sent in file order.
///
/// # Errors
///
/// Returns [`RangeError::Format`] when the file is unreadable or malformed
/// and [`RangeError::Ingest`] when the platform rejects a batch. The ingest
/// error names the rejected events and how many were already accepted.
pub async fn replay<P: SearchPlatform + ?Sized>(
    platform: &P,
    endpoint: &SplunkEndpoint,
    request: &ReplayRequest,
) -> Result<usize, RangeError> {
    let labels = request.labels()?;
    let text = read_dump(&request.file_name)?;
    let events = decode_events(&request.file_name, &text)?;
    if events.is_empty() {
        tracing::warn!(file = %request.file_name, "dump file holds no events");
        return Ok(0);
    }

    let total = events.len();
    let mut accepted = 0;
    for (index, batch) in events.chunks(INGEST_BATCH_SIZE).enumerate() {
        let first = index * INGEST_BATCH_SIZE + 1;
        let last = first + batch.len() - 1;
        let ingested = platform
            .ingest(endpoint, batch, &labels)
            .await
            .map_err(|err| {
                RangeError::Ingest(format!(
                    "events {first}-{last} of {total} rejected, {accepted} already ingested: {}",
                    inner_message(err)
                ))
            })?;
        accepted += ingested;
        tracing::debug!(accepted, total, "replay progress");
    }
    tracing::info!(
        events = accepted,
        index = %labels.index,
        sourcetype = %labels.sourcetype,
        source = %labels.source,
        "replay complete"
    );
    Ok(accepted)
}

fn inner_message(err: RangeError) -> String {
    match err {
        RangeError::Ingest(message) => message,
        other => other.to_string(),
    }
}

fn split_path(path: &Utf8Path) -> Option<(&Utf8Path, &str)> {
    let file_name = path.file_name()?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    Some((parent, file_name))
}

fn write_atomically(path: &Utf8Path, body: &str) -> Result<(), RangeError> {
    let export_error = |message: String| RangeError::Export {
        path: path.to_path_buf(),
        message,
    };
    let (parent, file_name) =
        split_path(path).ok_or_else(|| export_error(String::from("path has no file name")))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| export_error(err.to_string()))?;

    let partial = format!(".{file_name}.partial-{}", uuid::Uuid::new_v4().simple());
    if let Err(err) = dir.write(&partial, body) {
        dir.remove_file(&partial).ok();
        return Err(export_error(err.to_string()));
    }
    dir.rename(&partial, &dir, file_name).map_err(|err| {
        dir.remove_file(&partial).ok();
        export_error(err.to_string())
    })
}

fn read_dump(path: &Utf8Path) -> Result<String, RangeError> {
    let format_error = |message: String| RangeError::Format {
        path: path.to_path_buf(),
        line: 0,
        message,
    };
    let (parent, file_name) =
        split_path(path).ok_or_else(|| format_error(String::from("path has no file name")))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| format_error(err.to_string()))?;
    dir.read_to_string(file_name)
        .map_err(|err| format_error(err.to_string()))
}

#[cfg(test)]
mod tests;
