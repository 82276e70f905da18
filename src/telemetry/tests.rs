//! Tests for the dump file codec and the dump/replay pipeline.

use super::*;
use crate::test_support::{FakeSearchPlatform, sample_events};
use rstest::{fixture, rstest};
use tempfile::TempDir;

struct Workspace {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

impl Workspace {
    fn file(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }
}

#[fixture]
fn workspace() -> Workspace {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap_or_else(|path| panic!("utf8 path: {}", path.display()));
    Workspace { _tmp: tmp, root }
}

fn endpoint() -> SplunkEndpoint {
    SplunkEndpoint::new("10.0.1.12", "Pl3ase-change")
}

fn dump_request(file_name: Utf8PathBuf) -> DumpRequest {
    DumpRequest {
        file_name,
        search: String::from("index=win EventCode=4688"),
        earliest: String::from("2h"),
        latest: String::from(DEFAULT_LATEST),
    }
}

fn replay_request(file_name: Utf8PathBuf, index: &str) -> ReplayRequest {
    ReplayRequest {
        file_name,
        index: index.to_owned(),
        sourcetype: String::from("XmlWinEventLog"),
        source: String::from("replayed"),
    }
}

#[rstest]
#[case::plain("index=win", "search index=win | sort 0 _time")]
#[case::explicit("search index=win", "search index=win | sort 0 _time")]
#[case::generating("| tstats count by host", "| tstats count by host | sort 0 _time")]
fn searches_are_sorted_by_time(#[case] search: &str, #[case] expected: &str) {
    let request = DumpRequest {
        search: search.to_owned(),
        ..dump_request(Utf8PathBuf::from("out.json"))
    };
    let query = request.query().unwrap_or_else(|err| panic!("query: {err}"));
    assert_eq!(query.search, expected);
}

#[rstest]
#[case::bare_span("2h", "-2h")]
#[case::already_relative("-7d@d", "-7d@d")]
#[case::absolute("1700000000", "1700000000")]
#[case::now("now", "now")]
fn earliest_spans_are_relative_to_now(#[case] earliest: &str, #[case] expected: &str) {
    let request = DumpRequest {
        earliest: earliest.to_owned(),
        ..dump_request(Utf8PathBuf::from("out.json"))
    };
    let query = request.query().unwrap_or_else(|err| panic!("query: {err}"));
    assert_eq!(query.earliest, expected);
}

#[rstest]
fn decode_reports_the_offending_line() {
    let text = "{\"time\":\"1700000000.1\",\"raw\":\"a\",\"fields\":{}}\n\nnot json\n";
    let err = decode_events(Utf8Path::new("bad.json"), text).expect_err("line 3 is invalid");
    assert!(
        matches!(err, RangeError::Format { line: 3, .. }),
        "unexpected error: {err:?}"
    );
}

#[rstest]
#[case::words("yesterday")]
#[case::iso("2023-11-14T22:13:20Z")]
#[case::empty("")]
fn decode_rejects_non_numeric_times(#[case] time: &str) {
    let text = format!("{{\"time\":\"{time}\",\"raw\":\"a\"}}\n");
    let err = decode_events(Utf8Path::new("bad.json"), &text).expect_err("time is invalid");
    assert!(
        matches!(err, RangeError::Format { line: 1, .. }),
        "unexpected error: {err:?}"
    );
}

#[rstest]
#[tokio::test]
async fn dump_writes_one_line_per_event_in_order(workspace: Workspace) {
    let events = sample_events(3);
    let platform = FakeSearchPlatform::with_results(events.clone());
    let path = workspace.file("win.json");

    let written = dump(&platform, &endpoint(), &dump_request(path.clone()))
        .await
        .unwrap_or_else(|err| panic!("dump: {err}"));

    assert_eq!(written, 3);
    let text = std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("read: {err}"));
    assert_eq!(text.lines().count(), 3);
    let decoded = decode_events(&path, &text).unwrap_or_else(|err| panic!("decode: {err}"));
    assert_eq!(decoded, events);
    let Some(query) = platform.queries().pop() else {
        panic!("platform should have been queried");
    };
    assert_eq!(query.earliest, "-2h");
    assert_eq!(query.latest, "now");
}

#[rstest]
#[tokio::test]
async fn repeated_dumps_are_byte_identical(workspace: Workspace) {
    let platform = FakeSearchPlatform::with_results(sample_events(4));
    let path = workspace.file("repeat.json");
    let request = dump_request(path.clone());

    dump(&platform, &endpoint(), &request)
        .await
        .unwrap_or_else(|err| panic!("first dump: {err}"));
    let first = std::fs::read(&path).unwrap_or_else(|err| panic!("read: {err}"));
    dump(&platform, &endpoint(), &request)
        .await
        .unwrap_or_else(|err| panic!("second dump: {err}"));
    let second = std::fs::read(&path).unwrap_or_else(|err| panic!("read: {err}"));

    assert_eq!(first, second);
    let leftovers = std::fs::read_dir(workspace.root.as_std_path())
        .unwrap_or_else(|err| panic!("read dir: {err}"))
        .count();
    assert_eq!(leftovers, 1, "no partial files remain");
}

#[rstest]
#[tokio::test]
async fn failed_search_leaves_no_file(workspace: Workspace) {
    let platform = FakeSearchPlatform::default();
    platform.fail_exports("Unknown search command 'bogus'.");
    let path = workspace.file("broken.json");

    let err = dump(&platform, &endpoint(), &dump_request(path.clone()))
        .await
        .expect_err("search should fail");

    assert!(matches!(err, RangeError::Search(_)), "unexpected error: {err:?}");
    assert!(!path.exists());
}

#[rstest]
#[tokio::test]
async fn empty_search_is_rejected_before_contacting_the_platform(workspace: Workspace) {
    let platform = FakeSearchPlatform::default();
    let request = DumpRequest {
        search: String::from("   "),
        ..dump_request(workspace.file("empty.json"))
    };

    let err = dump(&platform, &endpoint(), &request)
        .await
        .expect_err("empty search should fail");

    assert!(matches!(err, RangeError::Search(_)));
    assert_eq!(platform.call_count(), 0);
}

#[rstest]
#[tokio::test]
async fn unwritable_destination_is_an_export_error(workspace: Workspace) {
    let platform = FakeSearchPlatform::with_results(sample_events(1));
    let path = workspace.root.join("missing-dir").join("out.json");

    let err = dump(&platform, &endpoint(), &dump_request(path))
        .await
        .expect_err("missing directory should fail");

    assert!(matches!(err, RangeError::Export { .. }), "unexpected error: {err:?}");
}

#[rstest]
#[case::test_index("test")]
#[case::custom_index("detections")]
#[tokio::test]
async fn dump_then_replay_preserves_times_payloads_and_order(
    workspace: Workspace,
    #[case] index: &str,
) {
    let events = sample_events(5);
    let platform = FakeSearchPlatform::with_results(events.clone());
    let path = workspace.file("round-trip.json");

    dump(&platform, &endpoint(), &dump_request(path.clone()))
        .await
        .unwrap_or_else(|err| panic!("dump: {err}"));
    let replayed = replay(&platform, &endpoint(), &replay_request(path, index))
        .await
        .unwrap_or_else(|err| panic!("replay: {err}"));

    assert_eq!(replayed, 5);
    assert_eq!(platform.ingested_events(), events);
    for batch in platform.batches() {
        assert_eq!(batch.labels.index, index);
        assert_eq!(batch.labels.sourcetype, "XmlWinEventLog");
        assert_eq!(batch.labels.source, "replayed");
    }
}

#[rstest]
#[tokio::test]
async fn replay_sends_large_files_in_batches(workspace: Workspace) {
    let events = sample_events(INGEST_BATCH_SIZE + 3);
    let path = workspace.file("large.json");
    let body = encode_events(&events).unwrap_or_else(|err| panic!("encode: {err}"));
    std::fs::write(&path, body).unwrap_or_else(|err| panic!("write: {err}"));
    let platform = FakeSearchPlatform::default();

    let replayed = replay(&platform, &endpoint(), &replay_request(path, "test"))
        .await
        .unwrap_or_else(|err| panic!("replay: {err}"));

    assert_eq!(replayed, INGEST_BATCH_SIZE + 3);
    let sizes = platform
        .batches()
        .iter()
        .map(|batch| batch.events.len())
        .collect::<Vec<_>>();
    assert_eq!(sizes, vec![INGEST_BATCH_SIZE, 3]);
    assert_eq!(platform.ingested_events(), events);
}

#[rstest]
#[tokio::test]
async fn failed_batches_report_what_was_already_ingested(workspace: Workspace) {
    let events = sample_events(INGEST_BATCH_SIZE + 3);
    let path = workspace.file("partial.json");
    let body = encode_events(&events).unwrap_or_else(|err| panic!("encode: {err}"));
    std::fs::write(&path, body).unwrap_or_else(|err| panic!("write: {err}"));
    let platform = FakeSearchPlatform::default();
    platform.fail_ingest_from(1, "collector returned 503");

    let err = replay(&platform, &endpoint(), &replay_request(path, "test"))
        .await
        .expect_err("second batch should fail");

    let RangeError::Ingest(message) = &err else {
        panic!("expected an ingest error, got {err:?}");
    };
    assert!(message.contains("events 501-503 of 503"), "{message}");
    assert!(message.contains("500 already ingested"), "{message}");
    assert!(message.contains("collector returned 503"), "{message}");
    assert_eq!(platform.ingested_events().len(), INGEST_BATCH_SIZE);
}

#[rstest]
#[tokio::test]
async fn results_without_epoch_times_are_never_written(workspace: Workspace) {
    let mut events = sample_events(2);
    if let Some(last) = events.last_mut() {
        last.time = String::new();
    }
    let platform = FakeSearchPlatform::with_results(events);
    let path = workspace.file("stats.json");

    let err = dump(&platform, &endpoint(), &dump_request(path.clone()))
        .await
        .expect_err("results without _time cannot be replayed");

    assert!(
        matches!(err, RangeError::Search(ref message) if message.contains("result 2")),
        "unexpected error: {err:?}"
    );
    assert!(!path.exists());
}

#[rstest]
#[tokio::test]
async fn replay_rejects_foreign_files(workspace: Workspace) {
    let path = workspace.file("foreign.csv");
    std::fs::write(&path, "_time,_raw\n1700000000,hello\n")
        .unwrap_or_else(|err| panic!("write: {err}"));
    let platform = FakeSearchPlatform::default();

    let err = replay(&platform, &endpoint(), &replay_request(path, "test"))
        .await
        .expect_err("csv is not a dump");

    assert!(matches!(err, RangeError::Format { line: 1, .. }), "unexpected error: {err:?}");
    assert_eq!(platform.call_count(), 0);
}

#[rstest]
#[tokio::test]
async fn replay_of_missing_file_is_a_format_error(workspace: Workspace) {
    let platform = FakeSearchPlatform::default();
    let err = replay(
        &platform,
        &endpoint(),
        &replay_request(workspace.file("absent.json"), "test"),
    )
    .await
    .expect_err("missing file should fail");

    assert!(matches!(err, RangeError::Format { line: 0, .. }), "unexpected error: {err:?}");
}
