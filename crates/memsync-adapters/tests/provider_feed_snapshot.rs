use std::path::{Path, PathBuf};

use memsync_adapters::parse_member_feed;
use memsync_core::MemberRecord;
use serde_json::Value;

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/provider")
}

#[test]
fn provider_feed_matches_snapshot() {
    let body = std::fs::read_to_string(fixture_dir().join("members_window.txt")).expect("fixture body");
    let snapshot: Value = serde_json::from_str(
        &std::fs::read_to_string(fixture_dir().join("members_window.snapshot.json"))
            .expect("snapshot"),
    )
    .expect("snapshot json");

    let feed = parse_member_feed(&body).expect("parse fixture");

    let expected: Vec<MemberRecord> =
        serde_json::from_value(snapshot["records"].clone()).expect("snapshot records");
    assert_eq!(feed.records, expected);
    assert_eq!(
        serde_json::to_value(&feed.ignored_columns).expect("columns"),
        snapshot["ignored_columns"]
    );
}

#[test]
fn crlf_fixture_keeps_provider_row_order() {
    let body = std::fs::read_to_string(fixture_dir().join("members_window.txt")).expect("fixture body");
    assert!(body.contains("\r\n"));
    let feed = parse_member_feed(&body).expect("parse fixture");
    let ids = feed
        .records
        .iter()
        .map(|r| r.member_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["1000401", "1000402", "1000403"]);
}
