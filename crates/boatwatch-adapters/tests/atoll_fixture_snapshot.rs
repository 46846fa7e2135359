use std::path::{Path, PathBuf};

use boatwatch_adapters::{parse_devices, TypeLookupTable};
use boatwatch_core::RawDeviceRecord;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

#[test]
fn golden_json_snapshot_test_atoll_sample() {
    let sample = workspace_root().join("fixtures/atolls/sample");
    let body = std::fs::read(sample.join("response.json")).expect("read response");
    let expected: Vec<RawDeviceRecord> = serde_json::from_str(
        &std::fs::read_to_string(sample.join("snapshot.json")).expect("read snapshot"),
    )
    .expect("parse snapshot");

    let actual = parse_devices(&body).expect("decode sample");
    assert_eq!(actual, expected);
}

#[test]
fn sample_type_csv_loads_normalized_labels() {
    let table = TypeLookupTable::load(workspace_root().join("fixtures/boat_types.csv")).expect("load csv");
    assert_eq!(table.len(), 4);
    assert_eq!(table.get("1187"), Some("passenger ferry"));
    assert_eq!(table.get("88"), Some("speed boat"));
    assert_eq!(table.get("2203"), Some("landing craft"));
    assert_eq!(table.get("1032"), Some("excursion boat"));
}
