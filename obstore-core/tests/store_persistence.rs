//! End-to-end tests of durability, reopening and query composition.

use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use obstore_core::test_support::{rectangle, scenario_records, track_schema, xy_payload};
use obstore_core::{
    Filter, ObservationStore, PageStoreError, RecordKey, StoreConfig, StoreError, TupleReader,
};
use rstest::{fixture, rstest};
use tempfile::TempDir;

#[fixture]
fn config() -> (TempDir, StoreConfig) {
    let dir = TempDir::new().expect("create temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("obs/store.obs")).expect("utf-8 path");
    (dir, StoreConfig::new(path))
}

fn keys(store: &ObservationStore, filter: &Filter) -> Vec<RecordKey> {
    store
        .query("track", filter)
        .expect("valid query")
        .map(|record| record.expect("readable record").key)
        .collect()
}

#[rstest]
fn committed_records_survive_reopening(#[from(config)] (_dir, config): (TempDir, StoreConfig)) {
    {
        let store = ObservationStore::open(&config).expect("open store");
        let track = store.open_stream("track", track_schema(), true).expect("stream");
        for (key, payload) in scenario_records("buoy", 100) {
            store.append(&track, key.with_foi("harbour"), payload).expect("append");
        }
        store.commit().expect("commit");
    }

    let store = ObservationStore::open(&config).expect("reopen store");
    assert_eq!(store.streams(), vec![String::from("track")]);
    assert_eq!(store.stream_schema("track").expect("schema"), track_schema());
    assert_eq!(store.record_count("track").expect("count"), 100);
    let record = store
        .get("track", &RecordKey::new("buoy", 4.2))
        .expect("record survives");
    assert_eq!(record.payload, xy_payload(420.0, 211.0));
    assert_eq!(record.key.foi_id.as_deref(), Some("harbour"));

    let region = rectangle(0.0, 0.0, 100.0, 100.0);
    assert_eq!(store.query_region("track", &region).expect("region").len(), 11);
}

#[rstest]
fn uncommitted_records_are_absent_after_reopening(
    #[from(config)] (_dir, config): (TempDir, StoreConfig),
) {
    {
        let store = ObservationStore::open(&config).expect("open store");
        let track = store.open_stream("track", track_schema(), true).expect("stream");
        store
            .append(&track, RecordKey::new("a", 1.0), xy_payload(0.0, 0.0))
            .expect("append");
        store.commit().expect("commit");
        store
            .append(&track, RecordKey::new("a", 2.0), xy_payload(0.0, 0.0))
            .expect("append");
    }

    let store = ObservationStore::open(&config).expect("reopen store");
    let times: Vec<f64> = keys(&store, &Filter::new())
        .into_iter()
        .map(|key| key.timestamp)
        .collect();
    assert_eq!(times, vec![1.0]);
}

#[rstest]
fn overwritten_keys_keep_the_last_write(#[from(config)] (_dir, config): (TempDir, StoreConfig)) {
    let store = ObservationStore::open(&config).expect("open store");
    let track = store.open_stream("track", track_schema(), true).expect("stream");
    store
        .append(&track, RecordKey::new("a", 1.0), xy_payload(1.0, 1.0))
        .expect("append");
    store.commit().expect("commit");
    store
        .append(&track, RecordKey::new("a", 1.0), xy_payload(50.0, 50.0))
        .expect("append");
    store.commit().expect("commit");

    assert_eq!(store.record_count("track").expect("count"), 1);
    let near_origin = rectangle(0.0, 0.0, 2.0, 2.0);
    assert!(store.query_region("track", &near_origin).expect("region").is_empty());
    let record = store.get("track", &RecordKey::new("a", 1.0)).expect("record");
    assert_eq!(record.payload, xy_payload(50.0, 50.0));
}

#[rstest]
fn garbage_files_are_rejected(#[from(config)] (_dir, config): (TempDir, StoreConfig)) {
    let path = config.storage_path.clone();
    std::fs::create_dir_all(path.parent().expect("parent")).expect("create parent");
    std::fs::write(&path, vec![0xAB_u8; 512]).expect("write garbage");
    let err = ObservationStore::open(&config).expect_err("garbage is corrupt");
    assert!(matches!(
        err,
        StoreError::StorageIo(PageStoreError::Corrupt { .. })
    ));
}

#[rstest]
fn region_and_time_compose_as_an_intersection(
    #[from(config)] (_dir, config): (TempDir, StoreConfig),
) {
    let store = ObservationStore::open(&config).expect("open store");
    let track = store.open_stream("track", track_schema(), true).expect("stream");
    for producer in ["a", "b"] {
        for (key, payload) in scenario_records(producer, 200) {
            store.append(&track, key, payload).expect("append");
        }
    }
    store.commit().expect("commit");

    let roi = rectangle(300.0, 0.0, 1200.0, 2000.0);
    let by_time = Filter::new().with_time_range(5.0, 15.0);
    let by_region = Filter::new().with_roi(roi.clone());
    let both = Filter::new().with_time_range(5.0, 15.0).with_roi(roi);

    let time_keys: BTreeSet<RecordKey> = keys(&store, &by_time).into_iter().collect();
    let region_keys: BTreeSet<RecordKey> = keys(&store, &by_region).into_iter().collect();
    let expected: BTreeSet<RecordKey> = time_keys.intersection(&region_keys).cloned().collect();
    let combined = keys(&store, &both);

    assert!(!expected.is_empty());
    assert_eq!(combined.iter().cloned().collect::<BTreeSet<_>>(), expected);
    assert!(combined.windows(2).all(|pair| pair[0] < pair[1]));
}

#[rstest]
fn scenario_region_returns_the_expected_run(
    #[from(config)] (_dir, config): (TempDir, StoreConfig),
) {
    let store = ObservationStore::open(&config).expect("open store");
    let track = store.open_stream("track", track_schema(), true).expect("stream");
    for (key, payload) in scenario_records("sensor", 50_030) {
        store.append(&track, key, payload).expect("append");
    }
    store.commit().expect("commit");
    assert_eq!(store.record_count("track").expect("count"), 50_030);

    let roi = rectangle(1400.0, 25.0, 1500.0, 1300.0);
    let schema = track_schema();
    let records: Vec<_> = store
        .query("track", &Filter::new().with_roi(roi.clone()))
        .expect("valid query")
        .collect::<Result<_, _>>()
        .expect("readable records");
    let indices: Vec<f64> = records
        .iter()
        .map(|record| {
            TupleReader::new(&schema, &record.payload)
                .number(0)
                .expect("x field")
                / 10.0
        })
        .collect();
    let expected: Vec<f64> = (140_u32..=150).map(f64::from).collect();
    assert_eq!(indices, expected);
    assert!(
        records
            .windows(2)
            .all(|pair| pair[0].key.timestamp < pair[1].key.timestamp)
    );
    assert_eq!(store.query_region("track", &roi).expect("region").len(), 11);
}

#[rstest]
fn region_queries_fall_back_to_payload_checks_without_an_index(
    #[from(config)] (_dir, config): (TempDir, StoreConfig),
) {
    let store = ObservationStore::open(&config.with_location_indexing(false)).expect("open store");
    let track = store.open_stream("track", track_schema(), true).expect("stream");
    for (key, payload) in scenario_records("sensor", 300) {
        store.append(&track, key, payload).expect("append");
    }
    store.commit().expect("commit");

    let roi = rectangle(1400.0, 25.0, 1500.0, 1300.0);
    assert_eq!(keys(&store, &Filter::new().with_roi(roi.clone())).len(), 11);
    assert_eq!(store.count("track", &Filter::new().with_roi(roi), 5).expect("count"), 5);
}

#[rstest]
fn frequent_commits_keep_the_page_file_bounded(
    #[from(config)] (_dir, config): (TempDir, StoreConfig),
) {
    use obstore_core::page::COMPACTION_MIN_LEN;

    let store = ObservationStore::open(&config).expect("open store");
    let track = store.open_stream("track", track_schema(), true).expect("create stream");
    for i in 0..400_u32 {
        let value = f64::from(i);
        store
            .append(&track, RecordKey::new("buoy", value), xy_payload(value, value))
            .expect("append");
        store.commit().expect("commit");
        let len = std::fs::metadata(store.path()).expect("metadata").len();
        assert!(
            len < 2 * COMPACTION_MIN_LEN,
            "page file reached {len} bytes after {} commits",
            i + 1
        );
    }
    drop(store);

    let reopened = ObservationStore::open(&config).expect("reopen store");
    assert_eq!(reopened.record_count("track").expect("count"), 400);
    assert_eq!(
        keys(&reopened, &Filter::new().with_time_range(10.0, 12.0)),
        vec![
            RecordKey::new("buoy", 10.0),
            RecordKey::new("buoy", 11.0),
            RecordKey::new("buoy", 12.0),
        ]
    );
}

#[rstest]
#[case::newest_outside_region(rectangle(0.0, 0.0, 1.0, 1.0), Vec::new())]
#[case::newest_inside_region(rectangle(40.0, 40.0, 60.0, 60.0), vec![2.0])]
fn latest_with_a_region_ignores_spatial_indexing(
    #[from(config)] (_dir, config): (TempDir, StoreConfig),
    #[case] region: geo::Polygon<f64>,
    #[case] expected: Vec<f64>,
) {
    let store = ObservationStore::open(&config).expect("open store");
    for (name, indexed) in [("indexed", true), ("unindexed", false)] {
        let handle = store.open_stream(name, track_schema(), indexed).expect("create stream");
        store
            .append(&handle, RecordKey::new("a", 1.0), xy_payload(0.5, 0.5))
            .expect("append older");
        store
            .append(&handle, RecordKey::new("a", 2.0), xy_payload(50.0, 50.0))
            .expect("append newer");
    }
    store.commit().expect("commit");

    let filter = Filter::new().latest().with_roi(region);
    for name in ["indexed", "unindexed"] {
        let times: Vec<f64> = store
            .query(name, &filter)
            .expect("valid query")
            .map(|record| record.expect("readable record").key.timestamp)
            .collect();
        assert_eq!(times, expected, "stream `{name}`");
    }
}
