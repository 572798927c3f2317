/// Synthetic upsert, soft delete, and the lift pass.
use meter_store::store::{EntryQuery, EntryType, MeterEntry, RecStatus, Store};
use meter_store::{DataManager, MeterReading};

const BASE_TIME: i64 = 1_483_228_800;
const NODE: &str = "99.99.99.99.1";

fn data_mgr() -> (tempfile::TempDir, DataManager) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Store::open(&dir.path().join("meter_data_test.db")).expect("open store");
    (dir, DataManager::new(store))
}

fn seed_observed(data: &mut DataManager, start: i64, count: usize, start_value: i64) {
    let readings: Vec<MeterReading> = (0..count as i64)
        .map(|i| MeterReading {
            when_start: start + i * 60,
            entry_value: 5,
            entry_interval_length: 60,
            meter_value: start_value + (i + 1) * 5,
        })
        .collect();
    data.proc_meter_update(NODE, &readings);
}

fn synth_readings(start: i64, count: usize, start_value: i64, step: i64) -> Vec<MeterReading> {
    (0..count as i64)
        .map(|i| MeterReading {
            when_start: start + i * 60,
            entry_value: step,
            entry_interval_length: 60,
            meter_value: start_value + (i + 1) * step,
        })
        .collect()
}

fn all_rows(data: &DataManager) -> Vec<MeterEntry> {
    let mut rows = data
        .store()
        .meter_entries(&EntryQuery {
            node_uuid: Some(NODE),
            ..EntryQuery::default()
        })
        .expect("query all rows");
    rows.sort_by_key(|r| r.when_start);
    rows
}

#[test]
fn upsert_marks_prior_updates_deleted_and_writes_synth_rows() {
    let (_dir, mut data) = data_mgr();
    seed_observed(&mut data, BASE_TIME, 5, 1000);

    let readings = synth_readings(BASE_TIME, 5, 2000, 10);
    data.upsert_synth_meter_updates(
        NODE,
        BASE_TIME,
        BASE_TIME + 5 * 60,
        &readings,
        true,
        false,
    )
    .expect("upsert");

    let rows = all_rows(&data);
    let deleted: Vec<&MeterEntry> = rows
        .iter()
        .filter(|r| r.rec_status == RecStatus::Deleted)
        .collect();
    assert_eq!(deleted.len(), 5, "every observed MUP in range is masked");
    assert!(deleted.iter().all(|r| r.entry_type == EntryType::MeterUpdate));

    let rebases: Vec<&MeterEntry> = rows
        .iter()
        .filter(|r| r.entry_type == EntryType::MeterRebaseSynth)
        .collect();
    assert_eq!(rebases.len(), 1);
    assert_eq!(rebases[0].when_start, BASE_TIME);
    assert_eq!(rebases[0].meter_value, 2010, "anchored at the first reading");
    assert_eq!(rebases[0].entry_value, 0);
    assert_eq!(rebases[0].duration, 0);

    let synths: Vec<&MeterEntry> = rows
        .iter()
        .filter(|r| r.entry_type == EntryType::MeterUpdateSynth)
        .collect();
    assert_eq!(synths.len(), 5);
    assert!(synths.iter().all(|r| r.rec_status == RecStatus::Norm));
}

#[test]
fn upsert_without_rebase_first_skips_the_anchor() {
    let (_dir, mut data) = data_mgr();
    let readings = synth_readings(BASE_TIME, 3, 0, 10);
    data.upsert_synth_meter_updates(
        NODE,
        BASE_TIME,
        BASE_TIME + 3 * 60,
        &readings,
        false,
        false,
    )
    .expect("upsert");

    let rows = all_rows(&data);
    assert!(
        rows.iter()
            .all(|r| r.entry_type != EntryType::MeterRebaseSynth)
    );
    assert_eq!(rows.len(), 3);
}

#[test]
fn repeated_soft_delete_is_idempotent() {
    let (_dir, mut data) = data_mgr();
    seed_observed(&mut data, BASE_TIME, 10, 1000);

    let first = data
        .delete_meter_entries_in_range(Some(NODE), BASE_TIME, BASE_TIME + 10 * 60, None)
        .expect("first delete");
    assert_eq!(first, 10);
    let after_first = all_rows(&data);

    data.delete_meter_entries_in_range(Some(NODE), BASE_TIME, BASE_TIME + 10 * 60, None)
        .expect("second delete");
    let after_second = all_rows(&data);

    assert_eq!(after_first, after_second);
    assert!(
        after_second
            .iter()
            .all(|r| r.rec_status == RecStatus::Deleted)
    );
}

#[test]
fn soft_delete_filters_by_entry_type() {
    let (_dir, mut data) = data_mgr();
    seed_observed(&mut data, BASE_TIME, 3, 1000);
    data.proc_meter_rebase(NODE, BASE_TIME + 30, 5000);

    data.delete_meter_entries_in_range(
        Some(NODE),
        BASE_TIME,
        BASE_TIME + 600,
        Some(EntryType::MeterRebase),
    )
    .expect("delete rebases only");

    let rows = all_rows(&data);
    for row in rows {
        if row.entry_type == EntryType::MeterRebase {
            assert_eq!(row.rec_status, RecStatus::Deleted);
        } else {
            assert_eq!(row.rec_status, RecStatus::Norm);
        }
    }
}

#[test]
fn lift_re_anchors_later_entries_monotonically() {
    let (_dir, mut data) = data_mgr();
    // Later observed tail: values 1005..=1025 starting one hour after the
    // overwrite window.
    let tail_start = BASE_TIME + 3600;
    seed_observed(&mut data, tail_start, 5, 1000);

    // Splice a much larger synthetic block before the tail and lift.
    let readings = synth_readings(BASE_TIME, 4, 9000, 25);
    data.upsert_synth_meter_updates(NODE, BASE_TIME, BASE_TIME + 600, &readings, true, true)
        .expect("upsert with lift");

    let rows = all_rows(&data);
    let tail: Vec<&MeterEntry> = rows
        .iter()
        .filter(|r| r.when_start >= tail_start && r.rec_status == RecStatus::Norm)
        .collect();
    assert_eq!(tail.len(), 5);

    // Each later entry is the previous cumulative value plus its own delta,
    // re-anchored on the last synthetic reading (9100).
    let mut expected = 9100;
    for row in &tail {
        expected += row.entry_value;
        assert_eq!(row.meter_value, expected);
    }

    // Strictly increasing across the whole NORM series.
    let norm: Vec<&MeterEntry> = rows
        .iter()
        .filter(|r| r.rec_status == RecStatus::Norm && r.entry_type.is_update())
        .collect();
    for pair in norm.windows(2) {
        assert!(
            pair[1].meter_value > pair[0].meter_value,
            "{} !> {}",
            pair[1].meter_value,
            pair[0].meter_value
        );
    }
}

#[test]
fn upsert_with_no_readings_only_masks_the_range() {
    let (_dir, mut data) = data_mgr();
    seed_observed(&mut data, BASE_TIME, 3, 1000);
    data.upsert_synth_meter_updates(NODE, BASE_TIME, BASE_TIME + 600, &[], true, true)
        .expect("empty upsert is a no-op beyond the delete");
    let rows = all_rows(&data);
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.rec_status == RecStatus::Deleted));
}
