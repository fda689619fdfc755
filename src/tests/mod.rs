//! End-to-end scenarios: ingest through query, crash recovery,
//! compaction and rollup, against a real data directory.

use std::path::Path;
use std::time::Duration;

use crate::common::time::{TimeRange, SECS_PER_DAY, SECS_PER_HOUR};
use crate::common::types::Tag;
use crate::compress::CompressorVersion;
use crate::config::Settings;
use crate::query::{execute, Aggregator, DownsampleSpec, Query, TagMatcher};
use crate::storage::compact::compact_tsdb;
use crate::tsdb::database::Database;
use crate::tsdb::rollup::rollup_tsdb;
use crate::{TimeUnit, TsdbError};

fn settings_for(dir: &Path) -> Settings {
    Settings { data_dir: dir.to_path_buf(), ..Default::default() }
}

fn tag(key: &str, value: &str) -> Tag {
    Tag::new(key, value).unwrap()
}

fn dps_of(db: &Database, metric: &str, range: TimeRange) -> Vec<(i64, f64)> {
    let rows = execute(db, &Query::new(metric, range)).unwrap();
    assert!(rows.len() <= 1, "expected at most one series");
    rows.into_iter().flat_map(|r| r.dps).collect()
}

#[test]
fn scenario_ingest_flush_query() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(settings_for(dir.path())).unwrap();

    let tags = [tag("host", "a")];
    db.add_data_point("cpu", &tags, 1000, 1.5).unwrap();
    db.add_data_point("cpu", &tags, 1060, 2.5).unwrap();
    db.add_data_point("cpu", &tags, 1120, 3.5).unwrap();
    db.flush(true).unwrap();

    let dps = dps_of(&db, "cpu", TimeRange::new(1000, 1121));
    assert_eq!(dps, vec![(1000, 1.5), (1060, 2.5), (1120, 3.5)]);

    // the half-open range excludes the last point
    let dps = dps_of(&db, "cpu", TimeRange::new(1000, 1120));
    assert_eq!(dps.len(), 2);
}

#[test]
fn scenario_out_of_order_point() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(settings_for(dir.path())).unwrap();

    let tags = [tag("host", "a")];
    for i in 0..600i64 {
        db.add_data_point("cpu", &tags, 1000 + i, i as f64).unwrap();
    }
    db.add_data_point("cpu", &tags, 5, 42.0).unwrap();
    db.flush(true).unwrap();

    let series = db.get_or_create_series("cpu", &tags).unwrap();
    let tsdb = db.inst(1000, false).unwrap().unwrap();
    assert!(tsdb.index().get_out_of_order(series.id()).unwrap());

    let dps = dps_of(&db, "cpu", TimeRange::new(0, 2000));
    assert_eq!(dps.len(), 601);
    assert_eq!(dps[0], (5, 42.0));
    assert!(dps.windows(2).all(|w| w[0].0 <= w[1].0), "points must be sorted");
}

#[test]
fn scenario_wal_replay_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let tags = [tag("host", "a")];
    {
        let db = Database::open(settings_for(dir.path())).unwrap();
        db.add_data_point("cpu", &tags, 1000, 1.5).unwrap();
        db.wal_flush().unwrap();
        // dropped without shutdown(), as an abrupt termination would
    }

    let db = Database::open(settings_for(dir.path())).unwrap();
    assert_eq!(db.stats().wal_replayed.load(std::sync::atomic::Ordering::Relaxed), 1);
    let dps = dps_of(&db, "cpu", TimeRange::new(0, 2000));
    assert_eq!(dps, vec![(1000, 1.5)]);

    // replay followed by a clean shutdown is idempotent
    db.shutdown().unwrap();
    let db = Database::open(settings_for(dir.path())).unwrap();
    assert_eq!(db.stats().wal_replayed.load(std::sync::atomic::Ordering::Relaxed), 0);
    let dps = dps_of(&db, "cpu", TimeRange::new(0, 2000));
    assert_eq!(dps, vec![(1000, 1.5)]);
}

#[test]
fn scenario_compaction_preserves_points() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(settings_for(dir.path())).unwrap();

    let tags = [tag("host", "a")];
    for i in 0..10_000i64 {
        db.add_data_point("cpu", &tags, 1000 + i, (i % 97) as f64 * 0.5).unwrap();
    }
    db.rotate().unwrap();

    let range = TimeRange::new(0, SECS_PER_DAY);
    let before = dps_of(&db, "cpu", range);
    assert_eq!(before.len(), 10_000);

    let tsdb = db.inst(1000, false).unwrap().unwrap();
    compact_tsdb(&db, &tsdb).unwrap();
    let tsdb = db.inst(1000, false).unwrap().unwrap();
    assert!(tsdb.is_compacted());

    let after = dps_of(&db, "cpu", range);
    assert_eq!(before, after);
}

#[test]
fn scenario_hourly_rollup_average() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(settings_for(dir.path())).unwrap();

    // 26 hours of minutely points starting at 23:00, spanning three
    // daily windows
    let start = 23 * SECS_PER_HOUR;
    let tags = [tag("host", "a")];
    for i in 0..26 * 60 {
        let t = start + i * 60;
        db.add_data_point("cpu", &tags, t, (i % 7) as f64 * 1.25).unwrap();
    }
    db.flush(true).unwrap();
    assert_eq!(db.partitions().len(), 3);

    let middle = db.inst(SECS_PER_DAY, false).unwrap().unwrap();
    let middle_range = *middle.range();
    rollup_tsdb(&db, &middle).unwrap();
    assert!(middle.is_rolled_up());

    let query = Query::new("cpu", middle_range)
        .with_downsample(DownsampleSpec::parse("1h-avg", TimeUnit::Seconds).unwrap());
    let rows = execute(&db, &query).unwrap();
    assert_eq!(rows.len(), 1);
    let dps = &rows[0].dps;
    assert_eq!(dps.len(), 24);

    // every bucket value must equal the mean of its raw points
    let raw = dps_of(&db, "cpu", middle_range);
    for (bucket_ts, value) in dps {
        let hour: Vec<f64> = raw
            .iter()
            .filter(|(t, _)| *t >= *bucket_ts && *t < *bucket_ts + SECS_PER_HOUR)
            .map(|(_, v)| *v)
            .collect();
        assert!(!hour.is_empty());
        let mean = hour.iter().sum::<f64>() / hour.len() as f64;
        assert_eq!(*value, mean, "bucket at {bucket_ts}");
    }
}

#[test]
fn scenario_concurrent_writers_and_reader() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(settings_for(dir.path())).unwrap();
    const WRITES: i64 = 4000;

    std::thread::scope(|scope| {
        for w in 0..2 {
            let db = &db;
            scope.spawn(move || {
                let tags = [tag("host", &format!("w{w}"))];
                for i in 0..WRITES {
                    db.add_data_point("load", &tags, 1000 + i, i as f64).unwrap();
                }
            });
        }
        let db = &db;
        scope.spawn(move || {
            for _ in 0..50 {
                for w in 0..2 {
                    let host = format!("w{w}");
                    let matcher = TagMatcher::from_pairs([("host", host.as_str())], false);
                    let query = Query::new("load", TimeRange::new(0, i64::MAX))
                        .with_matcher(matcher);
                    // a chain must never appear broken mid-write
                    execute(db, &query).unwrap();
                }
                std::thread::yield_now();
            }
        });
    });

    for w in 0..2 {
        let host = format!("w{w}");
        let matcher = TagMatcher::from_pairs([("host", host.as_str())], false);
        let query =
            Query::new("load", TimeRange::new(0, i64::MAX)).with_matcher(matcher);
        let rows = execute(&db, &query).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].dps.len(), WRITES as usize);
    }
}

#[test]
fn point_at_window_end_goes_to_next_partition() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(settings_for(dir.path())).unwrap();
    let tags = [tag("host", "a")];

    db.add_data_point("cpu", &tags, SECS_PER_DAY - 1, 1.0).unwrap();
    db.add_data_point("cpu", &tags, SECS_PER_DAY, 2.0).unwrap();

    assert_eq!(db.partitions().len(), 2);
    let first = db.inst(SECS_PER_DAY - 1, false).unwrap().unwrap();
    let second = db.inst(SECS_PER_DAY, false).unwrap().unwrap();
    assert_eq!(first.range().to, SECS_PER_DAY);
    assert_eq!(second.range().from, SECS_PER_DAY);
}

#[test]
fn full_header_array_forces_new_file_pair() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        data_dir: dir.path().to_path_buf(),
        page_size: 128,
        page_count: 2,
        compressor_version: CompressorVersion::V0,
        ..Default::default()
    };
    let db = Database::open(settings).unwrap();
    let tags = [tag("host", "a")];

    // V0 at 128 bytes holds 8 points per page; 40 points span 5 pages,
    // overflowing the 2-page file twice
    for i in 0..40i64 {
        db.add_data_point("cpu", &tags, 1000 + i, i as f64).unwrap();
    }
    db.flush(true).unwrap();

    let mapping = db.get_mapping("cpu").unwrap();
    let metric_dir = db
        .inst(1000, false)
        .unwrap()
        .unwrap()
        .dir()
        .join(format!("m{:010}", mapping.metric_id()));
    assert!(metric_dir.join("header.00001").exists());
    assert!(metric_dir.join("data.00001").exists());

    let dps = dps_of(&db, "cpu", TimeRange::new(0, SECS_PER_DAY));
    assert_eq!(dps.len(), 40);
}

#[test]
fn resolution_mismatch_is_fatal_at_open() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Database::open(settings_for(dir.path())).unwrap();
        db.add_data_point("cpu", &[tag("host", "a")], 1000, 1.0).unwrap();
        db.shutdown().unwrap();
    }
    let ms_settings = Settings {
        time_unit: TimeUnit::Milliseconds,
        ..settings_for(dir.path())
    };
    let err = Database::open(ms_settings).unwrap_err();
    assert!(matches!(err, TsdbError::InvalidConfiguration(_)));
}

#[test]
fn metric_and_series_ids_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (cpu_id, series_id) = {
        let db = Database::open(settings_for(dir.path())).unwrap();
        db.add_data_point("mem", &[], 1000, 1.0).unwrap();
        db.add_data_point("cpu", &[tag("host", "a")], 1000, 1.0).unwrap();
        let mapping = db.get_mapping("cpu").unwrap();
        let series = db.get_or_create_series("cpu", &[tag("host", "a")]).unwrap();
        db.shutdown().unwrap();
        (mapping.metric_id(), series.id())
    };

    let db = Database::open(settings_for(dir.path())).unwrap();
    assert_eq!(db.get_mapping("cpu").unwrap().metric_id(), cpu_id);
    let series = db.get_or_create_series("cpu", &[tag("host", "a")]).unwrap();
    assert_eq!(series.id(), series_id);
}

#[test]
fn measurement_fields_become_series() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Database::open(settings_for(dir.path()))?;

    db.add_measurement("sensors", &[tag("site", "lab")], &[("temp", 21.5), ("rh", 40.0)], 1000)?;
    db.add_measurement("sensors", &[tag("site", "lab")], &[("temp", 22.0), ("rh", 41.0)], 1060)?;

    let rows = execute(&db, &Query::new("sensors", TimeRange::new(0, 2000)))?;
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.dps.len(), 2);
        assert_eq!(row.tags.get("site").map(String::as_str), Some("lab"));
    }

    let json = crate::query::rows_to_json(&rows)?;
    assert!(json.contains("\"site\":\"lab\""));
    Ok(())
}

#[test]
fn aggregator_sums_across_series() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(settings_for(dir.path())).unwrap();

    for host in ["a", "b"] {
        for i in 0..10i64 {
            db.add_data_point("cpu", &[tag("host", host)], 1000 + i * 60, 2.0).unwrap();
        }
    }
    let query = Query::new("cpu", TimeRange::new(0, SECS_PER_DAY))
        .with_aggregator(Aggregator::Sum);
    let rows = execute(&db, &query).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].dps.len(), 10);
    assert!(rows[0].dps.iter().all(|(_, v)| *v == 4.0));
    // host differs between the series, so it drops out of the tags
    assert!(rows[0].tags.is_empty());
}

#[test]
fn retention_floor_rejects_ancient_points() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings {
        retention_threshold: Duration::from_secs(7 * SECS_PER_DAY as u64),
        ..settings_for(dir.path())
    };
    let db = Database::open(settings).unwrap();
    let err = db.add_data_point("cpu", &[tag("host", "a")], 1000, 1.0).unwrap_err();
    assert!(matches!(err, TsdbError::SampleTooOld));

    let result = db.add_batch([("cpu".to_string(), vec![tag("host", "a")], 1000, 1.0)]);
    assert_eq!((result.success, result.failed), (0, 1));
}
