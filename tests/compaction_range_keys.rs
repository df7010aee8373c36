use lsm_compaction::{BufferPool, Config, KeyKind};

#[test_log::test]
fn range_keys_survive_flush() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).open()?;

    engine.set_range_key("a", "c", "@5", "foo", 1);
    engine.insert("b", "v", 2);
    engine.flush_active_memtable()?;

    let version = engine.current_version();
    let table = version
        .level(0)
        .and_then(|l| l.tables.first())
        .expect("table exists")
        .clone();

    assert_eq!(1, table.metadata.range_key_count);

    let pool = BufferPool::default();
    let (_, range_keys) = table.range_blocks(&pool)?;

    let rk = range_keys.first().expect("range key exists");
    assert_eq!(*b"a", *rk.start);
    assert_eq!(*b"c", *rk.end);
    assert_eq!(KeyKind::RangeKeySet, rk.entry.kind);
    assert_eq!(*b"@5", *rk.entry.suffix);

    Ok(())
}

/// A RANGEKEYDEL over a range key, compacted with nothing below in use,
/// annihilates the whole span (last-stripe elision).
#[test_log::test]
fn range_key_delete_elides_at_bottom() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).open()?;

    engine.set_range_key("a", "c", "@5", "foo", 1);
    engine.flush_active_memtable()?;

    engine.delete_range_keys("a", "c", 2);
    engine.flush_active_memtable()?;

    assert_eq!(2, engine.current_version().table_count());

    engine.compact_range("a", "z", Some(0));
    engine.run_scheduler_pass()?;

    // The set is shadowed by the delete, and the delete itself is elided:
    // nothing remains
    assert_eq!(0, engine.current_version().table_count());

    Ok(())
}

/// An open snapshot between the set and the delete pins the set — and the
/// delete must then survive too, or the pinned set would resurrect for
/// readers above the snapshot.
#[test_log::test]
fn range_key_delete_respects_snapshots() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).open()?;

    engine.set_range_key("a", "c", "@5", "foo", 1);
    engine.flush_active_memtable()?;

    engine.open_snapshot(1);

    engine.delete_range_keys("a", "c", 5);
    engine.flush_active_memtable()?;

    engine.compact_range("a", "z", Some(0));
    engine.run_scheduler_pass()?;

    let version = engine.current_version();
    assert_eq!(1, version.table_count());

    let table = version.iter_tables().next().expect("table exists").clone();
    let pool = BufferPool::default();
    let (_, range_keys) = table.range_blocks(&pool)?;

    assert_eq!(
        vec![KeyKind::RangeKeyDelete, KeyKind::RangeKeySet],
        range_keys
            .iter()
            .map(|rk| rk.entry.kind)
            .collect::<Vec<_>>(),
    );

    Ok(())
}
