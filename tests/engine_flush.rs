use lsm_compaction::{BufferPool, Config, InternalValue};

#[test_log::test]
fn flush_creates_l0_table() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).open()?;

    engine.insert("a", "v1", 0);
    engine.insert("b", "v2", 1);
    engine.remove("c", 2);

    engine.flush_active_memtable()?;

    let version = engine.current_version();
    assert_eq!(1, version.level(0).expect("L0 exists").len());
    assert_eq!(1, engine.metrics.flush_count());

    let table = version
        .level(0)
        .and_then(|l| l.tables.first())
        .expect("table exists")
        .clone();

    assert_eq!(3, table.metadata.item_count);
    assert_eq!(1, table.metadata.tombstone_count);
    assert_eq!((0, 2), table.seqnos());

    Ok(())
}

#[test_log::test]
fn flush_never_elides_tombstones() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).open()?;

    // Only tombstones; nothing below them anywhere, but a flush cannot
    // see sibling memtables, so they must survive
    engine.remove("a", 0);
    engine.remove_range("b", "d", 1);

    engine.flush_active_memtable()?;

    let version = engine.current_version();
    let table = version
        .level(0)
        .and_then(|l| l.tables.first())
        .expect("table exists")
        .clone();

    assert_eq!(1, table.metadata.tombstone_count);
    assert_eq!(1, table.metadata.range_del_count);

    Ok(())
}

#[test_log::test]
fn flush_empty_memtable_is_no_op() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).open()?;
    engine.flush_active_memtable()?;

    assert_eq!(0, engine.current_version().table_count());

    Ok(())
}

#[test_log::test]
fn flush_threshold_gates_scheduler() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).memtable_size(1_000_000).open()?;

    engine.insert("a", "v", 0);
    let sealed = engine.rotate_memtable()?.expect("memtable was not empty");

    // Way below memtable_size / 2 and not forced: nothing runs
    assert_eq!(0, engine.run_scheduler_pass()?);
    assert!(engine.ready_for_flush_bytes() > 0);

    // Forcing the sealed memtable makes the next pass start a flush
    sealed.force_flush();
    assert_eq!(1, engine.run_scheduler_pass()?);
    assert_eq!(0, engine.ready_for_flush_bytes());
    assert_eq!(1, engine.current_version().table_count());

    Ok(())
}

#[test_log::test]
fn flush_same_input_twice_is_deterministic() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).open()?;

    for run in 0..2 {
        let _ = run;
        engine.insert("a", "v1", 0);
        engine.insert("b", "v2", 1);
        engine.remove_range("c", "e", 2);
        engine.flush_active_memtable()?;
    }

    let version = engine.current_version();
    let l0 = version.level(0).expect("L0 exists");
    assert_eq!(2, l0.len());

    let pool = BufferPool::default();

    let mut contents: Vec<(Vec<InternalValue>, _)> = vec![];

    for table in l0.iter() {
        let items = table.scan(&pool)?.collect::<lsm_compaction::Result<Vec<_>>>()?;
        let ranges = table.range_blocks(&pool)?;
        contents.push((items, ranges));
    }

    // Same input -> same output, modulo file numbers
    assert_eq!(contents.first(), contents.last());

    Ok(())
}
