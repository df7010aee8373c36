use lsm_compaction::Config;

/// Builds: a small file at L3, then a wide range tombstone above it.
/// Compacting the tombstone down derives a deletion hint; once no snapshot
/// separates the two, a delete-only compaction drops the covered file
/// without a merge.
#[test_log::test]
fn hint_resolves_into_delete_only_compaction() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).open()?;

    // A file with keys [b, c] at seqnos 1..=2, pushed down to L3
    engine.insert("b", "v1", 1);
    engine.insert("c", "v2", 2);
    engine.flush_active_memtable()?;

    for level in 0..3 {
        engine.compact_range("a", "z", Some(level));
        engine.run_scheduler_pass()?;
    }

    let covered_id = {
        let version = engine.current_version();
        let table = version
            .level(3)
            .and_then(|l| l.tables.first())
            .expect("file sits at L3");
        table.id()
    };

    // A snapshot at 5 separates the covered file (seqnos 1..=2) from the
    // tombstone (seqno 10): the hint must not resolve yet
    engine.open_snapshot(5);

    // A wide tombstone over everything, plus a sibling point flush so the
    // L0 compaction is not a trivial move
    engine.remove_range("a", "z", 10);
    engine.flush_active_memtable()?;

    engine.insert("x", "v", 11);
    engine.flush_active_memtable()?;

    engine.compact_range("a", "z", Some(0));
    engine.run_scheduler_pass()?;

    // Tombstone now sits at L1; hint derived but unresolvable
    engine.run_scheduler_pass()?;
    assert_eq!(0, engine.metrics.delete_only_count());
    assert!(engine
        .current_version()
        .iter_tables()
        .any(|t| t.id() == covered_id));

    // Closing the snapshot merges the stripes; the hint resolves
    engine.close_snapshot(5);
    engine.run_scheduler_pass()?;

    assert_eq!(1, engine.metrics.delete_only_count());
    assert!(!engine
        .current_version()
        .iter_tables()
        .any(|t| t.id() == covered_id));

    Ok(())
}
