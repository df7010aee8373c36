use lsm_compaction::Config;

#[test_log::test]
fn compacted_inputs_are_swept() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).open()?;

    engine.insert("a", "v1", 0);
    engine.flush_active_memtable()?;
    engine.insert("b", "v2", 1);
    engine.flush_active_memtable()?;

    let old_ids = engine
        .current_version()
        .iter_tables()
        .map(|t| t.id())
        .collect::<Vec<_>>();

    engine.compact_range("a", "z", Some(0));
    engine.run_scheduler_pass()?;

    // The input files were deleted from disk by the sweeper
    for id in old_ids {
        assert!(!engine.tables_folder().join(id.to_string()).try_exists()?);
    }

    // No live file is ever considered obsolete
    assert!(engine.scan_obsolete_files()?.is_empty());

    for table in engine.current_version().iter_tables() {
        assert!(table.path.try_exists()?);
    }

    Ok(())
}

#[test_log::test]
fn disabled_file_deletions_defer_the_sweep() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).open()?;

    engine.insert("a", "v1", 0);
    engine.flush_active_memtable()?;
    engine.insert("b", "v2", 1);
    engine.flush_active_memtable()?;

    let old_ids = engine
        .current_version()
        .iter_tables()
        .map(|t| t.id())
        .collect::<Vec<_>>();

    engine.disable_file_deletions();

    engine.compact_range("a", "z", Some(0));
    engine.run_scheduler_pass()?;

    // Inputs are obsolete but still on disk
    for id in &old_ids {
        assert!(engine.tables_folder().join(id.to_string()).try_exists()?);
    }

    let obsolete = engine.scan_obsolete_files()?;

    for id in &old_ids {
        let path = engine.tables_folder().join(id.to_string());
        assert!(obsolete.contains(&path));
    }

    engine.enable_file_deletions();
    engine.delete_obsolete_files()?;

    for id in &old_ids {
        assert!(!engine.tables_folder().join(id.to_string()).try_exists()?);
    }

    Ok(())
}

#[test_log::test]
fn old_wal_segments_become_obsolete() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).open()?;

    engine.insert("a", "v1", 0);
    engine.flush_active_memtable()?;

    // The flushed memtable's segment is below the minimum unflushed one
    let stale = lsm_compaction::wal::obsolete(&engine.wal_folder(), engine.min_unflushed_log_num())?;
    assert!(stale.is_empty(), "sweeper should have removed them already");

    Ok(())
}
