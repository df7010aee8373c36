use lsm_compaction::{Config, KeyRange};
use rand::prelude::*;

/// Randomized churn: inserts, deletes, range deletes, flushes and manual
/// compactions, checking the structural invariants after every step.
#[test_log::test]
fn randomized_runs_uphold_invariants() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).target_file_size(256).open()?;

    let mut rng = StdRng::seed_from_u64(42);
    let mut seqno = 0u64;

    for round in 0..10 {
        for _ in 0..50 {
            let key = format!("key{:04}", rng.random_range(0..200u32));

            match rng.random_range(0..10u8) {
                0 => engine.remove(key.as_str(), seqno),
                1 => {
                    let end = format!("key{:04}", rng.random_range(0..200u32));
                    if key < end {
                        engine.remove_range(key.as_str(), end.as_str(), seqno);
                    }
                }
                _ => engine.insert(key.as_str(), format!("value{round}").as_str(), seqno),
            }

            seqno += 1;
        }

        engine.flush_active_memtable()?;

        if round % 3 == 2 {
            engine.compact_range("key0000", "key9999", None);
            engine.run_scheduler_pass()?;
        }

        let version = engine.current_version();

        // Non-L0 levels are pairwise key-disjoint
        for level in version.iter_levels().skip(1) {
            assert!(level.is_disjoint());
        }

        // Every referenced file exists on disk
        for table in version.iter_tables() {
            assert!(table.path.try_exists()?);
        }

        // No live file is in the obsolete list
        let obsolete = engine.scan_obsolete_files()?;
        for table in version.iter_tables() {
            assert!(!obsolete.contains(&table.path));
        }
    }

    // A final full compaction must still produce a valid shape
    engine.compact_range("key0000", "key9999", None);
    while engine.run_scheduler_pass()? > 0 {}

    let version = engine.current_version();
    for level in version.iter_levels().skip(1) {
        assert!(level.is_disjoint());
    }

    // Outputs of the last compaction lie within its bounds
    let bounds = KeyRange::new(("key0000".into(), "key9999".into()));
    for table in version.iter_tables() {
        assert!(bounds.contains_range(&table.key_range()));
    }

    Ok(())
}
