use lsm_compaction::{BufferPool, Config, RangeTombstone};

/// With a 1-byte target file size, every user key lands in its own output.
/// A range tombstone spanning exactly `[a, b)` must be emitted into the
/// first output only.
#[test_log::test]
fn rangedel_ending_at_split_key_stays_in_first_output() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).target_file_size(1).open()?;

    engine.insert("a", "v", 1);
    engine.insert("b", "v", 2);
    engine.insert("c", "v", 3);
    engine.remove_range("a", "b", 4);

    engine.flush_active_memtable()?;

    let version = engine.current_version();
    let l0 = version.level(0).expect("L0 exists");
    assert_eq!(3, l0.len());

    let pool = BufferPool::default();

    for table in l0.iter() {
        let (range_dels, _) = table.range_blocks(&pool)?;

        let holds_a = table
            .metadata
            .point_key_range
            .as_ref()
            .is_some_and(|r| r.contains_key(b"a"));

        if holds_a {
            assert_eq!(vec![RangeTombstone::new("a", "b", 4)], range_dels);
        } else {
            assert!(
                range_dels.is_empty(),
                "tombstone leaked into a later output",
            );
        }
    }

    Ok(())
}

/// A tombstone wider than one output is fragmented: adjacent outputs may
/// both carry a piece of it, and the pieces reassemble to the original span.
#[test_log::test]
fn wide_rangedel_is_fragmented_across_outputs() -> lsm_compaction::Result<()> {
    let folder = tempfile::tempdir()?;

    let engine = Config::new(folder.path()).target_file_size(1).open()?;

    engine.insert("a", "v", 1);
    engine.insert("b", "v", 2);
    engine.insert("c", "v", 3);
    engine.remove_range("a", "z", 4);

    engine.flush_active_memtable()?;

    let version = engine.current_version();
    let l0 = version.level(0).expect("L0 exists");
    assert_eq!(3, l0.len());

    let pool = BufferPool::default();

    let mut pieces = vec![];
    for table in l0.iter() {
        let (range_dels, _) = table.range_blocks(&pool)?;
        pieces.extend(range_dels);
    }

    pieces.sort();

    // The pieces tile [a, z) without gaps
    assert!(pieces.len() >= 2);
    assert_eq!(*b"a", **pieces.first().map(|t| &t.start).expect("non-empty"));
    assert_eq!(*b"z", **pieces.last().map(|t| &t.end).expect("non-empty"));

    for window in pieces.windows(2) {
        assert_eq!(window[0].end, window[1].start);
    }

    Ok(())
}
