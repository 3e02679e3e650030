//! Property tests for the allocator and the eviction buffer
//!
//! Uses proptest to drive random operation sequences and checks the
//! structural invariants after every step.

use proptest::prelude::*;

// =============================================================================
// Allocator
// =============================================================================

mod allocator {
    use super::*;
    use boxcache::{FileRange, FileSpaceAllocator, ShrinkPolicy};

    #[derive(Debug, Clone)]
    enum Op {
        Allocate(u64),
        Release(usize),
        Reallocate(usize, u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (1u64..256).prop_map(Op::Allocate),
            3 => any::<usize>().prop_map(Op::Release),
            3 => (any::<usize>(), 1u64..384).prop_map(|(i, len)| Op::Reallocate(i, len)),
        ]
    }

    fn policy() -> impl Strategy<Value = ShrinkPolicy> {
        prop_oneof![Just(ShrinkPolicy::KeepInPlace), Just(ShrinkPolicy::Relocate)]
    }

    fn check(allocator: &FileSpaceAllocator, owned: &[FileRange]) -> Result<(), TestCaseError> {
        prop_assert!(allocator.check_invariants().is_ok());

        let eof = allocator.end_of_file();
        let free = allocator.free_space_map();
        let mut all: Vec<FileRange> = owned.iter().chain(free.iter()).copied().collect();
        all.sort();

        for pair in all.windows(2) {
            prop_assert!(
                !pair[0].overlaps(&pair[1]),
                "{} overlaps {}",
                pair[0],
                pair[1]
            );
        }
        for range in &all {
            prop_assert!(range.end() <= eof);
        }

        // Every byte below end-of-file is either free or owned
        let owned_bytes: u64 = owned.iter().map(|r| r.length).sum();
        prop_assert_eq!(owned_bytes + allocator.free_bytes(), eof);
        Ok(())
    }

    proptest! {
        /// Random allocate/release/reallocate sequences keep ranges disjoint
        #[test]
        fn ranges_stay_disjoint(
            policy in policy(),
            ops in prop::collection::vec(op(), 1..200)
        ) {
            let allocator = FileSpaceAllocator::new(policy);
            let mut owned: Vec<FileRange> = Vec::new();

            for op in ops {
                match op {
                    Op::Allocate(len) => {
                        let offset = allocator.allocate(len).unwrap();
                        owned.push(FileRange::new(offset, len));
                    }
                    Op::Release(i) if !owned.is_empty() => {
                        let range = owned.swap_remove(i % owned.len());
                        allocator.release(range.offset, range.length).unwrap();
                    }
                    Op::Reallocate(i, len) if !owned.is_empty() => {
                        let i = i % owned.len();
                        owned[i] = allocator.reallocate(owned[i], len).unwrap();
                        prop_assert!(owned[i].length >= len);
                    }
                    _ => {}
                }
                check(&allocator, &owned)?;
            }

            let eof = allocator.end_of_file();
            for range in owned.drain(..) {
                allocator.release(range.offset, range.length).unwrap();
            }
            if eof > 0 {
                prop_assert_eq!(allocator.free_space_map(), vec![FileRange::new(0, eof)]);
            } else {
                prop_assert!(allocator.free_space_map().is_empty());
            }
        }

        /// Releasing something that is already free is always rejected
        #[test]
        fn double_release_rejected(lens in prop::collection::vec(1u64..128, 1..20)) {
            let allocator = FileSpaceAllocator::default();
            let ranges: Vec<FileRange> = lens
                .iter()
                .map(|&len| FileRange::new(allocator.allocate(len).unwrap(), len))
                .collect();

            let victim = ranges[ranges.len() / 2];
            allocator.release(victim.offset, victim.length).unwrap();
            let before = allocator.free_space_map();

            prop_assert!(allocator.release(victim.offset, victim.length).is_err());
            prop_assert_eq!(allocator.free_space_map(), before);
        }
    }
}

// =============================================================================
// Eviction buffer
// =============================================================================

mod buffer {
    use super::*;
    use boxcache::storage::BackingFile;
    use boxcache::units::ByteBlock;
    use boxcache::{CacheConfig, Cacheable, EvictionBuffer, FileSpaceAllocator, UnitRef};
    use std::sync::Arc;
    use tempfile::TempDir;

    const UNITS: usize = 6;

    #[derive(Debug, Clone)]
    enum Op {
        Touch(usize),
        /// Pin, resize by the given amount, unpin
        Mutate(usize, i16),
        SetBudget(u64),
        Flush,
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0..UNITS).prop_map(Op::Touch),
            4 => ((0..UNITS), -40i16..80).prop_map(|(i, d)| Op::Mutate(i, d)),
            1 => (50u64..600).prop_map(Op::SetBudget),
            1 => Just(Op::Flush),
            1 => (0..UNITS).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Random touch/mutate/evict sequences keep the bookkeeping exact and
        /// never lose data
        #[test]
        fn bookkeeping_survives_random_ops(ops in prop::collection::vec(op(), 1..120)) {
            let temp_dir = TempDir::new().unwrap();
            let file = Arc::new(BackingFile::create(temp_dir.path().join("fuzz.bin")).unwrap());
            let config = CacheConfig::new(300).with_metrics(false);
            let buffer = EvictionBuffer::new(&config, file, Arc::new(FileSpaceAllocator::default()));

            let blocks: Vec<Arc<ByteBlock>> = (0..UNITS)
                .map(|i| Arc::new(ByteBlock::new(vec![i as u8; 60])))
                .collect();
            let units: Vec<UnitRef> = blocks.iter().map(|b| b.clone() as UnitRef).collect();
            let mut expected: Vec<Vec<u8>> = (0..UNITS).map(|i| vec![i as u8; 60]).collect();

            for op in ops {
                match op {
                    Op::Touch(i) => {
                        buffer.touch(&units[i]).unwrap();
                    }
                    Op::Mutate(i, delta) => {
                        let guard = buffer.pin(&units[i]).unwrap();
                        let fill = (expected[i].len() % 251) as u8;
                        let (_, size_delta) = blocks[i]
                            .update(|bytes| {
                                if delta >= 0 {
                                    bytes.extend(std::iter::repeat(fill).take(delta as usize));
                                } else {
                                    let keep = bytes.len().saturating_sub(delta.unsigned_abs() as usize);
                                    bytes.truncate(keep);
                                }
                            })
                            .unwrap();
                        guard.mark_changed(size_delta);
                        drop(guard);

                        if delta >= 0 {
                            expected[i].extend(std::iter::repeat(fill).take(delta as usize));
                        } else {
                            let keep = expected[i].len().saturating_sub(delta.unsigned_abs() as usize);
                            expected[i].truncate(keep);
                        }
                    }
                    Op::SetBudget(bytes) => {
                        buffer.set_budget(bytes);
                        buffer.ensure_budget().unwrap();
                    }
                    Op::Flush => {
                        buffer.flush_all().unwrap();
                    }
                    Op::Remove(i) => {
                        // A removed unit keeps its data in memory; bring it back
                        buffer.remove(&units[i]);
                        buffer.touch(&units[i]).unwrap();
                    }
                }

                prop_assert!(buffer.check_invariants().is_ok());
                prop_assert!(buffer.allocator().check_invariants().is_ok());
                for unit in &units {
                    let snap = unit.state().snapshot();
                    prop_assert!(!snap.dirty || snap.loaded, "dirty unit not loaded");
                    prop_assert!(!snap.busy);
                }
            }

            // Everything reads back as written
            buffer.set_budget(u64::MAX);
            for (i, unit) in units.iter().enumerate() {
                buffer.touch(unit).unwrap();
                prop_assert_eq!(&blocks[i].to_vec().unwrap(), &expected[i]);
            }
        }
    }
}
