use crate::{
    check_sectors, CreateOptions, DiskGeometry, ImageSet, MemBackend, OpenOptions, VhdImage,
    SECTOR_SIZE,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u64, count: u64, fill: u8 },
    Read { offset: u64, count: u64 },
    Flush,
    Reopen,
}

const MAX_SECTORS: u16 = 256;
const MAX_OPS: usize = 48;
const MAX_COUNT: u64 = 24;

fn sectors_strategy() -> impl Strategy<Value = u16> {
    1u16..=MAX_SECTORS
}

fn block_size_strategy() -> impl Strategy<Value = u32> {
    // Small blocks force many allocations and bitmap switches.
    prop_oneof![Just(512u32), Just(2048u32), Just(4096u32), Just(16 * 1024u32)]
}

fn op_strategy(sectors: u16) -> BoxedStrategy<Op> {
    // Offsets deliberately run past the end to exercise truncation.
    let max_offset = sectors as u64 + 4;
    prop_oneof![
        4 => (0..=max_offset, 1..=MAX_COUNT, any::<u8>())
            .prop_map(|(offset, count, fill)| Op::Write { offset, count, fill }),
        4 => (0..=max_offset, 1..=MAX_COUNT).prop_map(|(offset, count)| Op::Read { offset, count }),
        1 => Just(Op::Flush),
        1 => Just(Op::Reopen),
    ]
    .boxed()
}

fn scenario_strategy() -> BoxedStrategy<(u16, u32, Vec<Op>)> {
    (sectors_strategy(), block_size_strategy())
        .prop_flat_map(|(sectors, block_size)| {
            (
                Just(sectors),
                Just(block_size),
                prop::collection::vec(op_strategy(sectors), 0..MAX_OPS),
            )
        })
        .boxed()
}

fn options(sectors: u16, block_size: u32, unique: u8) -> CreateOptions {
    CreateOptions {
        size_bytes: sectors as u64 * SECTOR_SIZE as u64,
        block_size,
        geometry: Some(DiskGeometry {
            cylinders: sectors,
            heads: 1,
            sectors_per_track: 1,
        }),
        unique_id: [unique; 16],
        ..Default::default()
    }
}

/// Pattern written by a `Write` op: each sector tagged with its index and the op's fill byte.
fn sector_pattern(sector: u64, fill: u8) -> [u8; SECTOR_SIZE] {
    let mut data = [fill; SECTOR_SIZE];
    data[..8].copy_from_slice(&sector.to_le_bytes());
    data
}

fn run_ops<Read, Write, Reopen>(
    model: &mut [Option<u8>],
    ops: &[Op],
    mut read: Read,
    mut write: Write,
    mut flush_and_reopen: Reopen,
) -> TestCaseResult
where
    Read: FnMut(u64, u64, &mut [u8]) -> u64,
    Write: FnMut(u64, u64, &[u8]) -> u64,
    Reopen: FnMut(bool),
{
    let total = model.len() as u64;
    let zero = [0u8; SECTOR_SIZE];

    for op in ops {
        match *op {
            Op::Write {
                offset,
                count,
                fill,
            } => {
                let mut buf = Vec::with_capacity(count as usize * SECTOR_SIZE);
                for sector in offset..offset + count {
                    buf.extend_from_slice(&sector_pattern(sector, fill));
                }
                let truncated = write(offset, count, &buf[..]);
                let span = check_sectors(offset, count, total);
                prop_assert_eq!(truncated, span.truncated);
                for sector in offset..offset + span.transfer {
                    model[sector as usize] = Some(fill);
                }
            }
            Op::Read { offset, count } => {
                let mut buf = vec![0xA5u8; count as usize * SECTOR_SIZE];
                let truncated = read(offset, count, &mut buf[..]);
                let span = check_sectors(offset, count, total);
                prop_assert_eq!(truncated, span.truncated);

                for (i, chunk) in buf.chunks(SECTOR_SIZE).enumerate() {
                    let sector = offset + i as u64;
                    if (i as u64) < span.transfer {
                        let expected = model[sector as usize]
                            .map(|fill| sector_pattern(sector, fill))
                            .unwrap_or(zero);
                        prop_assert_eq!(chunk, &expected[..]);
                    } else {
                        // Slots past the transfer are left untouched.
                        prop_assert!(chunk.iter().all(|b| *b == 0xA5));
                    }
                }
            }
            Op::Flush => flush_and_reopen(false),
            Op::Reopen => flush_and_reopen(true),
        }
    }

    flush_and_reopen(true);
    let mut all = vec![0u8; model.len() * SECTOR_SIZE];
    prop_assert_eq!(read(0, total, &mut all[..]), 0);
    for (sector, chunk) in all.chunks(SECTOR_SIZE).enumerate() {
        let expected = model[sector]
            .map(|fill| sector_pattern(sector as u64, fill))
            .unwrap_or(zero);
        prop_assert_eq!(chunk, &expected[..]);
    }
    Ok(())
}

fn reopen(image: &mut Option<VhdImage<MemBackend>>, really: bool) {
    let mut current = image.take().unwrap();
    current.flush().unwrap();
    *image = Some(if really {
        VhdImage::open(current.into_backend(), OpenOptions::default()).unwrap()
    } else {
        current
    });
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_check_sectors_partitions_request(offset in any::<u64>(), count in any::<u64>(), total in any::<u64>()) {
        let span = check_sectors(offset, count, total);
        prop_assert_eq!(span.transfer + span.truncated, count);
        prop_assert!(span.transfer <= total.saturating_sub(offset));
        if offset >= total {
            prop_assert_eq!(span.transfer, 0);
        }
    }

    #[test]
    fn prop_fixed_image_matches_reference((sectors, _block_size, ops) in scenario_strategy()) {
        let image = VhdImage::create_fixed(MemBackend::new(), options(sectors, 4096, 1)).unwrap();
        let mut model = vec![None; sectors as usize];
        let cell = std::cell::RefCell::new(Some(image));

        run_ops(
            &mut model,
            &ops,
            |offset, count, buf| cell.borrow_mut().as_mut().unwrap().read_sectors(offset, count, buf).unwrap(),
            |offset, count, buf| cell.borrow_mut().as_mut().unwrap().write_sectors(offset, count, buf).unwrap(),
            |really| reopen(&mut cell.borrow_mut(), really),
        )?;
    }

    #[test]
    fn prop_dynamic_image_matches_reference((sectors, block_size, ops) in scenario_strategy()) {
        let image = VhdImage::create_dynamic(MemBackend::new(), options(sectors, block_size, 1)).unwrap();
        let mut model = vec![None; sectors as usize];
        let cell = std::cell::RefCell::new(Some(image));

        run_ops(
            &mut model,
            &ops,
            |offset, count, buf| cell.borrow_mut().as_mut().unwrap().read_sectors(offset, count, buf).unwrap(),
            |offset, count, buf| cell.borrow_mut().as_mut().unwrap().write_sectors(offset, count, buf).unwrap(),
            |really| reopen(&mut cell.borrow_mut(), really),
        )?;
    }

    #[test]
    fn prop_differencing_child_overlays_parent(
        (sectors, block_size, ops) in scenario_strategy(),
        base_fill in any::<u8>(),
    ) {
        // Parent holds a known pattern in every sector; the child starts empty.
        let mut base = VhdImage::create_dynamic(MemBackend::new(), options(sectors, block_size, 1)).unwrap();
        let mut pattern = Vec::with_capacity(sectors as usize * SECTOR_SIZE);
        for sector in 0..sectors as u64 {
            pattern.extend_from_slice(&sector_pattern(sector, base_fill));
        }
        base.write_sectors(0, sectors as u64, &pattern).unwrap();

        let mut set = ImageSet::new();
        let base_id = set.insert(base).unwrap();
        let child = VhdImage::create_differencing(
            MemBackend::new(),
            set.get(base_id).unwrap(),
            options(sectors, block_size, 2),
        )
        .unwrap();
        let child_id = set.insert_differencing(child, base_id).unwrap();

        let mut model = vec![Some(base_fill); sectors as usize];
        let cell = std::cell::RefCell::new(set);

        run_ops(
            &mut model,
            &ops,
            |offset, count, buf| cell.borrow_mut().read_sectors(child_id, offset, count, buf).unwrap(),
            |offset, count, buf| cell.borrow_mut().write_sectors(child_id, offset, count, buf).unwrap(),
            |_| cell.borrow_mut().flush().unwrap(),
        )?;

        // The parent never sees the child's writes.
        let mut parent = vec![0u8; sectors as usize * SECTOR_SIZE];
        cell.borrow_mut().read_sectors(base_id, 0, sectors as u64, &mut parent).unwrap();
        prop_assert_eq!(parent, pattern);
    }
}
