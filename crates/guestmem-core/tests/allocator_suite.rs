//! EMS/XMS allocator integration coverage: best fit, chains across holes,
//! A20-friendly placement, and the accounting identity.

use guestmem_core::{Memory, MemoryConfig, XMS_START};
use proptest::prelude::*;
use rstest::rstest;
use tempfile as _;
use thiserror as _;

fn allocator(mib: u32) -> Memory {
    Memory::new(MemoryConfig {
        memsize_mib: mib,
        ..MemoryConfig::default()
    })
    .expect("memory init")
}

fn chain_pages(mem: &Memory, handle: i32) -> Vec<u32> {
    let mut pages = Vec::new();
    let mut h = handle;
    while h > 0 {
        pages.push(h as u32);
        h = mem.next_handle(h);
    }
    pages
}

#[test]
fn sequential_alloc_release_realloc_follows_best_fit() {
    let mut mem = allocator(4);

    let h1 = mem.allocate_pages(4, true);
    let first = XMS_START;
    assert_eq!(h1 as u32, first);
    assert_eq!(
        chain_pages(&mem, h1),
        vec![first, first + 1, first + 2, first + 3]
    );

    let h2 = mem.allocate_pages(2, true);
    assert_eq!(h2 as u32, first + 4);

    mem.release_pages(h1);
    let h3 = mem.allocate_pages(3, true);
    assert_eq!(h3 as u32, first, "freed 4-run is the smallest fit for 3");

    // The remaining free space is the tail run.
    assert_eq!(mem.free_largest(), mem.reported_pages() - (first + 6));
}

#[test]
fn chain_walkers_report_length_and_positions() {
    let mut mem = allocator(4);
    let h = mem.allocate_pages(5, true);
    assert_eq!(mem.allocated_pages(h), 5);
    assert_eq!(mem.next_handle_at(h, 0), h);
    assert_eq!(mem.next_handle_at(h, 4), h + 4);
    assert_eq!(mem.next_handle(h + 4), -1);
    assert_eq!(mem.next_free_page(), h + 5);
}

#[rstest]
#[case(true)]
#[case(false)]
fn release_after_allocate_restores_free_total(#[case] sequence: bool) {
    let mut mem = allocator(4);
    let before = mem.free_total();
    let handle = mem.allocate_pages(24, sequence);
    assert!(handle > 0);
    assert_eq!(mem.free_total(), before - 24);
    mem.release_pages(handle);
    assert_eq!(mem.free_total(), before);
}

#[test]
fn a20_friendly_chain_avoids_odd_megabytes_end_to_end() {
    let mut mem = allocator(3);
    let handle = mem.allocate_pages_a20_friendly(0x80, true);
    assert!(handle > 0);

    let pages = chain_pages(&mem, handle);
    assert_eq!(pages.len(), 0x80);
    assert!(pages.iter().all(|p| p & 0x100 == 0));
    // With XMS_START inside an odd megabyte, placement lands at 2 MiB.
    assert!(pages.iter().all(|p| (0x200..0x300).contains(p)));

    assert_eq!(mem.allocate_pages_a20_friendly(0x101, true), 0);
}

#[test]
fn grown_chain_keeps_its_content_when_moved() {
    let mut mem = allocator(4);
    let mut handle = mem.allocate_pages(2, true);
    let _blocker = mem.allocate_pages(1, true);

    mem.block_write((handle as u32) << 12, b"persist me across the move");
    assert!(mem.reallocate_pages(&mut handle, 8, true));

    let mut readback = vec![0u8; 26];
    mem.block_read((handle as u32) << 12, &mut readback);
    assert_eq!(&readback, b"persist me across the move");
}

proptest! {
    #[test]
    fn accounting_identity_survives_random_workloads(
        ops in prop::collection::vec((1u32..24, any::<bool>(), any::<bool>()), 1..24)
    ) {
        let mut mem = allocator(4);
        let total = mem.free_total();
        let mut live: Vec<i32> = Vec::new();

        for (pages, sequence, release_oldest) in ops {
            let handle = mem.allocate_pages(pages, sequence);
            if handle > 0 {
                live.push(handle);
            }
            if release_oldest && !live.is_empty() {
                let handle = live.remove(0);
                mem.release_pages(handle);
            }
        }

        let allocated: u32 = live.iter().map(|&h| mem.allocated_pages(h)).sum();
        prop_assert_eq!(allocated + mem.free_total(), total);

        for handle in live.drain(..) {
            mem.release_pages(handle);
        }
        prop_assert_eq!(mem.free_total(), total);
    }

    #[test]
    fn chains_are_acyclic_and_nul_terminated(
        sizes in prop::collection::vec(1u32..32, 1..12)
    ) {
        let mut mem = allocator(4);
        let mut handles = Vec::new();
        for (i, pages) in sizes.iter().enumerate() {
            let handle = mem.allocate_pages(*pages, i % 2 == 0);
            if handle > 0 {
                handles.push((handle, *pages));
            }
        }

        for (handle, pages) in handles {
            let chain = chain_pages(&mem, handle);
            prop_assert_eq!(chain.len() as u32, pages);
            let mut sorted = chain.clone();
            sorted.sort_unstable();
            sorted.dedup();
            prop_assert_eq!(sorted.len(), chain.len(), "chain revisited a page");
            prop_assert_eq!(mem.next_handle(*chain.last().expect("nonempty") as i32), -1);
        }
    }
}
