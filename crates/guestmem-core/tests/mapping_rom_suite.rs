//! Mapping facade integration: ROM shadowing, mapping idempotence, the
//! RAM cut, file-backed RAM, and save-state restore across a workload.

use std::cell::RefCell;
use std::rc::Rc;

use guestmem_core::{
    MemTraceEvent, Memory, MemoryConfig, PageHandler, RecordingTraceSink, SnapshotVersion,
};
use proptest as _;
use rstest as _;
use thiserror as _;

fn kb640() -> Memory {
    Memory::new(MemoryConfig {
        memsize_mib: 0,
        memsize_kb: 640,
        ..MemoryConfig::default()
    })
    .expect("memory init")
}

#[test]
fn rom_shadow_keeps_the_image_and_reports_the_write() {
    let mut mem = kb640();

    // Load a ROM image byte, then lock the range.
    mem.phys_writeb(0xF0000, 0xEA);
    mem.map_rom_physmem(0xF0000, 0xFFFFF).expect("map rom");

    mem.mem_writeb(0xF0000, 0x55);
    assert_eq!(mem.mem_readb(0xF0000), 0xEA);
    assert_eq!(mem.diag().denied_rom_writes, 1);
}

#[test]
fn map_unmap_map_is_observationally_idempotent() {
    let mut mem = kb640();
    mem.mem_writeb(0x50123, 0x42);

    mem.map_ram_physmem(0x50000, 0x5FFFF).expect("map");
    let first = mem.mem_readb(0x50123);

    mem.unmap_physmem(0x50000, 0x5FFFF).expect("unmap");
    assert_eq!(mem.mem_readb(0x50123), 0xFF);

    mem.map_ram_physmem(0x50000, 0x5FFFF).expect("remap");
    assert_eq!(mem.mem_readb(0x50123), first);
    assert_eq!(first, 0x42);
}

#[test]
fn cut_ram_makes_room_for_a_top_rom() {
    let mut mem = Memory::new(MemoryConfig {
        memsize_mib: 16,
        ..MemoryConfig::default()
    })
    .expect("memory init");
    let sink = Rc::new(RefCell::new(RecordingTraceSink::default()));
    mem.set_trace_sink(Box::new(Rc::clone(&sink)));

    mem.cut_ram_up_to(0x00FE_0000);
    assert_eq!(mem.reported_pages(), 0xFE0);
    assert!(sink
        .borrow()
        .events
        .iter()
        .any(|e| matches!(e, MemTraceEvent::RamCut { reported_pages: 0xFE0 })));
    // The vacated top re-arbitrates and can be claimed as ROM now.
    mem.map_rom_physmem(0x00FE_0000, 0x00FF_FFFF).expect("rom");
    assert_eq!(mem.get_handler(0xFF0), PageHandler::Rom);
}

#[test]
fn file_backed_ram_persists_writes_into_the_image() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("guest-ram.img");

    let mut mem = Memory::new(MemoryConfig {
        memsize_mib: 2,
        memory_file: Some(path.clone()),
        ..MemoryConfig::default()
    })
    .expect("memory init");

    mem.mem_writed(0x12340, 0x4D45_4D21);
    drop(mem);

    let image = std::fs::read(&path).expect("image");
    assert_eq!(&image[0x12340..0x12344], &0x4D45_4D21u32.to_le_bytes());
}

#[test]
fn missing_memory_file_directory_falls_back_to_anonymous_ram() {
    let mem = Memory::new(MemoryConfig {
        memsize_mib: 2,
        memory_file: Some("/nonexistent-dir/guest-ram.img".into()),
        ..MemoryConfig::default()
    })
    .expect("memory init");
    assert_eq!(mem.reported_pages(), 0x200);
    assert_eq!(mem.reported_pages_4gb(), 0);
}

#[test]
fn snapshot_restore_recovers_a_full_machine_workload() {
    let mut mem = Memory::new(MemoryConfig {
        memsize_mib: 4,
        ..MemoryConfig::default()
    })
    .expect("memory init");

    mem.map_rom_physmem(0xF0000, 0xFFFFF).expect("rom");
    let chain = mem.allocate_pages(16, true);
    mem.block_write(0x30000, b"resident driver image");
    mem.set_a20(true);
    let snapshot = mem.snapshot(SnapshotVersion::V1, true);

    // Trash everything the snapshot should recover.
    mem.release_pages(chain);
    mem.unmap_physmem(0xF0000, 0xFFFFF).expect("unmap");
    mem.block_write(0x30000, &[0u8; 21]);
    mem.set_a20(false);

    mem.restore(&snapshot).expect("restore");
    assert_eq!(mem.allocated_pages(chain), 16);
    assert_eq!(mem.get_handler(0xF8), PageHandler::Rom);
    assert!(mem.a20_enabled());
    let mut readback = vec![0u8; 21];
    mem.block_read(0x30000, &mut readback);
    assert_eq!(&readback, b"resident driver image");
}
