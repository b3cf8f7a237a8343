use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use iommu_pgtable::config::{SZ_2M, SZ_4K, SZ_16K};
use iommu_pgtable::{
    ConfigError, DartFormat, DartPageTable, FlushOps, IoPgtableCfg, IotlbGather, Iova, MapError,
    PhysMapper, PhysicalAddress, Prot, RootStyle, TableAlloc,
};

const ARENA_SIZE: usize = 1 << 22;
const ARENA_ALIGN: usize = 1 << 16;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Flush {
    Walk { iova: u64, size: u64, granule: u64 },
    Page { iova: u64, size: u64 },
}

/// Simulated table memory: a bump allocator over one aligned arena, handing
/// out arena offsets as "physical" addresses so they stay inside any
/// format's output width. Tracks live pages, enforces matching frees, can
/// run out on request and records every flush.
struct SimRam {
    base: usize,
    next: Mutex<usize>,
    sizes: Mutex<HashMap<u64, usize>>,
    budget: AtomicUsize,
    flushes: Mutex<Vec<Flush>>,
}

impl SimRam {
    fn new() -> Self {
        Self::with_budget(usize::MAX)
    }

    /// Allow only `allocations` page allocations before reporting
    /// out-of-memory.
    fn with_budget(allocations: usize) -> Self {
        let base = unsafe { alloc_zeroed(Self::layout()) };
        assert!(!base.is_null());
        Self {
            base: base as usize,
            // keep offset zero unused so no table ever sits at "phys 0"
            next: Mutex::new(ARENA_ALIGN),
            sizes: Mutex::new(HashMap::new()),
            budget: AtomicUsize::new(allocations),
            flushes: Mutex::new(Vec::new()),
        }
    }

    fn layout() -> Layout {
        Layout::from_size_align(ARENA_SIZE, ARENA_ALIGN).unwrap()
    }

    fn refill(&self, allocations: usize) {
        self.budget.store(allocations, Ordering::Relaxed);
    }

    fn live_pages(&self) -> usize {
        self.sizes.lock().unwrap().len()
    }

    fn recorded_flushes(&self) -> Vec<Flush> {
        self.flushes.lock().unwrap().clone()
    }

    fn page_flush_count(&self) -> usize {
        self.recorded_flushes()
            .iter()
            .filter(|f| matches!(f, Flush::Page { .. }))
            .count()
    }

    fn walk_flush_count(&self) -> usize {
        self.recorded_flushes()
            .iter()
            .filter(|f| matches!(f, Flush::Walk { .. }))
            .count()
    }
}

impl Drop for SimRam {
    fn drop(&mut self) {
        unsafe { dealloc(self.base as *mut u8, Self::layout()) };
    }
}

impl TableAlloc for SimRam {
    fn alloc_pages(&self, size: usize) -> Option<PhysicalAddress> {
        assert!(size.is_power_of_two());
        let allowed = self.budget.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| {
            if left == usize::MAX {
                Some(usize::MAX)
            } else {
                left.checked_sub(1)
            }
        });
        if allowed.is_err() {
            return None;
        }

        let mut next = self.next.lock().unwrap();
        let offset = next.next_multiple_of(size);
        assert!(offset + size <= ARENA_SIZE, "arena exhausted");
        *next = offset + size;

        self.sizes.lock().unwrap().insert(offset as u64, size);
        Some(PhysicalAddress::new(offset as u64))
    }

    fn free_pages(&self, addr: PhysicalAddress, size: usize) {
        let tracked = self.sizes.lock().unwrap().remove(&addr.as_u64());
        assert_eq!(tracked, Some(size), "bad free of {addr:?}");
        // poison so any stale reference shows up as garbage entries
        unsafe {
            std::ptr::write_bytes((self.base + addr.as_u64() as usize) as *mut u8, 0xA5, size);
        }
    }
}

impl PhysMapper for SimRam {
    unsafe fn phys_to_ptr(&self, addr: PhysicalAddress) -> NonNull<u8> {
        let offset = addr.as_u64() as usize;
        assert!(offset < ARENA_SIZE, "walked to a bogus table {addr:?}");
        unsafe { NonNull::new_unchecked((self.base + offset) as *mut u8) }
    }
}

impl FlushOps for SimRam {
    fn flush_walk(&self, iova: Iova, size: u64, granule: u64) {
        self.flushes.lock().unwrap().push(Flush::Walk {
            iova: iova.as_u64(),
            size,
            granule,
        });
    }

    fn flush_page(&self, iova: Iova, size: u64) {
        self.flushes.lock().unwrap().push(Flush::Page {
            iova: iova.as_u64(),
            size,
        });
    }
}

fn v1_single(pgsize_bitmap: u64, ias: u32) -> IoPgtableCfg {
    IoPgtableCfg {
        pgsize_bitmap,
        ias,
        // wider than v1 can reach; capped to 36 bits during derivation
        oas: 48,
        coherent_walk: true,
        format: DartFormat::V1,
        root_style: RootStyle::Single,
    }
}

fn v1_concatenated() -> IoPgtableCfg {
    IoPgtableCfg {
        pgsize_bitmap: SZ_4K,
        ias: 32,
        oas: 36,
        coherent_walk: true,
        format: DartFormat::V1,
        root_style: RootStyle::Concatenated,
    }
}

fn v2_concatenated() -> IoPgtableCfg {
    IoPgtableCfg {
        pgsize_bitmap: SZ_16K,
        ias: 36,
        oas: 42,
        coherent_walk: true,
        format: DartFormat::V2,
        root_style: RootStyle::Concatenated,
    }
}

const RW: Prot = Prot::READ.union(Prot::WRITE);

#[test]
fn maps_translates_and_unmaps_a_single_page() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_single(SZ_4K, 39), &env).expect("valid table");

    assert_eq!(
        table.map_pages(Iova::new(0x1000), PhysicalAddress::new(0x2000), SZ_4K, 1, RW),
        Ok(1)
    );
    assert_eq!(
        table.iova_to_phys(Iova::new(0x1000)),
        Some(PhysicalAddress::new(0x2000))
    );
    assert_eq!(table.iova_to_phys(Iova::new(0x3000)), None);

    assert_eq!(table.unmap_pages(Iova::new(0x1000), SZ_4K, 1, None), 1);
    assert_eq!(table.iova_to_phys(Iova::new(0x1000)), None);

    table.free();
    assert_eq!(env.live_pages(), 0);
}

#[test]
fn translation_keeps_the_page_offset() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_single(SZ_4K, 39), &env).expect("valid table");

    table
        .map_pages(Iova::new(0x40_0000), PhysicalAddress::new(0xABC000), SZ_4K, 1, RW)
        .expect("map");
    assert_eq!(
        table.iova_to_phys(Iova::new(0x40_0123)),
        Some(PhysicalAddress::new(0xABC123))
    );
}

#[test]
fn unusable_configurations_allocate_nothing() {
    let env = SimRam::new();

    // 48-bit input with a 4 KiB granule would need a fourth level.
    assert_eq!(
        DartPageTable::new(&v1_single(SZ_4K, 48), &env).unwrap_err(),
        ConfigError::TooManyLevels
    );

    let mut cfg = v1_single(SZ_4K, 39);
    cfg.coherent_walk = false;
    assert_eq!(
        DartPageTable::new(&cfg, &env).unwrap_err(),
        ConfigError::NonCoherentWalk
    );

    assert_eq!(env.live_pages(), 0);
}

#[test]
fn mapping_beyond_the_widths_is_rejected() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_single(SZ_4K, 39), &env).expect("valid table");

    assert_eq!(
        table.map_pages(Iova::new(1 << 39), PhysicalAddress::new(0x2000), SZ_4K, 1, RW),
        Err(MapError::OutOfRange)
    );
    // the requested 48-bit output width was capped to the v1 reach
    assert_eq!(table.oas(), 36);
    assert_eq!(
        table.map_pages(Iova::new(0x1000), PhysicalAddress::new(1 << 36), SZ_4K, 1, RW),
        Err(MapError::OutOfRange)
    );
    assert_eq!(
        table.map_pages(Iova::new(0x1000), PhysicalAddress::new(0x2000), 0x2000, 1, RW),
        Err(MapError::InvalidBlockSize)
    );

    // nothing was written, not even intermediate tables
    assert_eq!(env.live_pages(), 1);
}

#[test]
fn remapping_a_live_page_is_rejected() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_single(SZ_4K, 39), &env).expect("valid table");

    table
        .map_pages(Iova::new(0x1000), PhysicalAddress::new(0x2000), SZ_4K, 1, RW)
        .expect("map");
    assert_eq!(
        table.map_pages(Iova::new(0x1000), PhysicalAddress::new(0x9000), SZ_4K, 1, RW),
        Err(MapError::AlreadyMapped)
    );

    // the original translation is untouched
    assert_eq!(
        table.iova_to_phys(Iova::new(0x1000)),
        Some(PhysicalAddress::new(0x2000))
    );
}

#[test]
fn inaccessible_mappings_write_nothing() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_single(SZ_4K, 39), &env).expect("valid table");

    assert_eq!(
        table.map_pages(Iova::new(0x1000), PhysicalAddress::new(0x2000), SZ_4K, 1, Prot::empty()),
        Ok(0)
    );
    assert_eq!(
        table.map_pages(Iova::new(0x1000), PhysicalAddress::new(0x2000), SZ_4K, 1, Prot::CACHE),
        Ok(0)
    );
    assert_eq!(table.iova_to_phys(Iova::new(0x1000)), None);
    assert_eq!(env.live_pages(), 1);
}

#[test]
fn map_runs_stop_at_the_end_of_a_table() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_single(SZ_4K, 39), &env).expect("valid table");

    // index 510 of a 512-entry bottom table: room for two of the four
    let iova = Iova::new(510 * SZ_4K);
    let paddr = PhysicalAddress::new(0x10_0000);
    assert_eq!(table.map_pages(iova, paddr, SZ_4K, 4, RW), Ok(2));

    // the caller carries on from where the run stopped
    assert_eq!(
        table.map_pages(iova + 2 * SZ_4K, paddr + 2 * SZ_4K, SZ_4K, 2, RW),
        Ok(2)
    );

    for i in 0..4 {
        assert_eq!(
            table.iova_to_phys(iova + i * SZ_4K),
            Some(paddr + i * SZ_4K)
        );
    }
}

#[test]
fn unmap_runs_stop_at_the_table_boundary() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_single(SZ_4K, 39), &env).expect("valid table");

    let iova = Iova::new(510 * SZ_4K);
    let paddr = PhysicalAddress::new(0x10_0000);
    table.map_pages(iova, paddr, SZ_4K, 2, RW).expect("map");
    table
        .map_pages(iova + 2 * SZ_4K, paddr + 2 * SZ_4K, SZ_4K, 2, RW)
        .expect("map");

    assert_eq!(table.unmap_pages(iova, SZ_4K, 4, None), 2);
    assert_eq!(table.iova_to_phys(iova), None);
    assert_eq!(
        table.iova_to_phys(iova + 2 * SZ_4K),
        Some(paddr + 2 * SZ_4K)
    );

    assert_eq!(table.unmap_pages(iova + 2 * SZ_4K, SZ_4K, 2, None), 2);
}

#[test]
fn unmap_runs_stop_at_holes() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_single(SZ_4K, 39), &env).expect("valid table");

    let paddr = PhysicalAddress::new(0x10_0000);
    table
        .map_pages(Iova::new(0x1000), paddr, SZ_4K, 2, RW)
        .expect("map");
    table
        .map_pages(Iova::new(0x4000), paddr, SZ_4K, 1, RW)
        .expect("map");

    // 0x3000 was never mapped; the run stops there
    assert_eq!(table.unmap_pages(Iova::new(0x1000), SZ_4K, 4, None), 2);
    assert_eq!(table.iova_to_phys(Iova::new(0x4000)), Some(paddr));
}

#[test]
fn unmapping_nothing_is_a_no_op() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_single(SZ_4K, 39), &env).expect("valid table");

    assert_eq!(table.unmap_pages(Iova::new(0x3000), SZ_4K, 1, None), 0);
    assert!(env.recorded_flushes().is_empty());
}

#[test]
fn free_returns_every_table_page() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_single(SZ_4K, 39), &env).expect("valid table");

    // spread across three bottom tables to force several intermediates
    for i in 0..3_u64 {
        table
            .map_pages(
                Iova::new(i << 21 | 0x1000),
                PhysicalAddress::new(0x30_0000 + i * SZ_4K),
                SZ_4K,
                1,
                RW,
            )
            .expect("map");
    }
    assert_eq!(env.live_pages(), 5);

    table.free();
    assert_eq!(env.live_pages(), 0);
}

#[test]
fn concatenated_roots_sit_in_consecutive_granules() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_concatenated(), &env).expect("valid table");

    assert_eq!(table.num_ttbrs(), 4);
    let ttbrs: Vec<_> = table.ttbrs().collect();
    for pair in ttbrs.windows(2) {
        assert_eq!(pair[1].as_u64() - pair[0].as_u64(), SZ_4K);
    }

    // an address served by the fourth base register
    let iova = Iova::new(3 << 30 | 0x5000);
    let paddr = PhysicalAddress::new(0x7_0000_C000);
    assert_eq!(table.map_pages(iova, paddr, SZ_4K, 1, RW), Ok(1));
    assert_eq!(table.iova_to_phys(iova), Some(paddr));

    table.free();
    assert_eq!(env.live_pages(), 0);
}

#[test]
fn sixteen_kib_tables_reach_past_36_bits() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v2_concatenated(), &env).expect("valid table");

    assert_eq!(table.num_ttbrs(), 1);
    assert_eq!(table.granule(), SZ_16K);

    let iova = Iova::new(0x4000);
    let paddr = PhysicalAddress::new((1 << 40) | 0x10_C000);
    assert_eq!(table.map_pages(iova, paddr, SZ_16K, 2, RW), Ok(2));
    assert_eq!(table.iova_to_phys(iova), Some(paddr));
    assert_eq!(
        table.iova_to_phys(iova + SZ_16K + 0x1234),
        Some(paddr + SZ_16K + 0x1234)
    );
}

#[test]
fn mapping_a_block_over_a_populated_subtree_is_rejected() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_single(SZ_4K | SZ_2M, 39), &env).expect("valid table");

    table
        .map_pages(Iova::new(0x20_0000), PhysicalAddress::new(0x2000), SZ_4K, 1, RW)
        .expect("map");

    // the 2 MiB slot already holds the bottom table for that fine page
    assert_eq!(
        table.map_pages(Iova::new(0x20_0000), PhysicalAddress::new(0x40_0000), SZ_2M, 1, RW),
        Err(MapError::AlreadyMapped)
    );
    assert_eq!(
        table.iova_to_phys(Iova::new(0x20_0000)),
        Some(PhysicalAddress::new(0x2000))
    );
}

#[test]
fn unmapping_a_block_frees_its_subtree() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_single(SZ_4K | SZ_2M, 39), &env).expect("valid table");

    table
        .map_pages(Iova::new(0x20_0000), PhysicalAddress::new(0x10_0000), SZ_4K, 4, RW)
        .expect("map");
    assert_eq!(env.live_pages(), 3);

    assert_eq!(table.unmap_pages(Iova::new(0x20_0000), SZ_2M, 1, None), 1);

    // the bottom table is gone and stale walk state was flushed
    assert_eq!(env.live_pages(), 2);
    assert_eq!(
        env.recorded_flushes(),
        vec![Flush::Walk {
            iova: 0x20_0000,
            size: SZ_2M,
            granule: SZ_4K
        }]
    );
    assert_eq!(table.iova_to_phys(Iova::new(0x20_0000)), None);
    assert_eq!(table.iova_to_phys(Iova::new(0x20_3000)), None);

    table.free();
    assert_eq!(env.live_pages(), 0);
}

#[test]
fn gather_accumulates_and_flushes_per_page() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_single(SZ_4K, 39), &env).expect("valid table");

    table
        .map_pages(Iova::new(0x1000), PhysicalAddress::new(0x2000), SZ_4K, 3, RW)
        .expect("map");

    let mut gather = IotlbGather::new();
    assert_eq!(
        table.unmap_pages(Iova::new(0x1000), SZ_4K, 3, Some(&mut gather)),
        3
    );

    assert_eq!(env.page_flush_count(), 3);
    assert_eq!(env.walk_flush_count(), 0);
    let (start, end) = gather.range().expect("range recorded");
    assert_eq!(start.as_u64(), 0x1000);
    assert_eq!(end.as_u64(), 0x3FFF);
    assert_eq!(gather.pgsize(), SZ_4K);
}

#[test]
fn queued_gather_suppresses_page_flushes() {
    let env = SimRam::new();
    let table = DartPageTable::new(&v1_single(SZ_4K, 39), &env).expect("valid table");

    table
        .map_pages(Iova::new(0x1000), PhysicalAddress::new(0x2000), SZ_4K, 3, RW)
        .expect("map");

    let mut gather = IotlbGather::new();
    gather.set_queued(true);
    assert_eq!(
        table.unmap_pages(Iova::new(0x1000), SZ_4K, 3, Some(&mut gather)),
        3
    );

    assert_eq!(env.page_flush_count(), 0);
    assert!(gather.range().is_some());
}

#[test]
fn racing_maps_share_one_intermediate_table() {
    for _ in 0..32 {
        let env = SimRam::new();
        let table = DartPageTable::new(&v1_single(SZ_4K, 39), &env).expect("valid table");

        // both addresses live under the same (initially absent) subtree
        thread::scope(|s| {
            let a = s.spawn(|| {
                table.map_pages(Iova::new(0x1000), PhysicalAddress::new(0xA000), SZ_4K, 1, RW)
            });
            let b = s.spawn(|| {
                table.map_pages(Iova::new(0x2000), PhysicalAddress::new(0xB000), SZ_4K, 1, RW)
            });
            assert_eq!(a.join().unwrap(), Ok(1));
            assert_eq!(b.join().unwrap(), Ok(1));
        });

        assert_eq!(
            table.iova_to_phys(Iova::new(0x1000)),
            Some(PhysicalAddress::new(0xA000))
        );
        assert_eq!(
            table.iova_to_phys(Iova::new(0x2000)),
            Some(PhysicalAddress::new(0xB000))
        );

        // the loser of each install race gave its table back
        assert_eq!(env.live_pages(), 3);

        table.free();
        assert_eq!(env.live_pages(), 0);
    }
}

#[test]
fn allocation_failure_leaves_the_tree_usable() {
    // budget covers the root and one intermediate; the bottom table fails
    let env = SimRam::with_budget(2);
    let table = DartPageTable::new(&v1_single(SZ_4K, 39), &env).expect("valid table");

    assert_eq!(
        table.map_pages(Iova::new(0x1000), PhysicalAddress::new(0x2000), SZ_4K, 1, RW),
        Err(MapError::OutOfMemory)
    );
    assert_eq!(env.live_pages(), 2);

    // once memory is back the same range maps fine, reusing the
    // intermediate that was already installed
    env.refill(usize::MAX);
    assert_eq!(
        table.map_pages(Iova::new(0x1000), PhysicalAddress::new(0x2000), SZ_4K, 1, RW),
        Ok(1)
    );
    assert_eq!(
        table.iova_to_phys(Iova::new(0x1000)),
        Some(PhysicalAddress::new(0x2000))
    );
    assert_eq!(env.live_pages(), 3);

    table.free();
    assert_eq!(env.live_pages(), 0);
}
