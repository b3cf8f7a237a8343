//! The page-table tree itself: construction, mutation, translation and
//! teardown.
//!
//! The walk is at most three levels deep. Which levels exist, how wide the
//! root is and how many base registers it spans all come from
//! [`Geometry`]; this module only moves entries around.

pub mod entry;
pub mod geometry;

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering, fence};

use iommu_addresses::{Iova, PhysicalAddress};
use log::{debug, warn};

use crate::config::{DartFormat, IoPgtableCfg};
use crate::iotlb::{FlushOps, IotlbGather};
use crate::{PhysMapper, Prot, TableAlloc};

use self::entry::EntryKind;
use self::geometry::{ConfigError, Geometry};

/// Fixed depth of the hardware walk; narrower address spaces elide top
/// levels by starting further down.
pub const MAX_LEVELS: usize = 3;

/// Why a batch of pages could not be mapped.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// The block size is not one of the configured page sizes, or no table
    /// level maps blocks of that size.
    #[error("block size is not in the configured page-size bitmap")]
    InvalidBlockSize,
    /// The device or physical address exceeds a configured width. Nothing
    /// was written.
    #[error("address out of range for the configured widths")]
    OutOfRange,
    /// A targeted entry is already live. Mappings are never replaced
    /// implicitly; unmap first.
    #[error("range overlaps a live mapping")]
    AlreadyMapped,
    /// A table allocation failed. Entries written by earlier calls (and
    /// intermediate tables installed by this one) remain in place.
    #[error("out of memory")]
    OutOfMemory,
}

/// Constant state of one map walk; only the level and table change while
/// descending.
struct MapRun {
    iova: u64,
    paddr: u64,
    block: u64,
    count: usize,
    prot_bits: u64,
}

/// Constant state of one unmap walk.
struct UnmapRun {
    iova: u64,
    block: u64,
    count: usize,
}

/// One device address space's page-table tree.
///
/// The tree lives in pages from the environment's [`TableAlloc`]; entries
/// are published with the ordering a concurrently walking device needs.
/// Callers serialize map and unmap calls touching the same range; disjoint
/// ranges may be mapped from several threads at once.
///
/// Dropping the handle leaks the table pages. Call [`free`](Self::free) to
/// give them back.
pub struct DartPageTable<'e, E> {
    format: DartFormat,
    geom: Geometry,
    root: PhysicalAddress,
    env: &'e E,
}

impl<E> fmt::Debug for DartPageTable<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DartPageTable")
            .field("format", &self.format)
            .field("geom", &self.geom)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl<E> DartPageTable<'_, E> {
    /// The entry format this table was built for.
    #[must_use]
    pub const fn format(&self) -> DartFormat {
        self.format
    }

    /// Page sizes accepted by [`map_pages`](Self::map_pages), after
    /// restriction to the granule's translation regime.
    #[must_use]
    pub const fn pgsize_bitmap(&self) -> u64 {
        self.geom.pgsize_bitmap()
    }

    /// Input (device) address width in bits.
    #[must_use]
    pub const fn ias(&self) -> u32 {
        self.geom.ias()
    }

    /// Output (physical) address width in bits.
    #[must_use]
    pub const fn oas(&self) -> u32 {
        self.geom.oas()
    }

    /// Translation granule in bytes.
    #[must_use]
    pub const fn granule(&self) -> u64 {
        self.geom.granule()
    }

    /// Number of table-base registers the root spans.
    #[must_use]
    pub const fn num_ttbrs(&self) -> usize {
        self.geom.n_ttbrs()
    }

    /// Base addresses to program into the hardware's table-base registers,
    /// in ascending register order.
    ///
    /// Consecutive granule-sized slices of the one contiguous root block;
    /// a [`RootStyle::Single`](crate::RootStyle::Single) table yields
    /// exactly one.
    pub fn ttbrs(&self) -> impl Iterator<Item = PhysicalAddress> + '_ {
        let root = self.root;
        let granule = self.geom.granule();
        (0..self.geom.n_ttbrs()).map(move |i| root + i as u64 * granule)
    }
}

impl<'e, E> DartPageTable<'e, E>
where
    E: TableAlloc + PhysMapper + FlushOps,
{
    /// Build an empty table for `cfg`, allocating the root block from
    /// `env`.
    pub fn new(cfg: &IoPgtableCfg, env: &'e E) -> Result<Self, ConfigError> {
        if !cfg.coherent_walk {
            return Err(ConfigError::NonCoherentWalk);
        }

        let geom = Geometry::new(cfg)?;
        let root = env
            .alloc_pages(geom.root_size() as usize)
            .ok_or(ConfigError::OutOfMemory)?;

        debug!("new {:?} table at {root:?}: {geom:?}", cfg.format);

        Ok(Self {
            format: cfg.format,
            geom,
            root,
            env,
        })
    }

    /// Tear the whole tree down and return every table page, including the
    /// root block, to the allocator.
    ///
    /// The caller has already detached the hardware from the roots; leaf
    /// entries still present are simply dropped.
    pub fn free(self) {
        self.free_subtree(self.geom.start_level(), self.root);
        debug!("freed {:?} table rooted at {:?}", self.format, self.root);
    }

    /// Map `count` consecutive blocks of `block` bytes, `iova → paddr`,
    /// with access `prot`.
    ///
    /// Both addresses must be `block`-aligned and `block` must be a single
    /// size from [`pgsize_bitmap`](Self::pgsize_bitmap). Returns the number
    /// of blocks actually written, which is less than `count` when the run
    /// reaches the end of its table; call again with advanced addresses to
    /// continue. Requesting neither [`Prot::READ`] nor [`Prot::WRITE`] maps
    /// nothing and returns `Ok(0)`.
    pub fn map_pages(
        &self,
        iova: Iova,
        paddr: PhysicalAddress,
        block: u64,
        count: usize,
        prot: Prot,
    ) -> Result<usize, MapError> {
        if block == 0 || (block & self.geom.pgsize_bitmap()) != block {
            warn!("map of unsupported block size {block:#x}");
            return Err(MapError::InvalidBlockSize);
        }
        if iova.as_u64() >> self.geom.ias() != 0 || paddr.as_u64() >> self.geom.oas() != 0 {
            warn!("map outside the configured widths: {iova:?} -> {paddr:?}");
            return Err(MapError::OutOfRange);
        }

        // An inaccessible mapping is not represented; nothing to do.
        if !prot.intersects(Prot::READ | Prot::WRITE) {
            return Ok(0);
        }

        let run = MapRun {
            iova: iova.as_u64(),
            paddr: paddr.as_u64(),
            block,
            count,
            prot_bits: self.format.prot_bits(prot),
        };
        let result = self.map_level(&run, self.geom.start_level(), self.root);

        // Settle all entry writes before the caller can point a device
        // walk at the new range.
        fence(Ordering::Release);

        result
    }

    /// Remove `count` consecutive blocks of `block` bytes starting at
    /// `iova`.
    ///
    /// Returns the number of blocks removed; the run stops early at the end
    /// of its table or at an entry that is not mapped. Removing a table
    /// entry frees its whole subtree and requests a walk-cache flush; leaf
    /// removals request per-page flushes unless `gather` is queued, and
    /// accumulate into `gather` when one is given.
    pub fn unmap_pages(
        &self,
        iova: Iova,
        block: u64,
        count: usize,
        gather: Option<&mut IotlbGather>,
    ) -> usize {
        if block == 0 || (block & self.geom.pgsize_bitmap()) != block || count == 0 {
            warn!("unmap of unsupported block size {block:#x}");
            return 0;
        }
        if iova.as_u64() >> self.geom.ias() != 0 {
            warn!("unmap outside the input width: {iova:?}");
            return 0;
        }

        let run = UnmapRun {
            iova: iova.as_u64(),
            block,
            count,
        };
        self.unmap_level(&run, gather, self.geom.start_level(), self.root)
    }

    /// Walk the tree in software and resolve `iova` to the physical
    /// address it maps to, or `None` if nothing is mapped there.
    pub fn iova_to_phys(&self, iova: Iova) -> Option<PhysicalAddress> {
        let mut level = self.geom.start_level();
        let mut table = self.root;

        loop {
            let slots = self.table_at(table, level);
            let pte = slots[self.geom.level_index(iova.as_u64(), level)].load(Ordering::Acquire);

            match EntryKind::of(pte, level) {
                EntryKind::Empty => return None,
                EntryKind::Leaf => {
                    let offset = iova.offset_in(self.geom.block_size(level));
                    return Some(PhysicalAddress::new(self.format.decode_paddr(pte) | offset));
                }
                EntryKind::Table => {
                    if level >= MAX_LEVELS - 1 {
                        // Non-empty but not valid: nothing below the
                        // deepest level to descend into.
                        warn!("corrupt entry {pte:#x} at the deepest level");
                        return None;
                    }
                    table = PhysicalAddress::new(self.format.decode_paddr(pte));
                    level += 1;
                }
            }
        }
    }

    /// View a table page as its slot array. Only the root is wider than a
    /// granule.
    fn table_at(&self, table: PhysicalAddress, level: usize) -> &[AtomicU64] {
        let len = self.geom.ptes_per_table(level);
        // SAFETY: `table` designates a live table page from the companion
        // allocator, naturally aligned and `len` entries long; slots are
        // only ever accessed atomically.
        unsafe {
            let ptr = self.env.phys_to_ptr(table).cast::<AtomicU64>();
            core::slice::from_raw_parts(ptr.as_ptr(), len)
        }
    }

    fn map_level(
        &self,
        run: &MapRun,
        level: usize,
        table: PhysicalAddress,
    ) -> Result<usize, MapError> {
        let idx = self.geom.level_index(run.iova, level);

        // Blocks of this level's size are written right here.
        if run.block == self.geom.block_size(level) {
            let slots = self.table_at(table, level);
            let n = run.count.min(self.geom.ptes_per_table(level) - idx);

            for slot in &slots[idx..idx + n] {
                if EntryKind::of(slot.load(Ordering::Relaxed), level) != EntryKind::Empty {
                    warn!("mapping over a live entry at {:#x}", run.iova);
                    return Err(MapError::AlreadyMapped);
                }
            }

            let base = self.format.leaf_base(run.prot_bits, level == MAX_LEVELS - 1);
            for (i, slot) in slots[idx..idx + n].iter().enumerate() {
                let pte = base | self.format.encode_paddr(run.paddr + i as u64 * run.block);
                slot.store(pte, Ordering::Relaxed);
            }

            return Ok(n);
        }

        // No table level left to hold a smaller block.
        if level >= MAX_LEVELS - 1 {
            warn!("no level maps {:#x} byte blocks", run.block);
            return Err(MapError::InvalidBlockSize);
        }

        let slot = &self.table_at(table, level)[idx];
        let mut pte = slot.load(Ordering::Acquire);
        if pte == 0 {
            let granule = self.geom.granule();
            let child = self
                .env
                .alloc_pages(granule as usize)
                .ok_or(MapError::OutOfMemory)?;

            pte = self.install_table(slot, child);
            if pte == 0 {
                pte = self.format.table_pte(child.as_u64());
            } else {
                // Lost the race; drop ours and adopt the winner's table.
                self.env.free_pages(child, granule as usize);
            }
        }

        let child = PhysicalAddress::new(self.format.decode_paddr(pte));
        self.map_level(run, level + 1, child)
    }

    /// Publish a table entry pointing at the zeroed page `child`, unless
    /// another thread got there first. Returns the raw entry that won.
    fn install_table(&self, slot: &AtomicU64, child: PhysicalAddress) -> u64 {
        let pte = self.format.table_pte(child.as_u64());
        debug_assert_eq!(
            self.format.decode_paddr(pte),
            child.as_u64(),
            "table page does not fit the entry's address field"
        );

        // Release: the table's zeroed contents must be visible before any
        // walker can observe the entry pointing at it.
        match slot.compare_exchange(0, pte, Ordering::Release, Ordering::Acquire) {
            Ok(_) => 0,
            Err(existing) => existing,
        }
    }

    fn unmap_level(
        &self,
        run: &UnmapRun,
        mut gather: Option<&mut IotlbGather>,
        level: usize,
        table: PhysicalAddress,
    ) -> usize {
        // Walking past the deepest level means the tree is corrupt.
        if level >= MAX_LEVELS {
            warn!("unmap walked off the end of the table");
            return 0;
        }

        let slots = self.table_at(table, level);
        let idx = self.geom.level_index(run.iova, level);
        let pte = slots[idx].load(Ordering::Acquire);
        if pte == 0 {
            warn!("unmap of an unmapped address {:#x}", run.iova);
            return 0;
        }

        let block_size = self.geom.block_size(level);
        if run.block == block_size {
            let n = run.count.min(self.geom.ptes_per_table(level) - idx);
            let mut done = 0;

            for slot in &slots[idx..idx + n] {
                let pte = slot.load(Ordering::Acquire);
                if pte == 0 {
                    warn!("unmap run hit an unmapped entry");
                    break;
                }

                slot.store(0, Ordering::Relaxed);
                let iova_here = Iova::new(run.iova) + done as u64 * block_size;

                if EntryKind::of(pte, level) == EntryKind::Table {
                    // Stale intermediate walk state may still reference
                    // the subtree about to be freed.
                    self.env
                        .flush_walk(iova_here, block_size, self.geom.granule());
                    self.free_subtree(
                        level + 1,
                        PhysicalAddress::new(self.format.decode_paddr(pte)),
                    );
                } else {
                    match gather.as_deref_mut() {
                        Some(g) => {
                            if !g.is_queued() {
                                self.env.flush_page(iova_here, block_size);
                            }
                            g.add_range(iova_here, block_size);
                        }
                        None => self.env.flush_page(iova_here, block_size),
                    }
                }

                done += 1;
            }

            return done;
        }

        // Keep on walking.
        let child = PhysicalAddress::new(self.format.decode_paddr(pte));
        self.unmap_level(run, gather, level + 1, child)
    }

    /// Free the table at `table` and everything below it. The root slot of
    /// the recursion decides the page size: the root block when starting
    /// there, one granule everywhere else.
    fn free_subtree(&self, level: usize, table: PhysicalAddress) {
        debug_assert!(level < MAX_LEVELS);

        let table_size = if level == self.geom.start_level() {
            self.geom.root_size()
        } else {
            self.geom.granule()
        };

        // Only levels above the deepest hold child pointers.
        if level < MAX_LEVELS - 1 {
            for slot in self.table_at(table, level) {
                let pte = slot.load(Ordering::Relaxed);
                if EntryKind::of(pte, level) != EntryKind::Table {
                    continue;
                }
                self.free_subtree(level + 1, PhysicalAddress::new(self.format.decode_paddr(pte)));
            }
        }

        self.env.free_pages(table, table_size as usize);
    }
}
