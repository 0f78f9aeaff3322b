//! Demand-paged physical memory shared by every emulated process.
//!
//! The [`MemoryManager`] is the sole authority on address validity and
//! page residency.  Physical memory is a fixed pool of frames
//! (`total_memory / frame_size`); a process only *registers* a page count
//! at admission and frames are claimed lazily on first access.
//!
//! # Address space layout
//!
//! ```text
//! virtual address ──► page = address / frame_size
//!
//! page 0        symbol table (registers declared by DECLARE)
//! pages 1..N    program memory touched by READ / WRITE
//! ```
//!
//! # Eviction
//!
//! When no frame is free, the single globally least-recently-used resident
//! page is evicted, whichever process owns it.  Recency is a monotonic
//! access stamp, so ties are impossible.  Eviction only revokes residency:
//! logical contents live in a per-process sparse store and survive any
//! number of evict/reload cycles.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::Pid;

/// Errors from the memory manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("invalid memory configuration: {0}")]
    InvalidConfig(String),

    #[error("process {pid} needs {requested} bytes, per-process cap is {cap}")]
    MemoryCapExceeded {
        pid: Pid,
        requested: usize,
        cap: usize,
    },

    #[error("process {0} must register at least one page")]
    NoPages(Pid),

    #[error("process {0} is already registered")]
    AlreadyRegistered(Pid),

    #[error("process {0} is not registered")]
    UnknownProcess(Pid),

    #[error("address {address:#x} (page {page}) is outside the {registered} pages of process {pid}")]
    AddressOutOfRange {
        pid: Pid,
        address: u32,
        page: usize,
        registered: usize,
    },

    #[error("page {page} of process {pid} is not resident")]
    PageNotResident { pid: Pid, page: usize },

    #[error("no frame available for page {page} of process {pid}")]
    OutOfFrames { pid: Pid, page: usize },
}

impl MemoryError {
    /// Transient errors clear up by themselves on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MemoryError::PageNotResident { .. } | MemoryError::OutOfFrames { .. }
        )
    }
}

/// Memory geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Total physical memory in bytes.
    pub total_memory: usize,
    /// Bytes per frame (and per page).
    pub frame_size: usize,
    /// Largest footprint a single process may register.
    pub max_memory_per_process: usize,
    /// Bytes taken by one instruction record in synthetic workloads.
    pub instruction_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            total_memory: 16384,
            frame_size: 16,
            max_memory_per_process: 4096,
            instruction_size: 4,
        }
    }
}

/// Pages needed by a synthetic program: the symbol-table page plus
/// enough pages for `instructions` records of `instruction_size` bytes.
pub fn pages_for_instructions(
    instructions: usize,
    instruction_size: usize,
    frame_size: usize,
) -> usize {
    1 + instructions
        .saturating_mul(instruction_size)
        .div_ceil(frame_size.max(1))
}

/// Residency state of one (pid, page).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageTableEntry {
    /// Frame holding the page while it is resident.
    pub frame: Option<usize>,
    /// Valid bit: set while resident.
    pub valid: bool,
    /// Access stamp of the most recent touch.
    pub last_access: u64,
}

/// Where a registered page currently lives, for page-table dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageLocation {
    Resident { frame: usize },
    /// Was resident once and has been evicted.
    BackingStore,
    /// Never touched.
    NotLoaded,
}

/// One row of a page-table dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageMapping {
    pub page: usize,
    pub location: PageLocation,
}

/// Cumulative paging counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PagingStats {
    /// Pages brought into a frame.
    pub pages_in: u64,
    /// Pages evicted to make room.
    pub pages_out: u64,
}

/// Per-process memory usage for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessMemoryUsage {
    pub pid: Pid,
    pub registered_pages: usize,
    pub resident_pages: usize,
}

/// Point-in-time view of the whole frame pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub total_memory: usize,
    pub frame_size: usize,
    pub total_frames: usize,
    pub used_frames: usize,
    pub processes: Vec<ProcessMemoryUsage>,
    pub stats: PagingStats,
}

impl MemorySnapshot {
    pub fn used_memory(&self) -> usize {
        self.used_frames * self.frame_size
    }

    pub fn free_memory(&self) -> usize {
        self.total_memory - self.used_memory()
    }
}

type PageKey = (Pid, usize);

#[derive(Debug, Default)]
struct AddressSpace {
    registered_pages: usize,
    table: BTreeMap<usize, PageTableEntry>,
    store: BTreeMap<u32, u16>,
}

/// Frame pool, page tables and global LRU order.
#[derive(Debug)]
pub struct MemoryManager {
    config: MemoryConfig,
    /// Owner of each frame.
    frames: Vec<Option<PageKey>>,
    free: BTreeSet<usize>,
    spaces: BTreeMap<Pid, AddressSpace>,
    /// Access stamp -> resident page, oldest first.
    lru: BTreeMap<u64, PageKey>,
    clock: u64,
    stats: PagingStats,
}

impl MemoryManager {
    /// Build a frame pool from the configured geometry.
    pub fn new(config: MemoryConfig) -> Result<Self, MemoryError> {
        if config.frame_size == 0 {
            return Err(MemoryError::InvalidConfig("frame size must be non-zero".into()));
        }
        if config.total_memory % config.frame_size != 0 {
            return Err(MemoryError::InvalidConfig(format!(
                "total memory {} is not a multiple of frame size {}",
                config.total_memory, config.frame_size
            )));
        }
        let total_frames = config.total_memory / config.frame_size;
        Ok(Self {
            frames: vec![None; total_frames],
            free: (0..total_frames).collect(),
            spaces: BTreeMap::new(),
            lru: BTreeMap::new(),
            clock: 0,
            stats: PagingStats::default(),
            config,
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.config.frame_size
    }

    #[inline]
    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn used_frames(&self) -> usize {
        self.frames.len() - self.free.len()
    }

    #[inline]
    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    pub fn stats(&self) -> PagingStats {
        self.stats
    }

    /// Logical page holding `address`.
    #[inline]
    pub fn page_of(&self, address: u32) -> usize {
        address as usize / self.config.frame_size
    }

    /// Pages needed for a footprint of `bytes`.
    pub fn pages_for_bytes(&self, bytes: usize) -> usize {
        bytes.div_ceil(self.config.frame_size)
    }

    /// [`pages_for_instructions`] under this manager's geometry.
    pub fn pages_for_instructions(&self, instructions: usize) -> usize {
        pages_for_instructions(
            instructions,
            self.config.instruction_size,
            self.config.frame_size,
        )
    }

    /// Record the logical size of a process.  No frame is reserved.
    pub fn register_process(&mut self, pid: Pid, pages: usize) -> Result<(), MemoryError> {
        if pages == 0 {
            return Err(MemoryError::NoPages(pid));
        }
        let requested = pages.saturating_mul(self.config.frame_size);
        if requested > self.config.max_memory_per_process {
            return Err(MemoryError::MemoryCapExceeded {
                pid,
                requested,
                cap: self.config.max_memory_per_process,
            });
        }
        if self.spaces.contains_key(&pid) {
            return Err(MemoryError::AlreadyRegistered(pid));
        }
        self.spaces.insert(
            pid,
            AddressSpace {
                registered_pages: pages,
                ..Default::default()
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, pid: Pid) -> bool {
        self.spaces.contains_key(&pid)
    }

    pub fn registered_pages(&self, pid: Pid) -> Option<usize> {
        self.spaces.get(&pid).map(|s| s.registered_pages)
    }

    /// Pure bounds check, independent of residency.
    pub fn is_address_valid(&self, pid: Pid, address: u32) -> bool {
        let page = self.page_of(address);
        self.spaces
            .get(&pid)
            .is_some_and(|s| page < s.registered_pages)
    }

    /// Whether the page holding `address` currently occupies a frame.
    pub fn is_resident(&self, pid: Pid, address: u32) -> bool {
        let page = self.page_of(address);
        self.spaces
            .get(&pid)
            .and_then(|s| s.table.get(&page))
            .is_some_and(|e| e.valid)
    }

    /// Make the page holding `address` resident, evicting the global LRU
    /// page if the pool is full.  Returns the frame.
    pub fn ensure_page_loaded(&mut self, pid: Pid, address: u32) -> Result<usize, MemoryError> {
        let page = self.page_of(address);
        let space = self
            .spaces
            .get(&pid)
            .ok_or(MemoryError::UnknownProcess(pid))?;
        if page >= space.registered_pages {
            return Err(MemoryError::AddressOutOfRange {
                pid,
                address,
                page,
                registered: space.registered_pages,
            });
        }

        let resident = space.table.get(&page).filter(|e| e.valid).and_then(|e| e.frame);
        if let Some(frame) = resident {
            self.touch(pid, page);
            return Ok(frame);
        }

        let frame = match self.take_free_frame() {
            Some(frame) => frame,
            None => {
                self.evict_lru();
                self.take_free_frame()
                    .ok_or(MemoryError::OutOfFrames { pid, page })?
            }
        };

        self.frames[frame] = Some((pid, page));
        if let Some(space) = self.spaces.get_mut(&pid) {
            let entry = space.table.entry(page).or_default();
            entry.frame = Some(frame);
            entry.valid = true;
        }
        self.touch(pid, page);
        self.stats.pages_in += 1;
        debug!("paged in pid {} page {} -> frame {}", pid, page, frame);
        Ok(frame)
    }

    /// Read a word.  The page must be valid and resident.
    pub fn read(&self, pid: Pid, address: u32) -> Result<u16, MemoryError> {
        let space = self.resident_space(pid, address)?;
        Ok(space.store.get(&address).copied().unwrap_or(0))
    }

    /// Write a word.  The page must be valid and resident.
    pub fn write(&mut self, pid: Pid, address: u32, value: u16) -> Result<(), MemoryError> {
        self.resident_space(pid, address)?;
        if let Some(space) = self.spaces.get_mut(&pid) {
            space.store.insert(address, value);
        }
        Ok(())
    }

    /// Release every frame and table owned by `pid`.  Idempotent; returns
    /// the number of frames freed.
    pub fn deallocate_process(&mut self, pid: Pid) -> usize {
        let Some(space) = self.spaces.remove(&pid) else {
            return 0;
        };
        let mut freed = 0;
        for entry in space.table.values().filter(|e| e.valid) {
            self.lru.remove(&entry.last_access);
            if let Some(frame) = entry.frame {
                self.frames[frame] = None;
                self.free.insert(frame);
                freed += 1;
            }
        }
        debug!("deallocated pid {} ({} frames)", pid, freed);
        freed
    }

    /// Resident pages of `pid`, ascending.
    pub fn resident_pages(&self, pid: Pid) -> Vec<usize> {
        self.spaces
            .get(&pid)
            .map(|s| {
                s.table
                    .iter()
                    .filter(|(_, e)| e.valid)
                    .map(|(&page, _)| page)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Dump every registered page of `pid` with its location.
    pub fn page_table(&self, pid: Pid) -> Option<Vec<PageMapping>> {
        let space = self.spaces.get(&pid)?;
        let rows = (0..space.registered_pages)
            .map(|page| {
                let location = match space.table.get(&page) {
                    Some(PageTableEntry {
                        frame: Some(frame),
                        valid: true,
                        ..
                    }) => PageLocation::Resident { frame: *frame },
                    Some(_) => PageLocation::BackingStore,
                    None => PageLocation::NotLoaded,
                };
                PageMapping { page, location }
            })
            .collect();
        Some(rows)
    }

    /// Resident pages from least to most recently used.
    pub fn lru_order(&self) -> Vec<(Pid, usize)> {
        self.lru.values().copied().collect()
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            total_memory: self.config.total_memory,
            frame_size: self.config.frame_size,
            total_frames: self.total_frames(),
            used_frames: self.used_frames(),
            processes: self
                .spaces
                .iter()
                .map(|(&pid, s)| ProcessMemoryUsage {
                    pid,
                    registered_pages: s.registered_pages,
                    resident_pages: s.table.values().filter(|e| e.valid).count(),
                })
                .collect(),
            stats: self.stats,
        }
    }

    /// Cross-check frames, page tables and the LRU order.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut resident = 0;
        for (&pid, space) in &self.spaces {
            for (&page, entry) in &space.table {
                if page >= space.registered_pages {
                    return Err(format!("pid {} has unregistered page {} in its table", pid, page));
                }
                if !entry.valid {
                    if entry.frame.is_some() {
                        return Err(format!("pid {} page {} is invalid but holds a frame", pid, page));
                    }
                    continue;
                }
                resident += 1;
                let frame = entry
                    .frame
                    .ok_or_else(|| format!("pid {} page {} is valid without a frame", pid, page))?;
                if self.frames.get(frame).copied().flatten() != Some((pid, page)) {
                    return Err(format!("frame {} does not point back to pid {} page {}", frame, pid, page));
                }
                if self.lru.get(&entry.last_access) != Some(&(pid, page)) {
                    return Err(format!("pid {} page {} is missing from the LRU order", pid, page));
                }
            }
        }
        let used = self.frames.iter().filter(|f| f.is_some()).count();
        if used != resident || used != self.used_frames() {
            return Err(format!(
                "{} frames used, {} pages resident, {} frames not free",
                used,
                resident,
                self.used_frames()
            ));
        }
        if self.lru.len() != resident {
            return Err(format!("LRU holds {} pages, {} resident", self.lru.len(), resident));
        }
        Ok(())
    }

    fn take_free_frame(&mut self) -> Option<usize> {
        self.free.pop_first()
    }

    /// Move (pid, page) to the most-recent end of the LRU order.
    fn touch(&mut self, pid: Pid, page: usize) {
        self.clock += 1;
        let stamp = self.clock;
        if let Some(entry) = self
            .spaces
            .get_mut(&pid)
            .and_then(|s| s.table.get_mut(&page))
        {
            self.lru.remove(&entry.last_access);
            entry.last_access = stamp;
            self.lru.insert(stamp, (pid, page));
        }
    }

    fn evict_lru(&mut self) -> Option<(Pid, usize)> {
        let (_, (pid, page)) = self.lru.pop_first()?;
        let entry = self.spaces.get_mut(&pid)?.table.get_mut(&page)?;
        let frame = entry.frame.take();
        entry.valid = false;
        if let Some(frame) = frame {
            self.frames[frame] = None;
            self.free.insert(frame);
        }
        self.stats.pages_out += 1;
        debug!("evicted pid {} page {} from frame {:?}", pid, page, frame);
        Some((pid, page))
    }

    fn resident_space(&self, pid: Pid, address: u32) -> Result<&AddressSpace, MemoryError> {
        let page = self.page_of(address);
        let space = self
            .spaces
            .get(&pid)
            .ok_or(MemoryError::UnknownProcess(pid))?;
        if page >= space.registered_pages {
            return Err(MemoryError::AddressOutOfRange {
                pid,
                address,
                page,
                registered: space.registered_pages,
            });
        }
        match space.table.get(&page) {
            Some(entry) if entry.valid => Ok(space),
            _ => Err(MemoryError::PageNotResident { pid, page }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(frames: usize, frame_size: usize) -> MemoryManager {
        MemoryManager::new(MemoryConfig {
            total_memory: frames * frame_size,
            frame_size,
            max_memory_per_process: 1024,
            instruction_size: 4,
        })
        .unwrap()
    }

    #[test]
    fn rejects_bad_geometry() {
        let zero = MemoryConfig {
            frame_size: 0,
            ..Default::default()
        };
        assert!(matches!(MemoryManager::new(zero), Err(MemoryError::InvalidConfig(_))));

        let ragged = MemoryConfig {
            total_memory: 100,
            frame_size: 16,
            ..Default::default()
        };
        assert!(matches!(MemoryManager::new(ragged), Err(MemoryError::InvalidConfig(_))));
    }

    #[test]
    fn registration_is_lazy_and_capped() {
        let mut mem = manager(4, 64);
        mem.register_process(Pid(1), 16).unwrap();
        assert_eq!(mem.used_frames(), 0);
        assert_eq!(mem.registered_pages(Pid(1)), Some(16));

        let err = mem.register_process(Pid(2), 17).unwrap_err();
        assert_eq!(
            err,
            MemoryError::MemoryCapExceeded {
                pid: Pid(2),
                requested: 17 * 64,
                cap: 1024
            }
        );
        assert!(!mem.is_registered(Pid(2)));
        assert_eq!(mem.register_process(Pid(3), 0), Err(MemoryError::NoPages(Pid(3))));
        assert_eq!(
            mem.register_process(Pid(1), 1),
            Err(MemoryError::AlreadyRegistered(Pid(1)))
        );
    }

    #[test]
    fn page_counts() {
        let mem = manager(4, 64);
        assert_eq!(mem.pages_for_bytes(0), 0);
        assert_eq!(mem.pages_for_bytes(1), 1);
        assert_eq!(mem.pages_for_bytes(64), 1);
        assert_eq!(mem.pages_for_bytes(65), 2);
        // 20 records of 4 bytes = 80 bytes = 2 pages, plus the symbol table.
        assert_eq!(mem.pages_for_instructions(20), 3);
        // Larger records take more code pages.
        assert_eq!(pages_for_instructions(20, 16, 64), 6);
        assert_eq!(pages_for_instructions(0, 4, 64), 1);
    }

    #[test]
    fn address_validity_is_a_bounds_check() {
        let mut mem = manager(1, 64);
        mem.register_process(Pid(1), 2).unwrap();
        assert!(mem.is_address_valid(Pid(1), 0));
        assert!(mem.is_address_valid(Pid(1), 127));
        assert!(!mem.is_address_valid(Pid(1), 128));
        assert!(!mem.is_address_valid(Pid(9), 0));
        assert!(!mem.is_resident(Pid(1), 0));
    }

    #[test]
    fn out_of_range_load_is_not_transient() {
        let mut mem = manager(2, 64);
        mem.register_process(Pid(1), 1).unwrap();
        let err = mem.ensure_page_loaded(Pid(1), 64).unwrap_err();
        assert!(matches!(err, MemoryError::AddressOutOfRange { page: 1, registered: 1, .. }));
        assert!(!err.is_transient());
        assert_eq!(mem.used_frames(), 0);
    }

    #[test]
    fn reload_of_resident_page_reuses_frame() {
        let mut mem = manager(2, 64);
        mem.register_process(Pid(1), 2).unwrap();
        let f1 = mem.ensure_page_loaded(Pid(1), 10).unwrap();
        let f2 = mem.ensure_page_loaded(Pid(1), 20).unwrap();
        assert_eq!(f1, f2);
        assert_eq!(mem.used_frames(), 1);
        assert_eq!(mem.stats().pages_in, 1);
    }

    #[test]
    fn evicts_global_lru_across_processes() {
        let mut mem = manager(2, 64);
        mem.register_process(Pid(1), 4).unwrap();
        mem.register_process(Pid(2), 4).unwrap();

        mem.ensure_page_loaded(Pid(1), 0).unwrap(); // p1 page 0
        mem.ensure_page_loaded(Pid(2), 64).unwrap(); // p2 page 1
        mem.ensure_page_loaded(Pid(1), 0).unwrap(); // refresh p1 page 0

        // Pool full; p2 page 1 is now the oldest.
        mem.ensure_page_loaded(Pid(1), 128).unwrap();
        assert_eq!(mem.resident_pages(Pid(2)), Vec::<usize>::new());
        assert_eq!(mem.resident_pages(Pid(1)), vec![0, 2]);
        assert_eq!(mem.lru_order(), vec![(Pid(1), 0), (Pid(1), 2)]);
        assert_eq!(mem.stats().pages_out, 1);
        mem.check_invariants().unwrap();
    }

    #[test]
    fn contents_survive_eviction() {
        let mut mem = manager(1, 64);
        mem.register_process(Pid(1), 3).unwrap();

        mem.ensure_page_loaded(Pid(1), 70).unwrap();
        mem.write(Pid(1), 70, 1234).unwrap();

        mem.ensure_page_loaded(Pid(1), 130).unwrap();
        assert!(!mem.is_resident(Pid(1), 70));
        assert_eq!(
            mem.read(Pid(1), 70),
            Err(MemoryError::PageNotResident { pid: Pid(1), page: 1 })
        );

        mem.ensure_page_loaded(Pid(1), 70).unwrap();
        assert_eq!(mem.read(Pid(1), 70).unwrap(), 1234);
        assert_eq!(mem.read(Pid(1), 72).unwrap(), 0);
    }

    #[test]
    fn page_table_dump_distinguishes_locations() {
        let mut mem = manager(1, 64);
        mem.register_process(Pid(1), 3).unwrap();
        mem.ensure_page_loaded(Pid(1), 0).unwrap();
        mem.ensure_page_loaded(Pid(1), 64).unwrap();

        let table = mem.page_table(Pid(1)).unwrap();
        assert_eq!(
            table,
            vec![
                PageMapping { page: 0, location: PageLocation::BackingStore },
                PageMapping { page: 1, location: PageLocation::Resident { frame: 0 } },
                PageMapping { page: 2, location: PageLocation::NotLoaded },
            ]
        );
        assert!(mem.page_table(Pid(2)).is_none());
    }

    #[test]
    fn zero_frame_pool_reports_out_of_frames() {
        let mut mem = MemoryManager::new(MemoryConfig {
            total_memory: 0,
            frame_size: 64,
            max_memory_per_process: 1024,
            instruction_size: 4,
        })
        .unwrap();
        mem.register_process(Pid(1), 1).unwrap();
        let err = mem.ensure_page_loaded(Pid(1), 0).unwrap_err();
        assert_eq!(err, MemoryError::OutOfFrames { pid: Pid(1), page: 0 });
        assert!(err.is_transient());
    }

    #[test]
    fn deallocate_is_idempotent_and_frees_everything() {
        let mut mem = manager(4, 64);
        mem.register_process(Pid(1), 4).unwrap();
        mem.register_process(Pid(2), 4).unwrap();
        for addr in [0, 64, 128] {
            mem.ensure_page_loaded(Pid(1), addr).unwrap();
        }
        mem.ensure_page_loaded(Pid(2), 0).unwrap();

        assert_eq!(mem.deallocate_process(Pid(1)), 3);
        assert_eq!(mem.deallocate_process(Pid(1)), 0);
        assert_eq!(mem.used_frames(), 1);
        assert_eq!(mem.lru_order(), vec![(Pid(2), 0)]);
        assert!(!mem.is_registered(Pid(1)));
        mem.check_invariants().unwrap();
    }

    #[test]
    fn snapshot_reports_usage() {
        let mut mem = manager(4, 64);
        mem.register_process(Pid(7), 2).unwrap();
        mem.ensure_page_loaded(Pid(7), 0).unwrap();
        let snap = mem.snapshot();
        assert_eq!(snap.total_frames, 4);
        assert_eq!(snap.used_frames, 1);
        assert_eq!(snap.used_memory(), 64);
        assert_eq!(snap.free_memory(), 192);
        assert_eq!(
            snap.processes,
            vec![ProcessMemoryUsage { pid: Pid(7), registered_pages: 2, resident_pages: 1 }]
        );
    }
}
