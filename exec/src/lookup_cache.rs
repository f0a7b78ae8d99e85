//! Per-thread RIP→host-code index.
//!
//! Two tiers: a direct-mapped L1 array probed first (also reachable
//! from emitted code through the frame's L1 pointer), and an
//! authoritative hash map. The block-link registry rides along so a
//! cache clear can restore every patched call site before the next
//! emission cycle.

use rustc_hash::FxHashMap;

/// L1 size; power of two so the index is a mask.
pub const L1_ENTRIES: usize = 1 << 13;
pub const L1_MASK: u64 = (L1_ENTRIES - 1) as u64;

/// One L1 slot. `guest == 0` means empty: RIP 0 is never valid guest
/// code.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct L1Entry {
    pub guest: u64,
    pub host: u64,
}

/// Authoritative record for one compiled block.
#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    /// Host entry point (dispatch target).
    pub host_entry: u64,
    /// Address of the block's code header.
    pub begin: u64,
    /// Total emitted size (header..trailer).
    pub size: usize,
    /// Cache generation the block was installed under.
    pub generation: u64,
}

/// One patched call site: restoring `restore` into the 8-byte target
/// word at `record_addr` undoes the link. Plain data so records can be
/// enumerated and cleared deterministically.
#[derive(Debug, Clone, Copy)]
pub struct LinkRecord {
    pub record_addr: u64,
    pub restore: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    /// The buffer holding a previously returned host address was
    /// retired; the caller must treat this as a miss.
    #[error("code cache cleared under a stale handle")]
    CacheCleared,
}

pub struct LookupCache {
    l1: Box<[L1Entry; L1_ENTRIES]>,
    map: FxHashMap<u64, BlockInfo>,
    links: FxHashMap<u64, Vec<LinkRecord>>,
    generation: u64,
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LookupCache {
    pub fn new() -> Self {
        Self {
            l1: Box::new([L1Entry::default(); L1_ENTRIES]),
            map: FxHashMap::default(),
            links: FxHashMap::default(),
            generation: 0,
        }
    }

    /// Base address of the L1 array, for the frame pointer block.
    pub fn l1_base(&self) -> u64 {
        self.l1.as_ptr() as u64
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Two-tier lookup. `Ok(None)` is a plain miss; `CacheCleared`
    /// reports a stale entry that was dropped on the way out.
    pub fn find(&mut self, rip: u64) -> Result<Option<u64>, CacheError> {
        let slot = &self.l1[(rip & L1_MASK) as usize];
        if slot.guest == rip {
            return Ok(Some(slot.host));
        }
        match self.map.get(&rip) {
            Some(info) if info.generation == self.generation => {
                let host = info.host_entry;
                self.l1[(rip & L1_MASK) as usize] = L1Entry { guest: rip, host };
                Ok(Some(host))
            }
            Some(_) => {
                self.map.remove(&rip);
                Err(CacheError::CacheCleared)
            }
            None => Ok(None),
        }
    }

    /// Install both tiers. Runs only inside the signal-safe compile
    /// critical section, so it cannot race with itself on this thread.
    pub fn install(&mut self, rip: u64, mut info: BlockInfo) {
        info.generation = self.generation;
        self.l1[(rip & L1_MASK) as usize] = L1Entry {
            guest: rip,
            host: info.host_entry,
        };
        self.map.insert(rip, info);
    }

    pub fn block_info(&self, rip: u64) -> Option<&BlockInfo> {
        self.map.get(&rip)
    }

    /// Whether `host_pc` falls inside any installed block of the
    /// current generation.
    pub fn find_block_by_host_pc(&self, host_pc: u64) -> Option<&BlockInfo> {
        self.map.values().find(|info| {
            info.generation == self.generation
                && host_pc >= info.begin
                && host_pc < info.begin + info.size as u64
        })
    }

    /// Record an undo entry for a call site patched to reach `rip`.
    pub fn register_link(&mut self, rip: u64, record: LinkRecord) {
        self.links.entry(rip).or_default().push(record);
    }

    pub fn link_count(&self) -> usize {
        self.links.values().map(Vec::len).sum()
    }

    /// Undo records registered for call sites linked to `rip`.
    pub fn links_to(&self, rip: u64) -> &[LinkRecord] {
        self.links.get(&rip).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Empty both tiers and run every undo record, restoring patched
    /// call sites to the exit linker. From the owning thread's point of
    /// view this is atomic: nothing can execute emitted code while its
    /// own thread is in here.
    pub fn clear(&mut self) {
        for slot in self.l1.iter_mut() {
            *slot = L1Entry::default();
        }
        self.map.clear();
        let n = self.link_count();
        for records in self.links.values() {
            for rec in records {
                // SAFETY: the record cell lives in the (still mapped)
                // code buffer and is 8-byte aligned by emission.
                unsafe {
                    (rec.record_addr as *mut u64).write(rec.restore);
                }
            }
        }
        self.links.clear();
        self.generation += 1;
        tracing::debug!(undone_links = n, generation = self.generation, "lookup cache cleared");
    }
}
