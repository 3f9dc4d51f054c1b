//! Contiguous multi-page allocation with placement constraints.
//!
//! A request asks for `npages` physically contiguous pages inside
//! `[low, high)`, starting on an `alignment`-aligned address and never
//! crossing a `boundary` multiple. Requests no larger than the biggest buddy
//! block are served by scanning existing blocks directly; larger ones are
//! served by hunting for physically adjacent runs of max-order blocks.

use memaddr::{ptoa, PAddr};

use crate::buddy::{DomainState, PhysAllocator};
use crate::page::{FreePool, PageId, ORDER_NONE};
use crate::{MAX_ORDER, NR_FREE_LISTS, NR_POOLS};

/// `base` is `alignment`-aligned and a `size`-byte range at `base` stays on
/// one side of every `boundary` multiple.
fn addr_ok(base: u64, size: u64, alignment: u64, boundary: u64) -> bool {
    base % alignment == 0 && (boundary == 0 || (base & (boundary - 1)) + size <= boundary)
}

impl DomainState {
    /// Dequeue every block backing `[start, start + npages)`, retag the run
    /// to the default pool, and push the trailing excess straight back.
    fn claim_run(&mut self, flind: usize, seg: u32, start: u32, npages: usize) -> PAddr {
        let mut idx = start as usize;
        let end = start as usize + npages;
        while idx < end {
            let id = PageId::new(seg, idx as u32);
            let (order, pool) = {
                let page = self.page(id);
                assert_ne!(page.order, ORDER_NONE, "claimed run covers a block that is not free");
                (page.order as usize, page.pool as usize)
            };
            self.queue_remove(flind, pool, order, id);
            if pool != FreePool::Default.index() {
                self.set_pool(id, order, FreePool::Default.index());
            }
            idx += 1 << order;
        }
        if idx > end {
            self.enqueue_contig_inner(seg, end as u32, idx - end);
        }
        self.paddr(PageId::new(seg, start))
    }

    /// Search every pool of one freelist category for a single free block
    /// whose base can hold the whole request.
    fn find_direct(
        &self,
        flind: usize,
        order_min: usize,
        npages: usize,
        low: u64,
        high: u64,
        alignment: u64,
        boundary: u64,
    ) -> Option<(u32, u32)> {
        let size = ptoa(npages as u64);
        for oind in order_min..MAX_ORDER {
            for pind in 0..NR_POOLS {
                let mut cur = self.queue_first(flind, pind, oind);
                while let Some(id) = cur {
                    let base = *self.paddr(id);
                    if base >= low && base + size <= high && addr_ok(base, size, alignment, boundary) {
                        return Some((id.seg, id.idx));
                    }
                    cur = self.page(id).next;
                }
            }
        }
        None
    }

    /// Whether the page at `pfn` begins a free max-order block.
    fn max_block_free(&self, seg: u32, pfn: u64) -> bool {
        let arena = &self.arenas[seg as usize];
        if pfn < arena.base_pfn {
            return false;
        }
        let idx = pfn - arena.base_pfn;
        if idx + (1 << (MAX_ORDER - 1)) > arena.pages.len() as u64 {
            return false;
        }
        arena.pages[idx as usize].order as usize == MAX_ORDER - 1
    }

    fn run_free(&self, seg: u32, start_pfn: u64, npages: u64) -> bool {
        let max_pages = 1u64 << (MAX_ORDER - 1);
        let mut pfn = start_pfn;
        while pfn < start_pfn + npages {
            if !self.max_block_free(seg, pfn) {
                return false;
            }
            pfn += max_pages;
        }
        true
    }

    /// Search one freelist category for `npages` spanning several physically
    /// adjacent max-order blocks.
    fn find_run(
        &self,
        flind: usize,
        npages: usize,
        low: u64,
        high: u64,
        alignment: u64,
        boundary: u64,
    ) -> Option<(u32, u32)> {
        let max_pages = 1u64 << (MAX_ORDER - 1);
        let size = ptoa(npages as u64);
        for pind in 0..NR_POOLS {
            let mut cur = self.queue_first(flind, pind, MAX_ORDER - 1);
            while let Some(id) = cur {
                cur = self.page(id).next;
                let arena = &self.arenas[id.seg as usize];
                let seg_lo = ptoa(arena.base_pfn).max(low);
                let seg_hi = ptoa(arena.base_pfn + arena.pages.len() as u64).min(high);
                let pfn = arena.base_pfn + id.idx as u64;
                let base = ptoa(pfn);
                if base < seg_lo {
                    continue;
                }
                // Only the first usable block of each adjacent run seeds a
                // search; the rest of the run is reached from it. This keeps
                // each block from being examined more than twice.
                if base >= seg_lo + ptoa(max_pages) && self.max_block_free(id.seg, pfn - max_pages) {
                    continue;
                }
                // Try every block boundary in the run as a starting point.
                let mut start = pfn;
                loop {
                    let start_base = ptoa(start);
                    if start_base + size > seg_hi {
                        break;
                    }
                    if addr_ok(start_base, size, alignment, boundary)
                        && self.run_free(id.seg, start, npages as u64)
                    {
                        return Some((id.seg, (start - arena.base_pfn) as u32));
                    }
                    start += max_pages;
                    if !self.max_block_free(id.seg, start) {
                        break;
                    }
                }
            }
        }
        None
    }
}

impl PhysAllocator {
    /// Allocate `npages` physically contiguous pages from `domain`, wholly
    /// inside `[low, high)`, starting on a multiple of `alignment`, and (for
    /// a nonzero `boundary`) never crossing a `boundary` multiple.
    ///
    /// The pages come back tagged for the default pool. Returns `None` when
    /// no placement satisfies the constraints; like any other exhaustion
    /// result this is for the caller to handle, perhaps by retrying after
    /// reclaiming memory.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two, `boundary` is neither
    /// zero nor a power of two, or `npages` is zero.
    pub fn alloc_contig(
        &self,
        domain: usize,
        npages: usize,
        low: PAddr,
        high: PAddr,
        alignment: u64,
        boundary: u64,
    ) -> Option<PAddr> {
        log::trace!(
            "alloc_contig: domain = {}, npages = {}, low = {:?}, high = {:?}, alignment = {:#x}, boundary = {:#x}",
            domain,
            npages,
            low,
            high,
            alignment,
            boundary
        );
        assert!(domain < self.ndomains(), "domain {domain} out of range");
        assert!(npages > 0, "empty request");
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        assert!(
            boundary == 0 || boundary.is_power_of_two(),
            "boundary must be zero or a power of two"
        );
        if *low >= *high {
            return None;
        }

        let order_min = npages.next_power_of_two().trailing_zeros() as usize;
        let mut state = self.domains[domain].free.lock();
        let mut searched = [false; NR_FREE_LISTS];
        for seg in self.segs.iter() {
            if seg.domain() != domain || *seg.end() <= *low || *seg.start() >= *high {
                continue;
            }
            // Segments sharing a freelist binding share queues, so one search
            // covers them all.
            let flind = seg.flind();
            if searched[flind] {
                continue;
            }
            searched[flind] = true;

            let found = if order_min < MAX_ORDER {
                state.find_direct(flind, order_min, npages, *low, *high, alignment, boundary)
            } else {
                state.find_run(flind, npages, *low, *high, alignment, boundary)
            };
            if let Some((aseg, idx)) = found {
                return Some(state.claim_run(flind, aseg, idx, npages));
            }
        }
        None
    }
}
