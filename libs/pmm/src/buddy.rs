//! The buddy core: block splitting, buddy coalescing, and the allocation
//! and free entry points.
//!
//! Every free block is a naturally-aligned run of `pow(2, order)` pages whose
//! first page carries the live order. Allocation dequeues the smallest
//! adequate block of the requested pool and trims it down, parking the upper
//! halves:
//!
//! ```text
//!     Before: |<----------------a large block---------------->|
//!     After:  |<--->|<--->|<--------->|<--------------------->|
//!              ^used  ^---------------parked-------------^
//! ```
//!
//! Freeing walks the other way. The buddy of a block is found by flipping the
//! order bit of its page frame number, and the two merge whenever the buddy
//! is free at the same order inside the same segment:
//!
//! ```text
//!     |<------a block------>|<-----its buddy----->|
//!     or      |                        |
//!     |<-----its buddy----->|<------a block------>|
//! ```
//!
//! When the requested pool has nothing adequate, a block is stolen from
//! another pool, retagged whole, and then split as usual.

use alloc::boxed::Box;
use alloc::vec::Vec;

use memaddr::{is_aligned, ptoa, PAddr};
use ranges::RangeMap;
use spin::{Mutex, RwLock};

use crate::fict::MemAttr;
use crate::page::{FreeList, FreePool, Page, PageId, ORDER_NONE};
use crate::queue::QueueMatrix;
use crate::seg::Segment;
use crate::{MAX_ORDER, NR_POOLS};

/// The page descriptors of one segment, indexed by page frame offset from the
/// segment start.
pub(crate) struct Arena {
    pub base_pfn: u64,
    pub flind: u8,
    pub pages: Box<[Page]>,
}

/// Everything a domain's lock guards: its free-queue matrix and the page
/// arenas of its segments.
pub(crate) struct DomainState {
    pub queues: QueueMatrix,
    pub arenas: Box<[Arena]>,
}

pub(crate) struct Domain {
    pub free: Mutex<DomainState>,
}

/// The physical page allocator.
///
/// Built once at boot by [`crate::PhysBuilder::finalize`]. The segment table
/// and the matrix structure are frozen afterwards and readable without
/// locking; queue contents and page descriptors are guarded by one lock per
/// domain.
pub struct PhysAllocator {
    pub(crate) segs: Box<[Segment]>,
    pub(crate) domains: Box<[Domain]>,
    pub(crate) locality: Option<Box<[u8]>>,
    pub(crate) fict: RwLock<RangeMap<u64, MemAttr>>,
}

/// The allocator-visible state of one page, as reported by
/// [`PhysAllocator::page_of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// The page is the first page of a free block.
    Free { order: usize, pool: FreePool },
    /// The page is not the first page of any free block: either allocated or
    /// covered by a larger free block.
    Allocated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub segment: usize,
    pub domain: usize,
    pub freelist: FreeList,
    pub state: PageState,
}

/// The largest naturally-aligned chunk order usable at page frame `lo`
/// without overshooting `hi`.
fn chunk_order(lo: u64, hi: u64) -> usize {
    let align = if lo == 0 {
        MAX_ORDER - 1
    } else {
        lo.trailing_zeros() as usize
    };
    align.min(MAX_ORDER - 1).min((hi - lo).ilog2() as usize)
}

impl DomainState {
    #[inline]
    pub(crate) fn paddr(&self, id: PageId) -> PAddr {
        PAddr::new(ptoa(self.arenas[id.seg as usize].base_pfn + id.idx as u64))
    }

    /// Retag a whole block. Pool membership is a property of the block, so
    /// every page of it is updated together.
    pub(crate) fn set_pool(&mut self, id: PageId, order: usize, pool: usize) {
        let pages = &mut self.arenas[id.seg as usize].pages;
        for i in 0..1u32 << order {
            pages[(id.idx + i) as usize].pool = pool as u8;
        }
    }

    /// Trim a dequeued block of `order` down to `target`, parking the upper
    /// halves. Head insertion biases reuse toward the most recently split
    /// blocks, which keeps large blocks intact longer.
    fn split(&mut self, flind: usize, pool: usize, id: PageId, order: usize, target: usize) {
        let mut oind = order;
        while oind > target {
            oind -= 1;
            let buddy = PageId::new(id.seg, id.idx + (1u32 << oind));
            self.queue_add(flind, pool, oind, buddy, false);
        }
    }

    /// Dequeue a block of exactly `order` pages from one freelist category,
    /// splitting or stealing as needed.
    pub(crate) fn alloc_freelist(&mut self, flind: usize, pool: usize, order: usize) -> Option<PageId> {
        for oind in order..MAX_ORDER {
            if let Some(id) = self.queue_first(flind, pool, oind) {
                self.queue_remove(flind, pool, oind, id);
                self.split(flind, pool, id, oind, order);
                return Some(id);
            }
        }
        // Steal from the other pools. The scan runs downward so that a large
        // foreign block is broken up in preference to a small one.
        for oind in (order..MAX_ORDER).rev() {
            for pind in 0..NR_POOLS {
                if pind == pool {
                    continue;
                }
                if let Some(id) = self.queue_first(flind, pind, oind) {
                    self.queue_remove(flind, pind, oind, id);
                    self.set_pool(id, oind, pool);
                    self.split(flind, pool, id, oind, order);
                    return Some(id);
                }
            }
        }
        None
    }

    /// Append up to `need` pages of a dequeued block to `out`, handing any
    /// unused tail straight back to the queues.
    fn carve(&mut self, id: PageId, order: usize, need: usize, out: &mut Vec<PAddr>) -> usize {
        let size = 1usize << order;
        let take = need.min(size);
        for i in 0..take as u32 {
            out.push(self.paddr(PageId::new(id.seg, id.idx + i)));
        }
        if take < size {
            self.enqueue_contig_inner(id.seg, id.idx + take as u32, size - take);
        }
        take
    }

    pub(crate) fn alloc_batch(&mut self, pool: usize, want: usize, out: &mut Vec<PAddr>) -> usize {
        let mut got = 0;
        for fl in FreeList::PRIORITY {
            let flind = fl.index();
            for oind in 0..MAX_ORDER {
                while let Some(id) = self.queue_first(flind, pool, oind) {
                    self.queue_remove(flind, pool, oind, id);
                    got += self.carve(id, oind, want - got, out);
                    if got == want {
                        return got;
                    }
                }
            }
            for oind in (0..MAX_ORDER).rev() {
                for pind in 0..NR_POOLS {
                    if pind == pool {
                        continue;
                    }
                    while let Some(id) = self.queue_first(flind, pind, oind) {
                        self.queue_remove(flind, pind, oind, id);
                        self.set_pool(id, oind, pool);
                        got += self.carve(id, oind, want - got, out);
                        if got == want {
                            return got;
                        }
                    }
                }
            }
        }
        got
    }

    /// Free one block, absorbing its buddy while the buddy is free at the
    /// same order within the same segment.
    pub(crate) fn free_one(&mut self, seg: u32, idx: u32, order: usize) {
        let (flind, base, len) = {
            let arena = &self.arenas[seg as usize];
            (arena.flind as usize, arena.base_pfn, arena.pages.len() as u64)
        };
        let id = PageId::new(seg, idx);
        assert_eq!(
            self.page(id).order,
            ORDER_NONE,
            "double free of block at pfn {:#x}",
            base + idx as u64
        );
        let pool = self.page(id).pool as usize;
        let mut pfn = base + idx as u64;
        let mut order = order;
        while order < MAX_ORDER - 1 {
            let bpfn = pfn ^ (1u64 << order);
            if bpfn < base || bpfn + (1 << order) > base + len {
                break;
            }
            let bid = PageId::new(seg, (bpfn - base) as u32);
            let (border, bpool) = {
                let buddy = self.page(bid);
                (buddy.order, buddy.pool as usize)
            };
            if border as usize != order {
                break;
            }
            self.queue_remove(flind, bpool, order, bid);
            if bpool != pool {
                self.set_pool(bid, order, pool);
            }
            order += 1;
            pfn &= !((1u64 << order) - 1);
        }
        self.queue_add(flind, pool, order, PageId::new(seg, (pfn - base) as u32), true);
    }

    /// Put an arbitrary-length run straight onto the queues as maximal
    /// naturally-aligned chunks, without any merge attempts.
    pub(crate) fn enqueue_contig_inner(&mut self, seg: u32, idx: u32, npages: usize) {
        let (flind, base) = {
            let arena = &self.arenas[seg as usize];
            (arena.flind as usize, arena.base_pfn)
        };
        let mut lo = base + idx as u64;
        let hi = lo + npages as u64;
        while lo < hi {
            let order = chunk_order(lo, hi);
            let id = PageId::new(seg, (lo - base) as u32);
            let pool = self.page(id).pool as usize;
            self.queue_add(flind, pool, order, id, true);
            lo += 1 << order;
        }
    }

    fn free_chunked(&mut self, seg: u32, base: u64, mut lo: u64, hi: u64) {
        while lo < hi {
            let order = chunk_order(lo, hi);
            self.free_one(seg, (lo - base) as u32, order);
            lo += 1 << order;
        }
    }

    /// Free a contiguous run. The aligned middle takes the fast no-merge
    /// path; the ragged edges are freed last, through the coalescing path,
    /// so that neighboring free blocks merge in.
    pub(crate) fn free_contig_inner(&mut self, seg: u32, idx: u32, npages: usize) {
        let base = self.arenas[seg as usize].base_pfn;
        let lo = base + idx as u64;
        let hi = lo + npages as u64;
        let max_block = 1u64 << (MAX_ORDER - 1);
        let mid_lo = memaddr::align_up(lo, max_block).min(hi);
        let mid_hi = memaddr::align_down(hi, max_block).max(mid_lo);
        if mid_lo < mid_hi {
            self.enqueue_contig_inner(seg, (mid_lo - base) as u32, (mid_hi - mid_lo) as usize);
        }
        self.free_chunked(seg, base, lo, mid_lo);
        self.free_chunked(seg, base, mid_hi, hi);
    }

    /// Carve exactly one page out of whatever free block contains it.
    ///
    /// Returns `false` if the page is not inside any free block.
    pub(crate) fn unfree(&mut self, seg: u32, idx: u32) -> bool {
        let (flind, base) = {
            let arena = &self.arenas[seg as usize];
            (arena.flind as usize, arena.base_pfn)
        };
        let pfn = base + idx as u64;
        // Find the first page of the free block containing this page, if any.
        let mut order = 0usize;
        let mut rep_pfn = pfn;
        while self.page(PageId::new(seg, (rep_pfn - base) as u32)).order == ORDER_NONE
            && order < MAX_ORDER - 1
        {
            order += 1;
            let masked = pfn & !((1u64 << order) - 1);
            if masked < base {
                return false;
            }
            rep_pfn = masked;
        }
        let rid = PageId::new(seg, (rep_pfn - base) as u32);
        let rord = self.page(rid).order;
        if rord == ORDER_NONE || (rord as usize) < order {
            return false;
        }
        let mut order = rord as usize;
        let pool = self.page(rid).pool as usize;
        self.queue_remove(flind, pool, order, rid);
        // Halve the block repeatedly, parking whichever half does not contain
        // the target page.
        let mut keep = rep_pfn;
        while order > 0 {
            order -= 1;
            let half = keep ^ (1u64 << order);
            let park = if pfn < half {
                half
            } else {
                let lower = keep;
                keep = half;
                lower
            };
            self.queue_add(flind, pool, order, PageId::new(seg, (park - base) as u32), false);
        }
        debug_assert_eq!(keep, pfn);
        true
    }
}

impl PhysAllocator {
    #[inline]
    pub fn ndomains(&self) -> usize {
        self.domains.len()
    }

    /// The segment table, sorted by start address.
    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.segs
    }

    pub(crate) fn seg_of(&self, addr: PAddr) -> Option<(usize, &Segment)> {
        let i = self.segs.partition_point(|s| *s.end() <= *addr);
        let seg = self.segs.get(i)?;
        (*seg.start() <= *addr).then_some((i, seg))
    }

    fn locate(&self, addr: PAddr, npages: usize, what: &str) -> &Segment {
        assert!(addr.is_page_aligned(), "{what}: {addr:?} is not page-aligned");
        let (_, seg) = self
            .seg_of(addr)
            .unwrap_or_else(|| panic!("{what}: {addr:?} is outside every segment"));
        assert!(
            *addr + ptoa(npages as u64) <= *seg.end(),
            "{what}: range at {addr:?} escapes its segment"
        );
        seg
    }

    /// Allocate a block of `pow(2, order)` contiguous pages from `domain`,
    /// trying each freelist category in priority order.
    ///
    /// Returns `None` when every freelist is exhausted. That is the expected
    /// memory-pressure outcome, not an error.
    pub fn alloc_pages(&self, domain: usize, pool: FreePool, order: usize) -> Option<PAddr> {
        for fl in FreeList::PRIORITY {
            if let Some(addr) = self.alloc_freelist_pages(domain, fl, pool, order) {
                return Some(addr);
            }
        }
        None
    }

    /// Allocate a block of `pow(2, order)` contiguous pages from a single
    /// freelist category of `domain`.
    pub fn alloc_freelist_pages(
        &self,
        domain: usize,
        freelist: FreeList,
        pool: FreePool,
        order: usize,
    ) -> Option<PAddr> {
        log::trace!(
            "alloc_freelist_pages: domain = {}, freelist = {:?}, pool = {:?}, order = {}",
            domain,
            freelist,
            pool,
            order
        );
        assert!(domain < self.domains.len(), "domain {domain} out of range");
        assert!(order < MAX_ORDER, "order {order} out of range");

        let mut state = self.domains[domain].free.lock();
        let id = state.alloc_freelist(freelist.index(), pool.index(), order)?;
        Some(state.paddr(id))
    }

    /// Allocate up to `npages` single pages, not necessarily contiguous,
    /// appending them to `out` in the order carved.
    ///
    /// Returns how many pages were obtained. A short count means the domain
    /// is out of memory; the caller decides what to do about it.
    pub fn alloc_npages(&self, domain: usize, pool: FreePool, npages: usize, out: &mut Vec<PAddr>) -> usize {
        log::trace!(
            "alloc_npages: domain = {}, pool = {:?}, npages = {}",
            domain,
            pool,
            npages
        );
        assert!(domain < self.domains.len(), "domain {domain} out of range");
        assert!(npages > 0, "empty request");

        let mut state = self.domains[domain].free.lock();
        state.alloc_batch(pool.index(), npages, out)
    }

    /// Free a block of `pow(2, order)` pages previously obtained from this
    /// allocator, merging it with free buddies as far as possible.
    ///
    /// # Panics
    ///
    /// Panics if the block is already free, misaligned for its order, or not
    /// wholly inside one segment.
    pub fn free_pages(&self, addr: PAddr, order: usize) {
        log::trace!("free_pages: addr = {:?}, order = {}", addr, order);
        assert!(order < MAX_ORDER, "order {order} out of range");
        let seg = self.locate(addr, 1 << order, "free_pages");
        let pfn = addr.pfn();
        assert!(
            is_aligned(pfn, 1u64 << order),
            "block at {addr:?} is not naturally aligned to order {order}"
        );
        let (dom_seg, domain, idx) = (seg.dom_seg(), seg.domain(), pfn - seg.start().pfn());
        let mut state = self.domains[domain].free.lock();
        state.free_one(dom_seg, idx as u32, order);
    }

    /// Free a contiguous run of `npages` pages, such as one returned by
    /// [`PhysAllocator::alloc_contig`].
    pub fn free_contig(&self, addr: PAddr, npages: usize) {
        log::trace!("free_contig: addr = {:?}, npages = {}", addr, npages);
        assert!(npages > 0, "empty range");
        let seg = self.locate(addr, npages, "free_contig");
        let (dom_seg, domain, idx) = (seg.dom_seg(), seg.domain(), addr.pfn() - seg.start().pfn());
        let mut state = self.domains[domain].free.lock();
        state.free_contig_inner(dom_seg, idx as u32, npages);
    }

    /// Put a contiguous run of `npages` pages onto the free queues without
    /// attempting to merge the resulting chunks.
    ///
    /// Meant for returning the leftovers of a large allocation, where the
    /// chunks were never buddies and a merge pass would be wasted work.
    pub fn enqueue_contig(&self, addr: PAddr, npages: usize) {
        log::trace!("enqueue_contig: addr = {:?}, npages = {}", addr, npages);
        assert!(npages > 0, "empty range");
        let seg = self.locate(addr, npages, "enqueue_contig");
        let (dom_seg, domain, idx) = (seg.dom_seg(), seg.domain(), addr.pfn() - seg.start().pfn());
        let mut state = self.domains[domain].free.lock();
        state.enqueue_contig_inner(dom_seg, idx as u32, npages);
    }

    /// Pull exactly one page out of whatever free block contains it, parking
    /// the rest of the block back on the queues.
    ///
    /// Returns `false` if `addr` is outside every segment or not currently
    /// free.
    pub fn unfree_page(&self, addr: PAddr) -> bool {
        let Some((_, seg)) = self.seg_of(addr) else {
            return false;
        };
        let (dom_seg, domain, idx) = (seg.dom_seg(), seg.domain(), addr.pfn() - seg.start().pfn());
        let mut state = self.domains[domain].free.lock();
        state.unfree(dom_seg, idx as u32)
    }

    /// Resolve a physical address to its page descriptor state.
    pub fn page_of(&self, addr: PAddr) -> Option<PageInfo> {
        let (si, seg) = self.seg_of(addr)?;
        let state = self.domains[seg.domain()].free.lock();
        let page = state.page(PageId::new(seg.dom_seg(), (addr.pfn() - seg.start().pfn()) as u32));
        let pstate = if page.order == ORDER_NONE {
            PageState::Allocated
        } else {
            PageState::Free {
                order: page.order as usize,
                pool: FreePool::from_index(page.pool as usize),
            }
        };
        Some(PageInfo {
            segment: si,
            domain: seg.domain(),
            freelist: seg.freelist(),
            state: pstate,
        })
    }

    /// The NUMA domain owning `addr`, if any segment covers it.
    pub fn domain_of(&self, addr: PAddr) -> Option<usize> {
        self.seg_of(addr).map(|(_, seg)| seg.domain())
    }
}

#[cfg(test)]
impl PhysAllocator {
    /// Every free block of `domain` as `(address, order, freelist, pool)`,
    /// sorted by address.
    pub(crate) fn blocks(&self, domain: usize) -> Vec<(u64, usize, usize, usize)> {
        let state = self.domains[domain].free.lock();
        let mut out = Vec::new();
        for (flind, set) in state.queues.iter().enumerate() {
            for (pind, lists) in set.iter().enumerate() {
                for (oind, queue) in lists.iter().enumerate() {
                    let mut cur = queue.head;
                    let mut walked = 0;
                    while let Some(id) = cur {
                        out.push((*state.paddr(id), oind, flind, pind));
                        cur = state.page(id).next;
                        walked += 1;
                    }
                    assert_eq!(walked, queue.count, "queue count out of sync with its list");
                }
            }
        }
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use memaddr::{atop, PAGE_SIZE, PAGE_SHIFT};

    use super::*;
    use crate::tests_common::single_seg;
    use crate::PhysBuilder;

    const NPAGES: usize = 8192;
    const TOP: usize = MAX_ORDER - 1;

    fn assert_buddy_invariant(phys: &PhysAllocator) {
        for dom in 0..phys.ndomains() {
            for (addr, order, flind, _) in phys.blocks(dom) {
                assert!(is_aligned(atop(addr), 1u64 << order));
                let (_, seg) = phys.seg_of(PAddr::new(addr)).unwrap();
                assert_eq!(seg.domain(), dom);
                assert_eq!(seg.freelist().index(), flind);
                assert!(addr + ptoa(1 << order) <= *seg.end());
            }
        }
    }

    #[test]
    fn pristine_matrix() {
        let phys = single_seg(NPAGES);
        let blocks = phys.blocks(0);
        assert_eq!(blocks.len(), NPAGES >> TOP);
        for (i, &(addr, order, flind, pool)) in blocks.iter().enumerate() {
            assert_eq!(addr, ptoa((i << TOP) as u64));
            assert_eq!(order, TOP);
            assert_eq!(flind, FreeList::Low.index());
            assert_eq!(pool, FreePool::Default.index());
        }
        assert_eq!(phys.free_count(0), NPAGES);
        assert_buddy_invariant(&phys);
    }

    #[test]
    fn split_pattern_and_exact_restore() {
        let phys = single_seg(NPAGES);
        let before = phys.blocks(0);

        let addr = phys
            .alloc_freelist_pages(0, FreeList::Low, FreePool::Default, 0)
            .unwrap();
        assert_eq!(*addr, 0);
        assert_eq!(phys.free_count(0), NPAGES - 1);

        // The classic split remainder: one block at each order below the one
        // broken up, plus the untouched max-order blocks.
        let blocks = phys.blocks(0);
        for order in 0..TOP {
            let at: Vec<_> = blocks.iter().filter(|b| b.1 == order).collect();
            assert_eq!(at.len(), 1);
            assert_eq!(at[0].0, ptoa(1 << order));
        }
        assert_eq!(blocks.iter().filter(|b| b.1 == TOP).count(), NPAGES / (1 << TOP) - 1);
        assert_buddy_invariant(&phys);

        // Freeing the page merges the whole chain back together.
        phys.free_pages(addr, 0);
        assert_eq!(phys.blocks(0), before);
    }

    #[test]
    fn alloc_respects_requested_order() {
        let phys = single_seg(NPAGES);
        let addr = phys.alloc_pages(0, FreePool::Default, 4).unwrap();
        assert!(is_aligned(addr.pfn(), 16));
        assert_eq!(phys.free_count(0), NPAGES - 16);
        phys.free_pages(addr, 4);
        assert_eq!(phys.free_count(0), NPAGES);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let phys = single_seg(NPAGES);
        let addr = phys.alloc_pages(0, FreePool::Default, 0).unwrap();
        phys.free_pages(addr, 0);
        phys.free_pages(addr, 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn order_out_of_range_is_fatal() {
        let phys = single_seg(NPAGES);
        let _ = phys.alloc_pages(0, FreePool::Default, MAX_ORDER);
    }

    #[test]
    fn cross_pool_steal_retags_whole_block() {
        let phys = single_seg(NPAGES);

        // Nothing is tagged for the direct pool yet, so this must steal the
        // largest default-pool block and retag it whole.
        let addr = phys
            .alloc_freelist_pages(0, FreeList::Low, FreePool::Direct, 0)
            .unwrap();
        assert_eq!(*addr, 0);

        let blocks = phys.blocks(0);
        for order in 0..TOP {
            assert!(blocks.contains(&(
                ptoa(1 << order),
                order,
                FreeList::Low.index(),
                FreePool::Direct.index()
            )));
        }
        // Pages split off the stolen block report the new pool.
        match phys.page_of(PAddr::new(ptoa(1))).unwrap().state {
            PageState::Free { order: 0, pool: FreePool::Direct } => {}
            other => panic!("expected an order-0 direct-pool page, got {other:?}"),
        }

        // Freeing merges the stolen block back, still tagged direct.
        phys.free_pages(addr, 0);
        let blocks = phys.blocks(0);
        assert_eq!(blocks.iter().filter(|b| b.1 == TOP).count(), NPAGES >> TOP);
        assert_eq!(
            blocks.iter().filter(|b| b.3 == FreePool::Direct.index()).count(),
            1
        );
        assert_eq!(phys.free_count(0), NPAGES);
        assert_buddy_invariant(&phys);
    }

    #[test]
    fn batch_alloc_carves_and_returns_tail() {
        let phys = single_seg(NPAGES);
        let mut pages = Vec::new();
        let got = phys.alloc_npages(0, FreePool::Default, 100, &mut pages);
        assert_eq!(got, 100);
        assert_eq!(pages.len(), 100);
        for (i, addr) in pages.iter().enumerate() {
            assert_eq!(**addr, ptoa(i as u64));
        }
        assert_eq!(phys.free_count(0), NPAGES - 100);
        assert_buddy_invariant(&phys);

        for addr in pages {
            phys.free_pages(addr, 0);
        }
        assert_eq!(phys.free_count(0), NPAGES);
        assert_eq!(phys.blocks(0).len(), NPAGES >> TOP);
    }

    #[test]
    fn batch_alloc_short_count_on_exhaustion() {
        let phys = single_seg(64);
        let mut pages = Vec::new();
        let got = phys.alloc_npages(0, FreePool::Default, 100, &mut pages);
        assert_eq!(got, 64);
        assert_eq!(phys.free_count(0), 0);
        assert!(phys.alloc_pages(0, FreePool::Default, 0).is_none());
    }

    #[test]
    fn batch_alloc_steals_when_needed() {
        let phys = single_seg(64);
        // Tag the whole segment for the direct pool first.
        let addr = phys.alloc_pages(0, FreePool::Direct, 6).unwrap();
        phys.free_pages(addr, 6);

        let mut pages = Vec::new();
        let got = phys.alloc_npages(0, FreePool::Default, 10, &mut pages);
        assert_eq!(got, 10);
        // Both the carved pages and the returned tail now belong to the
        // default pool.
        assert!(phys.blocks(0).iter().all(|b| b.3 == FreePool::Default.index()));
        assert_eq!(phys.free_count(0), 54);
    }

    #[test]
    fn enqueue_contig_decomposes_without_merging() {
        let phys = single_seg(NPAGES);
        let mut pages = Vec::new();
        assert_eq!(phys.alloc_npages(0, FreePool::Default, 1024, &mut pages), 1024);
        assert_eq!(phys.free_count(0), NPAGES - 1024);

        // Hand back 3 pages at 0x1000: they may not be merged into larger
        // blocks even though their neighbors are free.
        phys.enqueue_contig(PAddr::new(ptoa(1)), 3);
        let blocks = phys.blocks(0);
        assert!(blocks.contains(&(ptoa(1), 0, FreeList::Low.index(), FreePool::Default.index())));
        assert!(blocks.contains(&(ptoa(2), 1, FreeList::Low.index(), FreePool::Default.index())));
        assert_eq!(phys.free_count(0), NPAGES - 1024 + 3);
        assert_buddy_invariant(&phys);
    }

    #[test]
    fn free_contig_restores_max_order_blocks() {
        let phys = single_seg(NPAGES);
        let addr = phys
            .alloc_contig(0, 3000, PAddr::new(0), PAddr::new(ptoa(NPAGES as u64)), PAGE_SIZE as u64, 0)
            .unwrap();
        assert_eq!(phys.free_count(0), NPAGES - 3000);

        phys.free_contig(addr, 3000);
        assert_eq!(phys.free_count(0), NPAGES);
        // Everything coalesces back into max-order blocks.
        let blocks = phys.blocks(0);
        assert_eq!(blocks.len(), NPAGES >> TOP);
        assert!(blocks.iter().all(|b| b.1 == TOP));
        assert_buddy_invariant(&phys);
    }

    #[test]
    fn unfree_carves_one_page_out() {
        let phys = single_seg(NPAGES);
        let target = PAddr::new(ptoa(1));
        assert!(phys.unfree_page(target));
        assert_eq!(phys.free_count(0), NPAGES - 1);
        assert_eq!(phys.page_of(target).unwrap().state, PageState::Allocated);
        assert_buddy_invariant(&phys);

        // A page that is not free cannot be pulled out again.
        assert!(!phys.unfree_page(target));
        // Neither can an address outside every segment.
        assert!(!phys.unfree_page(PAddr::new(ptoa(NPAGES as u64))));

        phys.free_pages(target, 0);
        assert_eq!(phys.free_count(0), NPAGES);
        assert_eq!(phys.blocks(0).len(), NPAGES >> TOP);
    }

    #[test]
    fn freelist_priority_prefers_high_memory() {
        let mut builder = PhysBuilder::new();
        let bound = crate::FREELIST_BOUND;
        let span = ptoa(1 << TOP);
        builder.add_segment(PAddr::new(bound - span), PAddr::new(bound + span));
        let phys = builder.finalize();

        // High memory drains first, preserving the DMA-reachable range.
        let first = phys.alloc_pages(0, FreePool::Default, 0).unwrap();
        assert_eq!(*first, bound);
        for _ in 1..1 << TOP {
            assert!(*phys.alloc_pages(0, FreePool::Default, 0).unwrap() >= bound);
        }
        let low = phys.alloc_pages(0, FreePool::Default, 0).unwrap();
        assert!(*low < bound);
    }

    #[test]
    fn conservation_across_mixed_traffic() {
        let phys = single_seg(NPAGES);
        let a = phys.alloc_pages(0, FreePool::Default, 3).unwrap();
        let b = phys.alloc_pages(0, FreePool::Direct, 0).unwrap();
        let mut batch = Vec::new();
        let got = phys.alloc_npages(0, FreePool::Default, 77, &mut batch);
        let c = phys
            .alloc_contig(0, 100, PAddr::new(0), PAddr::new(ptoa(NPAGES as u64)), 1 << (PAGE_SHIFT + 2), 0)
            .unwrap();
        assert_eq!(phys.free_count(0), NPAGES - 8 - 1 - got - 100);
        assert_buddy_invariant(&phys);

        phys.free_contig(c, 100);
        for addr in batch {
            phys.free_pages(addr, 0);
        }
        phys.free_pages(b, 0);
        phys.free_pages(a, 3);
        assert_eq!(phys.free_count(0), NPAGES);
        let blocks = phys.blocks(0);
        assert_eq!(blocks.len(), NPAGES >> TOP);
        assert!(blocks.iter().all(|b| b.1 == TOP));
    }
}
