//! Segment table construction.
//!
//! Boot code feeds every available physical range through
//! [`PhysBuilder::add_segment`], which splits it at the freelist boundary and
//! at NUMA affinity boundaries. [`PhysBuilder::finalize`] then coalesces
//! adjacent ranges with identical bindings, builds the page arenas, and
//! populates the free queues. The resulting [`PhysAllocator`] never changes
//! its segment table again.

use alloc::boxed::Box;
use alloc::vec::Vec;

use array_macro::array;
use memaddr::{atop, PAddr};
use ranges::RangeMap;
use spin::{Mutex, RwLock};

use crate::buddy::{Arena, Domain, DomainState, PhysAllocator};
use crate::page::{FreeList, Page};
use crate::queue::FreeQueue;
use crate::{FREELIST_BOUND, MAX_DOMAINS, MAX_ORDER, MAX_SEGMENTS, NR_FREE_LISTS, NR_POOLS};

/// One physically contiguous, page-aligned range lying within a single NUMA
/// domain and bound to a single freelist category.
#[derive(Debug, Clone)]
pub struct Segment {
    start: PAddr,
    end: PAddr,
    domain: u32,
    flind: u8,
    dom_seg: u32,
}

impl Segment {
    #[inline]
    pub fn start(&self) -> PAddr {
        self.start
    }

    #[inline]
    pub fn end(&self) -> PAddr {
        self.end
    }

    #[inline]
    pub fn domain(&self) -> usize {
        self.domain as usize
    }

    #[inline]
    pub fn freelist(&self) -> FreeList {
        FreeList::from_index(self.flind as usize)
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        (atop(*self.end) - atop(*self.start)) as usize
    }

    #[inline]
    pub(crate) fn dom_seg(&self) -> u32 {
        self.dom_seg
    }

    #[inline]
    pub(crate) fn flind(&self) -> usize {
        self.flind as usize
    }
}

/// A physical range's NUMA domain assignment, as reported by the platform's
/// affinity tables.
#[derive(Debug, Clone)]
pub struct Affinity {
    pub start: PAddr,
    pub end: PAddr,
    pub domain: usize,
}

/// Accumulates the boot-time physical memory map and builds the allocator.
///
/// Consuming `self` in [`PhysBuilder::finalize`] guarantees the build runs
/// exactly once and that no allocation can precede it.
pub struct PhysBuilder {
    /// Split pieces as `(start, end, domain)`, sorted by start.
    pieces: Vec<(u64, u64, u32)>,
    ndomains: usize,
    affinity: Vec<Affinity>,
    locality: Option<Box<[u8]>>,
}

impl PhysBuilder {
    pub fn new() -> Self {
        PhysBuilder {
            pieces: Vec::new(),
            ndomains: 1,
            affinity: Vec::new(),
            locality: None,
        }
    }

    /// Declare the NUMA layout: the number of domains, which physical ranges
    /// belong to which domain, and optionally an `ndomains * ndomains`
    /// distance matrix.
    ///
    /// Must be called before any segment is added; never calling it leaves
    /// the machine as a single domain 0.
    pub fn register_domains(&mut self, ndomains: usize, mut affinity: Vec<Affinity>, locality: Option<Vec<u8>>) {
        assert!(
            self.pieces.is_empty(),
            "domains must be registered before segments are added"
        );
        assert!(
            (1..=MAX_DOMAINS).contains(&ndomains),
            "domain count {ndomains} exceeds MAX_DOMAINS ({MAX_DOMAINS})"
        );
        for aff in &affinity {
            assert!(
                aff.domain < ndomains,
                "affinity entry names domain {} but only {} exist",
                aff.domain,
                ndomains
            );
            assert!(
                *aff.start < *aff.end && aff.start.is_page_aligned() && aff.end.is_page_aligned(),
                "malformed affinity range {:?}..{:?}",
                aff.start,
                aff.end
            );
        }
        affinity.sort_by_key(|aff| *aff.start);
        for pair in affinity.windows(2) {
            assert!(
                *pair[0].end <= *pair[1].start,
                "overlapping affinity ranges"
            );
        }
        if let Some(table) = &locality {
            assert_eq!(
                table.len(),
                ndomains * ndomains,
                "locality matrix must be ndomains x ndomains"
            );
        }
        self.ndomains = ndomains;
        self.affinity = affinity;
        self.locality = locality.map(Vec::into_boxed_slice);
    }

    /// Add one available physical range, splitting it at the freelist
    /// boundary and at NUMA affinity boundaries.
    pub fn add_segment(&mut self, start: PAddr, end: PAddr) {
        assert!(
            start.is_page_aligned() && end.is_page_aligned(),
            "segment bounds must be page-aligned"
        );
        assert!(*start < *end, "empty segment {start:?}..{end:?}");

        let (mut lo, hi) = (*start, *end);
        if lo < FREELIST_BOUND && FREELIST_BOUND < hi {
            self.add_piece(lo, FREELIST_BOUND);
            lo = FREELIST_BOUND;
        }
        self.add_piece(lo, hi);
    }

    fn add_piece(&mut self, start: u64, end: u64) {
        let mut assigned = Vec::new();
        if self.affinity.is_empty() {
            assigned.push((start, end, 0u32));
        } else {
            let mut lo = start;
            for aff in &self.affinity {
                if *aff.end <= lo {
                    continue;
                }
                if lo >= end {
                    break;
                }
                assert!(
                    *aff.start <= lo,
                    "physical range has no affinity entry at {lo:#x}"
                );
                let hi = end.min(*aff.end);
                assigned.push((lo, hi, aff.domain as u32));
                lo = hi;
            }
            assert!(lo >= end, "physical range has no affinity entry at {lo:#x}");
        }
        for (s, e, domain) in assigned {
            self.insert(s, e, domain);
        }
    }

    fn insert(&mut self, start: u64, end: u64, domain: u32) {
        assert!(
            self.pieces.len() < MAX_SEGMENTS,
            "segment table overflow: more than {MAX_SEGMENTS} segments"
        );
        let i = self.pieces.partition_point(|&(s, _, _)| s < start);
        if i > 0 {
            assert!(self.pieces[i - 1].1 <= start, "overlapping physical segments");
        }
        if let Some(&(next_start, ..)) = self.pieces.get(i) {
            assert!(end <= next_start, "overlapping physical segments");
        }
        self.pieces.insert(i, (start, end, domain));
    }

    /// Coalesce, build the arenas, populate the free queues, and hand over
    /// the finished allocator.
    pub fn finalize(self) -> PhysAllocator {
        // Adjacent pieces with the same binding become one segment. Pieces
        // never straddle the freelist boundary, so the category of a piece is
        // decided by its start address.
        let mut merged: Vec<(u64, u64, u32)> = Vec::new();
        for (start, end, domain) in self.pieces {
            match merged.last_mut() {
                Some(last)
                    if last.1 == start
                        && last.2 == domain
                        && FreeList::of(PAddr::new(last.0)) == FreeList::of(PAddr::new(start)) =>
                {
                    last.1 = end
                }
                _ => merged.push((start, end, domain)),
            }
        }

        let ndomains = self.ndomains;
        let mut segs = Vec::with_capacity(merged.len());
        let mut arenas: Vec<Vec<Arena>> = (0..ndomains).map(|_| Vec::new()).collect();
        let mut total = 0usize;
        for (start, end, domain) in merged {
            let npages = (atop(end) - atop(start)) as usize;
            total += npages;
            let flind = FreeList::of(PAddr::new(start));
            segs.push(Segment {
                start: PAddr::new(start),
                end: PAddr::new(end),
                domain,
                flind: flind.index() as u8,
                dom_seg: arenas[domain as usize].len() as u32,
            });
            let pages: Box<[Page]> = (0..npages).map(|_| Page::new()).collect();
            arenas[domain as usize].push(Arena {
                base_pfn: atop(start),
                flind: flind.index() as u8,
                pages,
            });
        }

        let domains: Box<[Domain]> = arenas
            .into_iter()
            .map(|list| {
                let mut state = DomainState {
                    queues: array![array![array![FreeQueue::new(); MAX_ORDER]; NR_POOLS]; NR_FREE_LISTS],
                    arenas: list.into_boxed_slice(),
                };
                for seg in 0..state.arenas.len() {
                    let npages = state.arenas[seg].pages.len();
                    state.enqueue_contig_inner(seg as u32, 0, npages);
                }
                Domain {
                    free: Mutex::new(state),
                }
            })
            .collect();

        log::info!(
            "phys: {} segment(s) across {} domain(s), {} pages",
            segs.len(),
            ndomains,
            total
        );
        PhysAllocator {
            segs: segs.into_boxed_slice(),
            domains,
            locality: self.locality,
            fict: RwLock::new(RangeMap::new()),
        }
    }
}

impl Default for PhysBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use memaddr::ptoa;

    use super::*;
    use crate::FreePool;

    const MIB: u64 = 1 << 20;

    #[test]
    fn adjacent_segments_coalesce() {
        let mut builder = PhysBuilder::new();
        builder.add_segment(PAddr::new(0), PAddr::new(4 * MIB));
        builder.add_segment(PAddr::new(4 * MIB), PAddr::new(8 * MIB));
        let phys = builder.finalize();
        assert_eq!(phys.segments().len(), 1);
        let seg = &phys.segments()[0];
        assert_eq!(*seg.start(), 0);
        assert_eq!(*seg.end(), 8 * MIB);
        assert_eq!(seg.page_count(), (8 * MIB / 4096) as usize);
    }

    #[test]
    fn gap_prevents_coalescing() {
        let mut builder = PhysBuilder::new();
        builder.add_segment(PAddr::new(0), PAddr::new(4 * MIB));
        builder.add_segment(PAddr::new(8 * MIB), PAddr::new(12 * MIB));
        let phys = builder.finalize();
        assert_eq!(phys.segments().len(), 2);
        assert!(phys.seg_of(PAddr::new(6 * MIB)).is_none());
        assert!(phys.page_of(PAddr::new(6 * MIB)).is_none());
    }

    #[test]
    fn freelist_boundary_splits_segments() {
        let mut builder = PhysBuilder::new();
        builder.add_segment(
            PAddr::new(FREELIST_BOUND - 4 * MIB),
            PAddr::new(FREELIST_BOUND + 4 * MIB),
        );
        let phys = builder.finalize();
        let segs = phys.segments();
        assert_eq!(segs.len(), 2);
        assert_eq!(*segs[0].end(), FREELIST_BOUND);
        assert_eq!(segs[0].freelist(), FreeList::Low);
        assert_eq!(*segs[1].start(), FREELIST_BOUND);
        assert_eq!(segs[1].freelist(), FreeList::High);
    }

    #[test]
    fn affinity_partitions_domains() {
        let mut builder = PhysBuilder::new();
        builder.register_domains(
            2,
            vec![
                Affinity {
                    start: PAddr::new(0),
                    end: PAddr::new(64 * MIB),
                    domain: 0,
                },
                Affinity {
                    start: PAddr::new(64 * MIB),
                    end: PAddr::new(128 * MIB),
                    domain: 1,
                },
            ],
            Some(vec![10, 21, 21, 10]),
        );
        builder.add_segment(PAddr::new(0), PAddr::new(128 * MIB));
        let phys = builder.finalize();

        assert_eq!(phys.ndomains(), 2);
        assert_eq!(phys.segments().len(), 2);
        assert_eq!(phys.domain_of(PAddr::new(MIB)), Some(0));
        assert_eq!(phys.domain_of(PAddr::new(100 * MIB)), Some(1));
        let pages_per_domain = (64 * MIB / 4096) as usize;
        assert_eq!(phys.free_count(0), pages_per_domain);
        assert_eq!(phys.free_count(1), pages_per_domain);
        assert_eq!(phys.locality(0, 1), Some(21));
        assert_eq!(phys.locality(1, 1), Some(10));

        // Allocation in one domain leaves the other untouched.
        let addr = phys.alloc_pages(1, FreePool::Default, 0).unwrap();
        assert_eq!(phys.domain_of(addr), Some(1));
        assert_eq!(phys.free_count(0), pages_per_domain);
        assert_eq!(phys.free_count(1), pages_per_domain - 1);
    }

    #[test]
    fn unaligned_population_decomposes() {
        // A segment that is neither aligned nor sized to the max block still
        // lands on the queues intact.
        let mut builder = PhysBuilder::new();
        builder.add_segment(PAddr::new(ptoa(3)), PAddr::new(ptoa(3 + 2048 + 5)));
        let phys = builder.finalize();
        assert_eq!(phys.free_count(0), 2048 + 5);
    }

    #[test]
    #[should_panic(expected = "no affinity entry")]
    fn affinity_gap_is_fatal() {
        let mut builder = PhysBuilder::new();
        builder.register_domains(
            2,
            vec![Affinity {
                start: PAddr::new(0),
                end: PAddr::new(64 * MIB),
                domain: 0,
            }],
            None,
        );
        builder.add_segment(PAddr::new(0), PAddr::new(128 * MIB));
    }

    #[test]
    #[should_panic(expected = "overlapping physical segments")]
    fn overlapping_segments_are_fatal() {
        let mut builder = PhysBuilder::new();
        builder.add_segment(PAddr::new(0), PAddr::new(8 * MIB));
        builder.add_segment(PAddr::new(4 * MIB), PAddr::new(12 * MIB));
    }

    #[test]
    #[should_panic(expected = "exceeds MAX_DOMAINS")]
    fn too_many_domains_is_fatal() {
        let mut builder = PhysBuilder::new();
        builder.register_domains(MAX_DOMAINS + 1, Vec::new(), None);
    }
}
