//! Fictitious page ranges.
//!
//! Device memory and other physical ranges outside the segment tables can be
//! registered here so that page-descriptor-based interfaces keep working for
//! them. Registered ranges live in an interval map keyed by start address,
//! entirely separate from the free queues: fictitious pages are never
//! allocatable.

use core::fmt;

use memaddr::{align_down, PAddr, PAGE_SIZE};

use crate::buddy::PhysAllocator;

/// Cacheability attribute applied to every page of a fictitious range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemAttr {
    #[default]
    WriteBack,
    WriteCombining,
    WriteThrough,
    Uncacheable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The range overlaps one that is already registered.
    Overlap,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Overlap => f.write_str("range overlaps a registered fictitious range"),
        }
    }
}

/// A descriptor view of one fictitious page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FictPage {
    /// The page-aligned base address of the page.
    pub addr: PAddr,
    pub attr: MemAttr,
}

impl PhysAllocator {
    /// Register `[start, end)` as a fictitious range with the given memory
    /// attribute.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Overlap`] if the range overlaps any registered
    /// range. Overlap is a caller bug rather than a resource shortage, so
    /// tests should treat it as fatal.
    pub fn register_fictitious(&self, start: PAddr, end: PAddr, attr: MemAttr) -> Result<(), Error> {
        log::trace!(
            "register_fictitious: start = {:?}, end = {:?}, attr = {:?}",
            start,
            end,
            attr
        );
        assert!(
            start.is_page_aligned() && end.is_page_aligned(),
            "fictitious range must be page-aligned"
        );
        assert!(*start < *end, "empty fictitious range");
        self.fict
            .write()
            .try_insert(*start..*end, attr)
            .map_err(|_| Error::Overlap)
    }

    /// Drop the registration of exactly `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics unless precisely this range is registered. Callers are required
    /// to unregister exactly what they registered.
    pub fn unregister_fictitious(&self, start: PAddr, end: PAddr) {
        log::trace!("unregister_fictitious: start = {:?}, end = {:?}", start, end);
        let removed = self.fict.write().remove_exact(*start..*end);
        assert!(
            removed.is_some(),
            "unregistering fictitious range {start:?}..{end:?} that is not registered"
        );
    }

    /// Look up the fictitious page containing `addr`.
    pub fn fictitious_page(&self, addr: PAddr) -> Option<FictPage> {
        let map = self.fict.read();
        map.get_contained(&*addr).map(|(_, &attr)| FictPage {
            addr: PAddr::new(align_down(*addr, PAGE_SIZE as u64)),
            attr,
        })
    }
}
