//! Read-only introspection: free-count tables, segment listings, and the
//! locality matrix.
//!
//! Locks are taken per domain while a table is copied out, so concurrent
//! allocation makes the result best-effort. That is fine for the intended
//! consumers (debug consoles and procfs-style reporting).

use alloc::string::String;
use core::fmt::{self, Write};

use memaddr::PAGE_SHIFT;

use crate::buddy::PhysAllocator;
use crate::{MAX_ORDER, NR_FREE_LISTS, NR_POOLS};

impl PhysAllocator {
    /// Free-block counts per `[freelist][pool][order]` for one domain.
    pub fn free_queue_counts(&self, domain: usize) -> [[[usize; MAX_ORDER]; NR_POOLS]; NR_FREE_LISTS] {
        assert!(domain < self.ndomains(), "domain {domain} out of range");
        let state = self.domains[domain].free.lock();
        let mut out = [[[0; MAX_ORDER]; NR_POOLS]; NR_FREE_LISTS];
        for (flind, set) in state.queues.iter().enumerate() {
            for (pind, lists) in set.iter().enumerate() {
                for (oind, queue) in lists.iter().enumerate() {
                    out[flind][pind][oind] = queue.count;
                }
            }
        }
        out
    }

    /// The total number of free pages in `domain`.
    pub fn free_count(&self, domain: usize) -> usize {
        let counts = self.free_queue_counts(domain);
        let mut total = 0;
        for set in &counts {
            for lists in set {
                for (oind, count) in lists.iter().enumerate() {
                    total += count << oind;
                }
            }
        }
        total
    }

    /// The distance between two domains, if a locality matrix was registered.
    pub fn locality(&self, from: usize, to: usize) -> Option<u8> {
        let n = self.ndomains();
        assert!(from < n && to < n, "domain out of range");
        self.locality.as_ref().map(|table| table[from * n + to])
    }

    /// Write the free-count table of every domain.
    pub fn dump_free(&self, w: &mut dyn Write) -> fmt::Result {
        for domain in 0..self.ndomains() {
            let counts = self.free_queue_counts(domain);
            writeln!(w, "DOMAIN {domain}:")?;
            for (flind, set) in counts.iter().enumerate() {
                writeln!(w, "\nFREE LIST {flind}:")?;
                write!(w, "\n  ORDER (SIZE)")?;
                for pind in 0..NR_POOLS {
                    write!(w, "  |  POOL {pind}")?;
                }
                writeln!(w)?;
                for oind in (0..MAX_ORDER).rev() {
                    write!(w, "  {:5} ({:4}K)", oind, 1u64 << (PAGE_SHIFT - 10 + oind as u32))?;
                    for lists in set {
                        write!(w, "  |  {:6}", lists[oind])?;
                    }
                    writeln!(w)?;
                }
            }
            writeln!(w)?;
        }
        Ok(())
    }

    /// Log the free-count table of every domain at debug level.
    pub fn log_free(&self) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        let mut out = String::new();
        if self.dump_free(&mut out).is_ok() {
            for line in out.lines() {
                log::debug!("{line}");
            }
        }
    }

    /// Write the segment table.
    pub fn dump_segs(&self, w: &mut dyn Write) -> fmt::Result {
        for (i, seg) in self.segments().iter().enumerate() {
            writeln!(w, "SEGMENT {i}:")?;
            writeln!(w, "start:     {:#x}", *seg.start())?;
            writeln!(w, "end:       {:#x}", *seg.end())?;
            writeln!(w, "domain:    {}", seg.domain())?;
            writeln!(w, "free list: {:?}", seg.freelist())?;
            writeln!(w)?;
        }
        Ok(())
    }

    /// Write the domain distance matrix, one row per origin domain.
    pub fn dump_locality(&self, w: &mut dyn Write) -> fmt::Result {
        let Some(table) = &self.locality else {
            return writeln!(w, "no locality information");
        };
        let n = self.ndomains();
        write!(w, "ORIGIN")?;
        for to in 0..n {
            write!(w, "  {to:4}")?;
        }
        writeln!(w)?;
        for from in 0..n {
            write!(w, "{from:6}")?;
            for to in 0..n {
                write!(w, "  {:4}", table[from * n + to])?;
            }
            writeln!(w)?;
        }
        Ok(())
    }
}
