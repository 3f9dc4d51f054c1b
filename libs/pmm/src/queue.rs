//! Free-queue primitives: the doubly-linked lists of free blocks, one per
//! `(freelist, pool, order)` within a domain.

use crate::buddy::{Arena, DomainState};
use crate::page::{Page, PageId, ORDER_NONE};
use crate::{MAX_ORDER, NR_FREE_LISTS, NR_POOLS};

/// One buddy queue: free blocks of a single exact order.
#[derive(Debug, Clone)]
pub(crate) struct FreeQueue {
    pub head: Option<PageId>,
    pub tail: Option<PageId>,
    pub count: usize,
}

impl FreeQueue {
    pub const fn new() -> Self {
        FreeQueue {
            head: None,
            tail: None,
            count: 0,
        }
    }
}

/// The queues of one freelist category: indexed by `[pool][order]`.
pub(crate) type QueueSet = [[FreeQueue; MAX_ORDER]; NR_POOLS];

/// All queues of one domain: indexed by `[freelist][pool][order]`.
pub(crate) type QueueMatrix = [QueueSet; NR_FREE_LISTS];

#[inline]
fn page_mut(arenas: &mut [Arena], id: PageId) -> &mut Page {
    &mut arenas[id.seg as usize].pages[id.idx as usize]
}

impl DomainState {
    #[inline]
    pub(crate) fn page(&self, id: PageId) -> &Page {
        &self.arenas[id.seg as usize].pages[id.idx as usize]
    }

    #[inline]
    pub(crate) fn queue_first(&self, flind: usize, pool: usize, order: usize) -> Option<PageId> {
        self.queues[flind][pool][order].head
    }

    /// Insert `id` as the first page of a free block of `2^order` pages.
    ///
    /// The page must not already be free at any order, and its pool tag must
    /// match the target queue.
    pub(crate) fn queue_add(&mut self, flind: usize, pool: usize, order: usize, id: PageId, tail: bool) {
        let arenas = &mut self.arenas;
        {
            let page = page_mut(arenas, id);
            assert_eq!(page.order, ORDER_NONE, "enqueueing a page that is already free");
            assert_eq!(page.pool as usize, pool, "page pool tag does not match the target queue");
        }
        let queue = &mut self.queues[flind][pool][order];
        if tail {
            match queue.tail {
                Some(t) => page_mut(arenas, t).next = Some(id),
                None => queue.head = Some(id),
            }
            let page = page_mut(arenas, id);
            page.prev = queue.tail;
            page.next = None;
            page.order = order as u8;
            queue.tail = Some(id);
        } else {
            match queue.head {
                Some(h) => page_mut(arenas, h).prev = Some(id),
                None => queue.tail = Some(id),
            }
            let page = page_mut(arenas, id);
            page.next = queue.head;
            page.prev = None;
            page.order = order as u8;
            queue.head = Some(id);
        }
        queue.count += 1;
    }

    /// Remove a known-free block from its queue and mark it not free.
    pub(crate) fn queue_remove(&mut self, flind: usize, pool: usize, order: usize, id: PageId) {
        let arenas = &mut self.arenas;
        let (prev, next) = {
            let page = page_mut(arenas, id);
            assert_eq!(page.order as usize, order, "dequeueing a block at the wrong order");
            assert_eq!(page.pool as usize, pool, "dequeueing a block from the wrong pool");
            let links = (page.prev, page.next);
            page.prev = None;
            page.next = None;
            page.order = ORDER_NONE;
            links
        };
        let queue = &mut self.queues[flind][pool][order];
        match prev {
            Some(p) => page_mut(arenas, p).next = next,
            None => {
                assert_eq!(queue.head, Some(id), "block is not on the queue it claims");
                queue.head = next;
            }
        }
        match next {
            Some(n) => page_mut(arenas, n).prev = prev,
            None => queue.tail = prev,
        }
        queue.count -= 1;
    }
}
