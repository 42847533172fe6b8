//! Index-linked recency lists.
//!
//! The cache keeps its entries in a slab and threads them onto doubly-linked
//! lists by slot index instead of by pointer. Each link records which list it
//! is on; storing an entry that is already on a list, or unlinking through
//! the wrong list, is an implementation bug and panics.

/// Per-slot link state, kept in a vector parallel to the entry slab.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct Link {
    older: Option<u32>,
    newer: Option<u32>,
    on: Option<ListId>,
}

impl Link {
    pub fn on(&self) -> Option<ListId> {
        self.on
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ListId(pub u8);

/// One recency list: `oldest` is the LRU end, `newest` the MRU end.
#[derive(Debug)]
pub(super) struct List {
    id: ListId,
    oldest: Option<u32>,
    newest: Option<u32>,
    len: usize,
}

impl List {
    pub fn new(id: ListId) -> List {
        List { id, oldest: None, newest: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn oldest(&self) -> Option<u32> {
        self.oldest
    }

    pub fn contains(&self, links: &[Link], idx: u32) -> bool {
        links[idx as usize].on == Some(self.id)
    }

    /// Append at the MRU end.
    pub fn push_newest(&mut self, links: &mut [Link], idx: u32) {
        let link = &mut links[idx as usize];
        assert!(
            link.on.is_none(),
            "cache list {:?}: storing entry {} that is already on list {:?}",
            self.id,
            idx,
            link.on
        );
        link.on = Some(self.id);
        link.older = self.newest;
        link.newer = None;
        match self.newest {
            Some(prev) => links[prev as usize].newer = Some(idx),
            None => self.oldest = Some(idx),
        }
        self.newest = Some(idx);
        self.len += 1;
    }

    /// Remove from anywhere in the list.
    pub fn unlink(&mut self, links: &mut [Link], idx: u32) {
        let link = links[idx as usize];
        assert_eq!(
            link.on,
            Some(self.id),
            "cache list {:?}: unlinking entry {} that is on list {:?}",
            self.id,
            idx,
            link.on
        );
        match link.older {
            Some(o) => links[o as usize].newer = link.newer,
            None => self.oldest = link.newer,
        }
        match link.newer {
            Some(n) => links[n as usize].older = link.older,
            None => self.newest = link.older,
        }
        let link = &mut links[idx as usize];
        link.older = None;
        link.newer = None;
        link.on = None;
        self.len -= 1;
    }

    /// Refresh to the MRU position. Idempotent when already newest.
    pub fn move_to_newest(&mut self, links: &mut [Link], idx: u32) {
        if self.newest == Some(idx) {
            return;
        }
        self.unlink(links, idx);
        self.push_newest(links, idx);
    }
}
