//! Fixed-capacity key/value cache with pinning, blocking acquire and an
//! adaptive recency/frequency eviction policy.
//!
//! Entries are in one of three states: *pinned* (hold count above zero, never
//! evicted), *live-unpinned* (evictable) or *ghost* (value evicted, key kept
//! for the adaptive policy). `acquire` blocks while every slot is pinned;
//! `release`/`delete` wake at most one acquire waiter per slot that becomes
//! available.
//!
//! The policy is the adaptive two-list scheme: L1 holds entries seen once
//! recently, L2 entries seen at least twice; the scalar target `p` shifts
//! capacity between them based on which ghost list hits. Correctness does not
//! depend on the policy, only on the pin-during-use and block-on-full
//! contracts.

use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::Result;

mod list;
use list::{Link, List, ListId};

const L1_PINNED: usize = 0;
const L1_LIVE: usize = 1;
const L1_GHOST: usize = 2;
const L2_PINNED: usize = 3;
const L2_LIVE: usize = 4;
const L2_GHOST: usize = 5;

struct Slot<K, V> {
    key: Option<K>,
    value: Option<Arc<V>>,
    holds: u32,
}

struct Inner<K, V> {
    cap: usize,
    slots: Vec<Slot<K, V>>,
    links: Vec<Link>,
    free: Vec<u32>,
    map: FxHashMap<K, u32>,
    lists: [List; 6],
    /// Target size of L1's live portion, in `[0, cap]`.
    p: usize,
}

pub struct AdaptiveCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    /// Signalled when a slot may have become available to an acquire waiter.
    avail: Condvar,
    /// Signalled on every hold-count drop to zero; delete waits here.
    idle: Condvar,
}

/// Pin on a cache entry. The entry stays unevictable until the guard drops.
pub struct CacheGuard<'a, K: Eq + Hash + Clone, V> {
    cache: &'a AdaptiveCache<K, V>,
    key: K,
    value: Arc<V>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for CacheGuard<'_, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheGuard")
            .field("key", &self.key)
            .field("value", &self.value)
            .finish()
    }
}

impl<K: Eq + Hash + Clone, V> Deref for CacheGuard<'_, K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<K: Eq + Hash + Clone, V> Drop for CacheGuard<'_, K, V> {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}

impl<K: Eq + Hash + Clone, V> AdaptiveCache<K, V> {
    pub fn new(cap: usize) -> Self {
        assert!(cap >= 1, "cache capacity must be at least 1");
        AdaptiveCache {
            inner: Mutex::new(Inner {
                cap,
                slots: Vec::new(),
                links: Vec::new(),
                free: Vec::new(),
                map: FxHashMap::default(),
                lists: [
                    List::new(ListId(L1_PINNED as u8)),
                    List::new(ListId(L1_LIVE as u8)),
                    List::new(ListId(L1_GHOST as u8)),
                    List::new(ListId(L2_PINNED as u8)),
                    List::new(ListId(L2_LIVE as u8)),
                    List::new(ListId(L2_GHOST as u8)),
                ],
                p: 0,
            }),
            avail: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    /// Pin and return the entry for `key`, loading it through `load` on a
    /// miss. Blocks while the cache is full of pinned entries. `load` runs
    /// under the cache lock; it must not reenter this cache.
    pub fn acquire<F>(&self, key: K, load: F) -> Result<CacheGuard<'_, K, V>>
    where
        F: FnOnce() -> Result<V>,
    {
        let mut load = Some(load);
        let mut inner = self.inner.lock();
        loop {
            if let Some(&idx) = inner.map.get(&key) {
                if inner.slots[idx as usize].value.is_some() {
                    // Hit: promote to the pinned prefix of L2.
                    inner.promote_hit(idx);
                    let value = inner.slots[idx as usize].value.clone().unwrap();
                    return Ok(CacheGuard { cache: self, key, value });
                }
                // Ghost hit: adjust the adaptive target, then reload.
                if !inner.can_make_live_room() {
                    self.avail.wait(&mut inner);
                    continue;
                }
                let in_l1 = inner.lists[L1_GHOST].contains(&inner.links, idx);
                inner.adapt(in_l1);
                inner.ensure_live_room();
                let value = Arc::new((load.take().expect("load ran twice"))()?);
                inner.revive_ghost(idx, value.clone());
                return Ok(CacheGuard { cache: self, key, value });
            }

            // Plain miss.
            if !inner.can_make_live_room() {
                self.avail.wait(&mut inner);
                continue;
            }
            inner.trim_ghosts();
            inner.ensure_live_room();
            let value = Arc::new((load.take().expect("load ran twice"))()?);
            let idx = inner.alloc_slot(key.clone(), value.clone());
            inner.map.insert(key.clone(), idx);
            let (lists, links) = inner.parts();
            lists[L1_PINNED].push_newest(links, idx);
            inner.slots[idx as usize].holds = 1;
            return Ok(CacheGuard { cache: self, key, value });
        }
    }

    /// Unpin one hold. Dropping to zero makes the entry evictable and wakes
    /// one waiter. Releasing an entry that is not held is a fatal bug.
    fn release(&self, key: &K) {
        let mut inner = self.inner.lock();
        let idx = *inner
            .map
            .get(key)
            .expect("cache: released an entry that is not present");
        let slot = &mut inner.slots[idx as usize];
        assert!(
            slot.value.is_some() && slot.holds > 0,
            "cache: released an entry that is not held"
        );
        slot.holds -= 1;
        if slot.holds == 0 {
            let on = inner.links[idx as usize].on().unwrap();
            let live = match on.0 as usize {
                L1_PINNED => L1_LIVE,
                L2_PINNED => L2_LIVE,
                other => unreachable!("held entry on list {}", other),
            };
            let (lists, links) = inner.parts();
            lists[on.0 as usize].unlink(links, idx);
            lists[live].push_newest(links, idx);
            self.avail.notify_one();
            self.idle.notify_all();
        }
    }

    /// Remove `key`. Blocks until the last hold is released; removes
    /// immediately when unheld. Removing an absent key is a no-op.
    pub fn delete(&self, key: &K) {
        let mut inner = self.inner.lock();
        loop {
            let Some(&idx) = inner.map.get(key) else { return };
            let slot = &inner.slots[idx as usize];
            if slot.value.is_none() {
                // Ghost entry.
                let on = inner.links[idx as usize].on().unwrap();
                let (lists, links) = inner.parts();
                lists[on.0 as usize].unlink(links, idx);
                inner.map.remove(key);
                inner.free_slot(idx);
                return;
            }
            if slot.holds == 0 {
                let on = inner.links[idx as usize].on().unwrap();
                let (lists, links) = inner.parts();
                lists[on.0 as usize].unlink(links, idx);
                inner.map.remove(key);
                inner.free_slot(idx);
                // A live slot was freed for the next acquire.
                self.avail.notify_one();
                return;
            }
            self.idle.wait(&mut inner);
        }
    }

    /// Run `f` on every live entry, pinned or not. Does not evict.
    pub fn flush<F: FnMut(&K, &V)>(&self, mut f: F) {
        let inner = self.inner.lock();
        for (key, &idx) in inner.map.iter() {
            if let Some(value) = &inner.slots[idx as usize].value {
                f(key, value);
            }
        }
    }

    /// Number of live values currently held.
    pub fn live_len(&self) -> usize {
        self.inner.lock().live_count()
    }
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn parts(&mut self) -> (&mut [List; 6], &mut [Link]) {
        (&mut self.lists, &mut self.links)
    }

    fn live_count(&self) -> usize {
        self.lists[L1_PINNED].len()
            + self.lists[L1_LIVE].len()
            + self.lists[L2_PINNED].len()
            + self.lists[L2_LIVE].len()
    }

    fn total_count(&self) -> usize {
        self.live_count() + self.lists[L1_GHOST].len() + self.lists[L2_GHOST].len()
    }

    /// Whether a miss can proceed: either a free live slot exists or some
    /// live entry is evictable.
    fn can_make_live_room(&self) -> bool {
        self.live_count() < self.cap
            || self.lists[L1_LIVE].len() + self.lists[L2_LIVE].len() > 0
    }

    /// Make room for one more live value. Consumes spare capacity first (the
    /// delete path can leave the cache non-full); only then evicts the LRU
    /// live entry of whichever list is further over its target.
    fn ensure_live_room(&mut self) {
        if self.live_count() < self.cap {
            return;
        }
        let t1 = self.lists[L1_LIVE].len();
        let t2 = self.lists[L2_LIVE].len();
        debug_assert!(t1 + t2 > 0, "ensure_live_room without an evictable entry");
        let over1 = t1 as i64 - self.p as i64;
        let over2 = t2 as i64 - (self.cap - self.p) as i64;
        let from_l1 = if t1 == 0 {
            false
        } else if t2 == 0 {
            true
        } else {
            over1 >= over2
        };
        let (live, ghost) = if from_l1 { (L1_LIVE, L1_GHOST) } else { (L2_LIVE, L2_GHOST) };
        let idx = self.lists[live].oldest().unwrap();
        debug_assert_eq!(self.slots[idx as usize].holds, 0);
        let (lists, links) = self.parts();
        lists[live].unlink(links, idx);
        lists[ghost].push_newest(links, idx);
        self.slots[idx as usize].value = None;
    }

    /// Ghost bookkeeping ahead of inserting a brand-new key, bounding L1 at
    /// `cap` entries and the whole directory at `2 * cap`.
    fn trim_ghosts(&mut self) {
        let l1_total =
            self.lists[L1_PINNED].len() + self.lists[L1_LIVE].len() + self.lists[L1_GHOST].len();
        if l1_total >= self.cap {
            if let Some(idx) = self.lists[L1_GHOST].oldest() {
                self.drop_ghost(L1_GHOST, idx);
            }
        } else if self.total_count() >= 2 * self.cap {
            if let Some(idx) = self.lists[L2_GHOST].oldest() {
                self.drop_ghost(L2_GHOST, idx);
            }
        }
    }

    fn drop_ghost(&mut self, list: usize, idx: u32) {
        let (lists, links) = self.parts();
        lists[list].unlink(links, idx);
        let key = self.slots[idx as usize].key.take().expect("ghost without a key");
        self.map.remove(&key);
        self.free_slot(idx);
    }

    /// Shift the target toward recency on an L1 ghost hit, toward frequency
    /// on an L2 ghost hit.
    fn adapt(&mut self, hit_in_l1: bool) {
        let b1 = self.lists[L1_GHOST].len().max(1);
        let b2 = self.lists[L2_GHOST].len().max(1);
        if hit_in_l1 {
            let delta = (b2 / b1).max(1);
            self.p = (self.p + delta).min(self.cap);
        } else {
            let delta = (b1 / b2).max(1);
            self.p = self.p.saturating_sub(delta);
        }
    }

    fn promote_hit(&mut self, idx: u32) {
        let on = self.links[idx as usize].on().unwrap();
        let (lists, links) = self.parts();
        if on.0 as usize == L2_PINNED {
            lists[L2_PINNED].move_to_newest(links, idx);
        } else {
            lists[on.0 as usize].unlink(links, idx);
            lists[L2_PINNED].push_newest(links, idx);
        }
        self.slots[idx as usize].holds += 1;
    }

    fn revive_ghost(&mut self, idx: u32, value: Arc<V>) {
        let on = self.links[idx as usize].on().unwrap();
        debug_assert!(matches!(on.0 as usize, L1_GHOST | L2_GHOST));
        let (lists, links) = self.parts();
        lists[on.0 as usize].unlink(links, idx);
        lists[L2_PINNED].push_newest(links, idx);
        let slot = &mut self.slots[idx as usize];
        slot.value = Some(value);
        slot.holds = 1;
    }

    fn alloc_slot(&mut self, key: K, value: Arc<V>) -> u32 {
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.key = Some(key);
            slot.value = Some(value);
            slot.holds = 0;
            idx
        } else {
            self.slots.push(Slot { key: Some(key), value: Some(value), holds: 0 });
            self.links.push(Link::default());
            (self.slots.len() - 1) as u32
        }
    }

    fn free_slot(&mut self, idx: u32) {
        let slot = &mut self.slots[idx as usize];
        slot.key = None;
        slot.value = None;
        slot.holds = 0;
        self.free.push(idx);
    }
}
