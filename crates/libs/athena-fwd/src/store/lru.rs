use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::sync::Arc;

use ccnx_codec::{ContentObject, Interest, Name};

use crate::clock::Clock;

type EntryId = usize;

const KEY_PLAIN: u8 = 0;
const KEY_KEYID: u8 = 1;
const KEY_HASH: u8 = 2;

fn compose_key(name: Option<&Name>, discriminator: u8, restriction: &[u8]) -> Vec<u8> {
    let base = name.map(|n| n.key_bytes()).unwrap_or_default();
    let mut bytes = Vec::with_capacity(4 + base.len() + 1 + restriction.len());
    bytes.extend_from_slice(&(base.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&base);
    bytes.push(discriminator);
    bytes.extend_from_slice(restriction);
    bytes
}

struct StoreEntry {
    object: Arc<ContentObject>,
    size: usize,
    expiry: Option<u64>,
    rct: Option<u64>,
    index_count: u32,
    name_key: Option<Vec<u8>>,
    key_id_key: Option<Vec<u8>>,
    hash_key: Vec<u8>,
    prev: Option<EntryId>,
    next: Option<EntryId>,
}

/// In-memory content-object cache with LRU replacement. Entries live in up
/// to three indices (name, name+keyId, name+hash); eviction runs in three
/// tiers: expired, past recommended cache time, then the LRU tail.
pub struct LruContentStore {
    clock: Rc<dyn Clock>,
    capacity_bytes: usize,
    current_size_bytes: usize,
    slab: Vec<Option<StoreEntry>>,
    free: Vec<EntryId>,
    by_name: HashMap<Vec<u8>, EntryId>,
    by_name_key_id: HashMap<Vec<u8>, EntryId>,
    by_name_hash: HashMap<Vec<u8>, EntryId>,
    by_expiry: BTreeSet<(u64, EntryId)>,
    by_rct: BTreeSet<(u64, EntryId)>,
    lru_head: Option<EntryId>,
    lru_tail: Option<EntryId>,
    hits: u64,
    misses: u64,
}

impl LruContentStore {
    /// Capacity in megabytes; zero disables caching entirely.
    pub fn new(clock: Rc<dyn Clock>, capacity_mb: usize) -> Self {
        Self {
            clock,
            capacity_bytes: capacity_mb * 1024 * 1024,
            current_size_bytes: 0,
            slab: Vec::new(),
            free: Vec::new(),
            by_name: HashMap::new(),
            by_name_key_id: HashMap::new(),
            by_name_hash: HashMap::new(),
            by_expiry: BTreeSet::new(),
            by_rct: BTreeSet::new(),
            lru_head: None,
            lru_tail: None,
            hits: 0,
            misses: 0,
        }
    }

    /// Caches an object. Refuses objects already expired or larger than the
    /// space eviction can recover.
    pub fn put(&mut self, object: Arc<ContentObject>) -> bool {
        let now = self.clock.wall_ms();
        if object.expiry_ms.map(|expiry| expiry <= now).unwrap_or(false) {
            return false;
        }

        let size = entry_size(&object);
        if self.current_size_bytes + size > self.capacity_bytes && !self.make_room(size) {
            return false;
        }

        let name_key = object.name.as_ref().map(|name| compose_key(Some(name), KEY_PLAIN, &[]));
        let key_id_key = match (&object.name, &object.key_id) {
            (Some(name), Some(key_id)) => Some(compose_key(Some(name), KEY_KEYID, key_id)),
            _ => None,
        };
        let hash_key = compose_key(object.name.as_ref(), KEY_HASH, object.content_hash());

        let entry = StoreEntry {
            size,
            expiry: object.expiry_ms,
            rct: object.cache_time_ms,
            index_count: 0,
            name_key: name_key.clone(),
            key_id_key: key_id_key.clone(),
            hash_key: hash_key.clone(),
            prev: None,
            next: None,
            object,
        };

        let id = self.allocate(entry);
        self.push_front(id);
        if let Some(expiry) = self.entry(id).expiry {
            self.by_expiry.insert((expiry, id));
        }
        if let Some(rct) = self.entry(id).rct {
            self.by_rct.insert((rct, id));
        }
        self.current_size_bytes += size;

        if let Some(key) = name_key {
            self.index_insert(IndexKind::Name, key, id);
        }
        if let Some(key) = key_id_key {
            self.index_insert(IndexKind::KeyId, key, id);
        }
        self.index_insert(IndexKind::Hash, hash_key, id);

        true
    }

    /// Most-specific index first: hash restriction, then key id, then the
    /// bare name. A hit that turns out to be expired is purged and reported
    /// as a miss.
    pub fn get_match(&mut self, interest: &Interest) -> Option<Arc<ContentObject>> {
        let id = self.find_match(
            interest.name.as_ref(),
            interest.key_id_restriction.as_deref(),
            interest.content_object_hash_restriction.as_deref(),
        );
        let Some(id) = id else {
            self.misses += 1;
            return None;
        };

        let now = self.clock.wall_ms();
        if self.entry(id).expiry.map(|expiry| expiry <= now).unwrap_or(false) {
            self.purge(id);
            self.misses += 1;
            return None;
        }

        self.detach(id);
        self.push_front(id);
        self.hits += 1;
        Some(self.entry(id).object.clone())
    }

    /// Purges the most specific match, if any.
    pub fn remove_match(
        &mut self,
        name: Option<&Name>,
        key_id: Option<&[u8]>,
        content_hash: Option<&[u8]>,
    ) -> bool {
        match self.find_match(name, key_id, content_hash) {
            Some(id) => {
                self.purge(id);
                true
            }
            None => false,
        }
    }

    /// Frees space until `size_needed` fits: expired objects first, then
    /// past-RCT objects, then the LRU tail. Only an object larger than the
    /// whole store is unsatisfiable.
    pub fn make_room(&mut self, size_needed: usize) -> bool {
        if size_needed > self.capacity_bytes {
            return false;
        }

        let now = self.clock.wall_ms();

        while self.capacity_bytes - self.current_size_bytes < size_needed {
            let Some(&(expiry, id)) = self.by_expiry.iter().next() else {
                break;
            };
            if expiry > now {
                break;
            }
            self.purge(id);
        }

        while self.capacity_bytes - self.current_size_bytes < size_needed {
            let Some(&(rct, id)) = self.by_rct.iter().next() else {
                break;
            };
            if rct > now {
                break;
            }
            self.purge(id);
        }

        while self.capacity_bytes - self.current_size_bytes < size_needed {
            let Some(tail) = self.lru_tail else {
                break;
            };
            self.purge(tail);
        }

        self.capacity_bytes - self.current_size_bytes >= size_needed
    }

    /// Resets the limit and discards all current content.
    pub fn set_capacity(&mut self, capacity_mb: usize) {
        self.capacity_bytes = capacity_mb * 1024 * 1024;
        self.current_size_bytes = 0;
        self.slab.clear();
        self.free.clear();
        self.by_name.clear();
        self.by_name_key_id.clear();
        self.by_name_hash.clear();
        self.by_expiry.clear();
        self.by_rct.clear();
        self.lru_head = None;
        self.lru_tail = None;
    }

    pub fn len(&self) -> usize {
        self.slab.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_size_bytes(&self) -> usize {
        self.current_size_bytes
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    fn find_match(
        &self,
        name: Option<&Name>,
        key_id: Option<&[u8]>,
        content_hash: Option<&[u8]>,
    ) -> Option<EntryId> {
        if let Some(hash) = content_hash {
            return self.by_name_hash.get(&compose_key(name, KEY_HASH, hash)).copied();
        }
        if let (Some(_), Some(key_id)) = (name, key_id) {
            return self.by_name_key_id.get(&compose_key(name, KEY_KEYID, key_id)).copied();
        }
        name.and_then(|_| self.by_name.get(&compose_key(name, KEY_PLAIN, &[])).copied())
    }

    fn index_insert(&mut self, kind: IndexKind, key: Vec<u8>, id: EntryId) {
        let displaced = match kind {
            IndexKind::Name => self.by_name.insert(key, id),
            IndexKind::KeyId => self.by_name_key_id.insert(key, id),
            IndexKind::Hash => self.by_name_hash.insert(key, id),
        };
        self.entry_mut(id).index_count += 1;

        if let Some(displaced) = displaced {
            if displaced != id {
                let entry = self.entry_mut(displaced);
                entry.index_count -= 1;
                if entry.index_count == 0 {
                    self.purge(displaced);
                }
            }
        }
    }

    /// Removes an entry from every structure it participates in.
    fn purge(&mut self, id: EntryId) {
        self.detach(id);
        let Some(entry) = self.slab[id].take() else {
            return;
        };
        self.free.push(id);
        self.current_size_bytes -= entry.size;
        if let Some(expiry) = entry.expiry {
            self.by_expiry.remove(&(expiry, id));
        }
        if let Some(rct) = entry.rct {
            self.by_rct.remove(&(rct, id));
        }
        if let Some(key) = &entry.name_key {
            if self.by_name.get(key) == Some(&id) {
                self.by_name.remove(key);
            }
        }
        if let Some(key) = &entry.key_id_key {
            if self.by_name_key_id.get(key) == Some(&id) {
                self.by_name_key_id.remove(key);
            }
        }
        if self.by_name_hash.get(&entry.hash_key) == Some(&id) {
            self.by_name_hash.remove(&entry.hash_key);
        }
    }

    fn allocate(&mut self, entry: StoreEntry) -> EntryId {
        match self.free.pop() {
            Some(id) => {
                self.slab[id] = Some(entry);
                id
            }
            None => {
                self.slab.push(Some(entry));
                self.slab.len() - 1
            }
        }
    }

    fn entry(&self, id: EntryId) -> &StoreEntry {
        self.slab[id].as_ref().expect("live store entry")
    }

    fn entry_mut(&mut self, id: EntryId) -> &mut StoreEntry {
        self.slab[id].as_mut().expect("live store entry")
    }

    fn push_front(&mut self, id: EntryId) {
        let old_head = self.lru_head;
        {
            let entry = self.entry_mut(id);
            entry.prev = None;
            entry.next = old_head;
        }
        if let Some(head) = old_head {
            self.entry_mut(head).prev = Some(id);
        }
        self.lru_head = Some(id);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(id);
        }
    }

    fn detach(&mut self, id: EntryId) {
        let Some(entry) = self.slab[id].as_ref() else {
            return;
        };
        let (prev, next) = (entry.prev, entry.next);
        match prev {
            Some(prev) => self.entry_mut(prev).next = next,
            None => {
                if self.lru_head == Some(id) {
                    self.lru_head = next;
                }
            }
        }
        match next {
            Some(next) => self.entry_mut(next).prev = prev,
            None => {
                if self.lru_tail == Some(id) {
                    self.lru_tail = prev;
                }
            }
        }
        let entry = self.entry_mut(id);
        entry.prev = None;
        entry.next = None;
    }

    #[cfg(test)]
    fn lru_front_name(&self) -> Option<String> {
        self.lru_head
            .and_then(|id| self.entry(id).object.name.as_ref())
            .map(|name| name.to_string())
    }
}

enum IndexKind {
    Name,
    KeyId,
    Hash,
}

fn entry_size(object: &ContentObject) -> usize {
    let name_len = object.name.as_ref().map(|name| name.to_string().len()).unwrap_or(0);
    name_len + object.payload.len()
}
