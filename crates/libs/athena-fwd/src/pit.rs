use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use ccnx_codec::{Interest, Name};

use crate::clock::Clock;
use crate::linkset::{LinkId, LinkVector};

pub const DEFAULT_PIT_CAPACITY: usize = 100_000;

const LIFETIME_WINDOW: usize = 100;

const KEY_PLAIN: u8 = 0;
const KEY_KEYID: u8 = 1;
const KEY_HASH: u8 = 2;

/// Composed lookup key: length-prefixed name bytes, a restriction
/// discriminator, then the restriction bytes. The most restrictive
/// attribute wins: content-object hash over key id over the bare name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PitKey(Vec<u8>);

impl PitKey {
    fn compose(name: Option<&Name>, discriminator: u8, restriction: &[u8]) -> Self {
        let base = name.map(|n| n.key_bytes()).unwrap_or_default();
        let mut bytes = Vec::with_capacity(4 + base.len() + 1 + restriction.len());
        bytes.extend_from_slice(&(base.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&base);
        bytes.push(discriminator);
        bytes.extend_from_slice(restriction);
        PitKey(bytes)
    }

    pub fn of(interest: &Interest) -> Self {
        if let Some(hash) = &interest.content_object_hash_restriction {
            Self::compose(interest.name.as_ref(), KEY_HASH, hash)
        } else if let Some(key_id) = &interest.key_id_restriction {
            Self::compose(interest.name.as_ref(), KEY_KEYID, key_id)
        } else {
            Self::compose(interest.name.as_ref(), KEY_PLAIN, &[])
        }
    }

    fn nameless(hash: &[u8]) -> Self {
        Self::compose(None, KEY_HASH, hash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PitResolution {
    Forward,
    Aggregated,
    Error,
}

struct PitEntry {
    interest: Arc<Interest>,
    ingress: LinkVector,
    egress: LinkVector,
    expiration: u64,
    creation: u64,
    seq: u64,
    nameless_alias: Option<PitKey>,
}

/// Pending Interest Table. Entries are swept lazily under insertion
/// pressure; a per-link secondary index drives link-teardown cleanup.
pub struct Pit {
    clock: Rc<dyn Clock>,
    capacity: usize,
    entries: HashMap<PitKey, PitEntry>,
    nameless: HashMap<PitKey, PitKey>,
    by_expiry: BTreeMap<(u64, u64), PitKey>,
    by_link: HashMap<LinkId, HashSet<PitKey>>,
    next_seq: u64,
    lifetimes: VecDeque<u64>,
    lifetime_sum: u64,
    aggregated_count: u64,
}

impl Pit {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self::with_capacity(clock, DEFAULT_PIT_CAPACITY)
    }

    pub fn with_capacity(clock: Rc<dyn Clock>, capacity: usize) -> Self {
        Self {
            clock,
            capacity,
            entries: HashMap::new(),
            nameless: HashMap::new(),
            by_expiry: BTreeMap::new(),
            by_link: HashMap::new(),
            next_seq: 0,
            lifetimes: VecDeque::with_capacity(LIFETIME_WINDOW),
            lifetime_sum: 0,
            aggregated_count: 0,
        }
    }

    pub fn add_interest(&mut self, interest: &Arc<Interest>, ingress: &LinkVector) -> PitResolution {
        let now = self.clock.now_ms();
        let expiration = now + interest.lifetime_ms;
        let key = PitKey::of(interest);

        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.purge_expired(now);
        }

        if let Some(entry) = self.entries.get_mut(&key) {
            let duplicate = ingress.is_subset_of(&entry.ingress);

            if expiration > entry.expiration {
                self.by_expiry.remove(&(entry.expiration, entry.seq));
                entry.expiration = expiration;
                self.by_expiry.insert((entry.expiration, entry.seq), key.clone());
            }

            if duplicate {
                return PitResolution::Forward;
            }

            entry.ingress.union(ingress);
            for id in ingress.iter() {
                self.by_link.entry(id).or_default().insert(key.clone());
            }
            self.aggregated_count += 1;
            return PitResolution::Aggregated;
        }

        if self.entries.len() >= self.capacity {
            return PitResolution::Error;
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let nameless_alias = match (&interest.name, &interest.content_object_hash_restriction) {
            (Some(_), Some(hash)) => {
                let alias = PitKey::nameless(hash);
                self.nameless.insert(alias.clone(), key.clone());
                Some(alias)
            }
            _ => None,
        };

        let entry = PitEntry {
            interest: interest.clone(),
            ingress: ingress.clone(),
            egress: LinkVector::new(),
            expiration,
            creation: now,
            seq,
            nameless_alias,
        };

        self.by_expiry.insert((expiration, seq), key.clone());
        for id in ingress.iter() {
            self.by_link.entry(id).or_default().insert(key.clone());
        }
        self.entries.insert(key, entry);

        PitResolution::Forward
    }

    /// Records the links an interest was actually forwarded on. Called by
    /// the dispatcher after the send so the entry's egress mirrors reality.
    pub fn set_egress(&mut self, interest: &Interest, links: &LinkVector) {
        if let Some(entry) = self.entries.get_mut(&PitKey::of(interest)) {
            entry.egress.union(links);
        }
    }

    pub fn egress_of(&self, interest: &Interest) -> Option<&LinkVector> {
        self.entries.get(&PitKey::of(interest)).map(|entry| &entry.egress)
    }

    /// Clears `ingress` from the matching entry; drops the entry when its
    /// ingress empties. Returns whether any bits were cleared.
    pub fn remove_interest(&mut self, interest: &Interest, ingress: &LinkVector) -> bool {
        let key = PitKey::of(interest);
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };

        let before = entry.ingress.count();
        entry.ingress.difference(ingress);
        let cleared = entry.ingress.count() < before;

        for id in ingress.iter() {
            if !entry.ingress.contains(id) {
                if let Some(keys) = self.by_link.get_mut(&id) {
                    keys.remove(&key);
                }
            }
        }

        if entry.ingress.is_empty() {
            self.remove_entry(&key);
        }
        cleared
    }

    /// Reverse-path match for a delivered content object. Every matching
    /// entry contributes its ingress set and is consumed.
    pub fn match_object(
        &mut self,
        name: Option<&Name>,
        key_id: Option<&[u8]>,
        content_hash: Option<&[u8]>,
    ) -> LinkVector {
        let mut candidates = Vec::new();
        if name.is_some() {
            candidates.push(PitKey::compose(name, KEY_PLAIN, &[]));
            if let Some(key_id) = key_id {
                candidates.push(PitKey::compose(name, KEY_KEYID, key_id));
            }
            if let Some(hash) = content_hash {
                candidates.push(PitKey::compose(name, KEY_HASH, hash));
            }
        }
        if let Some(hash) = content_hash {
            let alias = PitKey::nameless(hash);
            match self.nameless.get(&alias) {
                Some(primary) => candidates.push(primary.clone()),
                None => candidates.push(alias),
            }
        }

        let now = self.clock.now_ms();
        let mut reverse = LinkVector::new();
        for key in candidates {
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            let sample = now.saturating_sub(entry.creation);
            reverse.union(&entry.ingress);
            self.record_lifetime(sample);
            self.remove_entry(&key);
        }
        reverse
    }

    /// Link-teardown cleanup via the per-link index. Must run before the
    /// adapter reports the link closed so no later match can name a dead id.
    pub fn remove_link(&mut self, links: &LinkVector) {
        for id in links.iter() {
            let Some(keys) = self.by_link.remove(&id) else {
                continue;
            };
            for key in keys {
                let Some(entry) = self.entries.get_mut(&key) else {
                    continue;
                };
                entry.ingress.clear(id);
                entry.egress.clear(id);
                if entry.ingress.is_empty() {
                    self.remove_entry(&key);
                }
            }
        }
    }

    /// Removes entries expired at `now`, walking the expiration order and
    /// stopping at the first live one.
    pub fn purge_expired(&mut self, now: u64) {
        loop {
            let Some((&(expiration, seq), key)) = self.by_expiry.iter().next() else {
                return;
            };
            if expiration > now {
                return;
            }
            let key = key.clone();
            // Tokens are kept exact on extension, but re-check the entry
            // before dropping it.
            let live = self.entries.get(&key).map(|entry| entry.expiration > now).unwrap_or(false);
            if live {
                self.by_expiry.remove(&(expiration, seq));
                continue;
            }
            self.remove_entry(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn aggregated_count(&self) -> u64 {
        self.aggregated_count
    }

    /// Mean of the rolling window of satisfied-entry lifetimes, in ms.
    pub fn mean_entry_lifetime_ms(&self) -> f64 {
        if self.lifetimes.is_empty() {
            return 0.0;
        }
        self.lifetime_sum as f64 / self.lifetimes.len() as f64
    }

    /// Human-readable entry summaries for the control `list` command.
    pub fn list_entries(&self) -> Vec<String> {
        let now = self.clock.now_ms();
        self.entries
            .values()
            .map(|entry| {
                let name = entry
                    .interest
                    .name
                    .as_ref()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "(nameless)".to_string());
                format!(
                    "{} ingress {} egress {} expires {}ms",
                    name,
                    entry.ingress,
                    entry.egress,
                    entry.expiration.saturating_sub(now)
                )
            })
            .collect()
    }

    fn record_lifetime(&mut self, sample: u64) {
        if self.lifetimes.len() == LIFETIME_WINDOW {
            if let Some(oldest) = self.lifetimes.pop_front() {
                self.lifetime_sum -= oldest;
            }
        }
        self.lifetimes.push_back(sample);
        self.lifetime_sum += sample;
    }

    fn remove_entry(&mut self, key: &PitKey) {
        let Some(entry) = self.entries.remove(key) else {
            return;
        };
        self.by_expiry.remove(&(entry.expiration, entry.seq));
        for id in entry.ingress.iter() {
            if let Some(keys) = self.by_link.get_mut(&id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_link.remove(&id);
                }
            }
        }
        if let Some(alias) = entry.nameless_alias {
            if self.nameless.get(&alias) == Some(key) {
                self.nameless.remove(&alias);
            }
        }
    }
}
