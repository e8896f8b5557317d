//! Tag invalidation graph.
//!
//! Maps logical resource tags to the cache keys whose data was provided
//! under them. A tag is a `(kind, id)` pair where the id may be the wildcard
//! `*`, meaning every instance of the kind.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use super::CacheKey;

const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagId {
    Id(String),
    All,
}

impl From<&str> for TagId {
    fn from(id: &str) -> Self {
        if id == WILDCARD {
            TagId::All
        } else {
            TagId::Id(id.to_string())
        }
    }
}

impl From<String> for TagId {
    fn from(id: String) -> Self {
        if id == WILDCARD {
            TagId::All
        } else {
            TagId::Id(id)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub kind: String,
    pub id: TagId,
}

impl Tag {
    pub fn new(kind: impl Into<String>, id: impl Into<TagId>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Wildcard tag covering every instance of `kind`
    pub fn all(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: TagId::All,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.id == TagId::All
    }

    /// Same kind, and either side is the wildcard or the ids are equal.
    pub fn matches(&self, other: &Tag) -> bool {
        self.kind == other.kind
            && (self.is_wildcard() || other.is_wildcard() || self.id == other.id)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            TagId::All => write!(f, "{}:{}", self.kind, WILDCARD),
            TagId::Id(id) => write!(f, "{}:{}", self.kind, id),
        }
    }
}

/// Index from tag to cache keys, plus a history of invalidations.
///
/// Every call to [`TagIndex::invalidate`] bumps a sequence number. A fetch
/// remembers the sequence number current when it started; when it settles
/// and its tags are indexed for the first time, [`TagIndex::invalidated_since`]
/// tells whether a matching invalidation arrived in between.
#[derive(Debug, Default)]
pub struct TagIndex {
    by_kind: HashMap<String, HashMap<TagId, HashSet<CacheKey>>>,
    tags_of: HashMap<CacheKey, Vec<Tag>>,
    seq: u64,
    exact_seq: HashMap<Tag, u64>,
    wildcard_seq: HashMap<String, u64>,
    kind_seq: HashMap<String, u64>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the latest invalidation
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Register `key` under `tags`, replacing whatever it was indexed under before.
    pub fn index(&mut self, key: &CacheKey, tags: &[Tag]) {
        self.remove(key);
        if tags.is_empty() {
            return;
        }

        let mut unique: Vec<Tag> = Vec::with_capacity(tags.len());
        for tag in tags {
            if !unique.contains(tag) {
                unique.push(tag.clone());
            }
        }

        for tag in &unique {
            self.by_kind
                .entry(tag.kind.clone())
                .or_default()
                .entry(tag.id.clone())
                .or_default()
                .insert(key.clone());
        }
        self.tags_of.insert(key.clone(), unique);
    }

    /// Drop `key` from every tag it was indexed under.
    pub fn remove(&mut self, key: &CacheKey) {
        let Some(tags) = self.tags_of.remove(key) else {
            return;
        };

        for tag in tags {
            if let Some(ids) = self.by_kind.get_mut(&tag.kind) {
                if let Some(keys) = ids.get_mut(&tag.id) {
                    keys.remove(key);
                    if keys.is_empty() {
                        ids.remove(&tag.id);
                    }
                }
                if ids.is_empty() {
                    self.by_kind.remove(&tag.kind);
                }
            }
        }
    }

    pub fn tags_of(&self, key: &CacheKey) -> &[Tag] {
        self.tags_of.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Keys indexed under any tag matching one of `tags`.
    pub fn matching(&self, tags: &[Tag]) -> BTreeSet<CacheKey> {
        let mut keys = BTreeSet::new();
        for tag in tags {
            let Some(ids) = self.by_kind.get(&tag.kind) else {
                continue;
            };
            match &tag.id {
                TagId::All => {
                    for set in ids.values() {
                        keys.extend(set.iter().cloned());
                    }
                }
                id => {
                    for candidate in [id, &TagId::All] {
                        if let Some(set) = ids.get(candidate) {
                            keys.extend(set.iter().cloned());
                        }
                    }
                }
            }
        }
        keys
    }

    /// Record an invalidation of `tags` and return the keys it hits.
    pub fn invalidate(&mut self, tags: &[Tag]) -> BTreeSet<CacheKey> {
        self.seq += 1;
        for tag in tags {
            self.kind_seq.insert(tag.kind.clone(), self.seq);
            if tag.is_wildcard() {
                self.wildcard_seq.insert(tag.kind.clone(), self.seq);
            } else {
                self.exact_seq.insert(tag.clone(), self.seq);
            }
        }
        self.matching(tags)
    }

    /// Whether an invalidation matching any of `tags` happened after `seq`.
    pub fn invalidated_since(&self, tags: &[Tag], seq: u64) -> bool {
        tags.iter().any(|tag| {
            let after = |stamp: Option<&u64>| stamp.is_some_and(|s| *s > seq);
            if after(self.wildcard_seq.get(&tag.kind)) {
                return true;
            }
            if tag.is_wildcard() {
                after(self.kind_seq.get(&tag.kind))
            } else {
                after(self.exact_seq.get(tag))
            }
        })
    }

    /// Drop invalidation stamps at or below `floor`, the start of the oldest
    /// fetch still in flight. `None` means nothing is in flight.
    pub fn prune(&mut self, floor: Option<u64>) {
        match floor {
            None => {
                self.exact_seq.clear();
                self.wildcard_seq.clear();
                self.kind_seq.clear();
            }
            Some(floor) => {
                self.exact_seq.retain(|_, seq| *seq > floor);
                self.wildcard_seq.retain(|_, seq| *seq > floor);
                self.kind_seq.retain(|_, seq| *seq > floor);
            }
        }
    }

    /// Number of remembered invalidation stamps
    pub fn history_len(&self) -> usize {
        self.exact_seq.len() + self.wildcard_seq.len() + self.kind_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags_of.is_empty()
    }
}
