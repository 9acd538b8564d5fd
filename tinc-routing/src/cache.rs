//! Fixed-size open-address cache from subnet lookup keys to subnet ids.
//!
//! One slot per hash bucket, overwritten on collision. Only the
//! type-discriminated key bytes participate in comparison; owner and
//! expiry never do. The cache must be flushed whenever any subnet is
//! added or removed.

use crate::graph::SubnetId;

const CACHE_BITS: u32 = 8;
const CACHE_SIZE: usize = 1 << CACHE_BITS;

/// Lookup key: the address actually being resolved, not a full subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheKey {
    Mac([u8; 6]),
    Ipv4([u8; 4]),
    Ipv6([u8; 16]),
}

impl CacheKey {
    fn hash(&self) -> usize {
        let (tag, bytes): (u32, &[u8]) = match self {
            CacheKey::Mac(b) => (0, b),
            CacheKey::Ipv4(b) => (1, b),
            CacheKey::Ipv6(b) => (2, b),
        };
        let mut hash = tag;
        for chunk in bytes.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            hash ^= u32::from_ne_bytes(word);
        }
        hash ^= hash >> 16;
        hash ^= hash >> 8;
        hash as usize & (CACHE_SIZE - 1)
    }
}

#[derive(Debug)]
pub(crate) struct SubnetCache {
    slots: Vec<Option<(CacheKey, SubnetId)>>,
}

impl SubnetCache {
    pub(crate) fn new() -> Self {
        SubnetCache {
            slots: vec![None; CACHE_SIZE],
        }
    }

    pub(crate) fn get(&self, key: &CacheKey) -> Option<SubnetId> {
        match &self.slots[key.hash()] {
            Some((stored, id)) if stored == key => Some(*id),
            _ => None,
        }
    }

    pub(crate) fn put(&mut self, key: CacheKey, id: SubnetId) {
        self.slots[key.hash()] = Some((key, id));
    }

    pub(crate) fn flush(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_miss_and_flush() {
        let mut cache = SubnetCache::new();
        let key = CacheKey::Ipv4([10, 0, 0, 1]);
        assert_eq!(cache.get(&key), None);

        cache.put(key, SubnetId(7));
        assert_eq!(cache.get(&key), Some(SubnetId(7)));
        // A different key never aliases to a stored entry.
        assert_eq!(cache.get(&CacheKey::Ipv4([10, 0, 0, 2])), None);

        cache.flush();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&key), None);
    }

    #[test]
    fn same_bytes_different_family_do_not_collide() {
        let mut cache = SubnetCache::new();
        let v4 = CacheKey::Ipv4([1, 2, 3, 4]);
        let mut v6_bytes = [0u8; 16];
        v6_bytes[..4].copy_from_slice(&[1, 2, 3, 4]);
        let v6 = CacheKey::Ipv6(v6_bytes);

        cache.put(v4, SubnetId(1));
        assert_eq!(cache.get(&v6), None);
    }
}
