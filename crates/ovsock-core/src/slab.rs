//! Index-stable slab with generation-checked keys.
//!
//! Holds both the pending completion contexts of a socket and the accepted
//! clients of a server. Removing an entry frees its index for reuse; the
//! bumped generation makes stale keys miss instead of aliasing the new
//! occupant.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlabKey {
    pub index: u32,
    pub generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub struct Slab<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slab<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> SlabKey {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return SlabKey {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        SlabKey {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, key: SlabKey) -> Option<&T> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, key: SlabKey) -> Option<&mut T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn get_index_mut(&mut self, index: u32) -> Option<&mut T> {
        self.slots.get_mut(index as usize)?.value.as_mut()
    }

    pub fn remove(&mut self, key: SlabKey) -> Option<T> {
        match self.slots.get(key.index as usize) {
            Some(slot) if slot.generation == key.generation => self.remove_index(key.index),
            _ => None,
        }
    }

    /// Remove by index alone. Used for completion contexts, whose tokens
    /// carry only the index: each index completes exactly once before reuse.
    pub fn remove_index(&mut self, index: u32) -> Option<T> {
        let slot = self.slots.get_mut(index as usize)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.len -= 1;
        Some(value)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn keys(&self) -> Vec<SlabKey> {
        self.iter().map(|(k, _)| k).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlabKey, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value.as_ref().map(|v| {
                (
                    SlabKey {
                        index: i as u32,
                        generation: slot.generation,
                    },
                    v,
                )
            })
        })
    }

    /// Remove every entry, returning them in index order.
    pub fn drain(&mut self) -> Vec<T> {
        let keys = self.keys();
        keys.into_iter().filter_map(|k| self.remove(k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut s = Slab::new();
        let a = s.insert("a");
        let b = s.insert("b");
        assert_eq!(s.len(), 2);
        assert_eq!(s.get(a), Some(&"a"));
        assert_eq!(s.remove(a), Some("a"));
        assert_eq!(s.remove(a), None);
        assert_eq!(s.get(b), Some(&"b"));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_stale_key_misses_reused_index() {
        let mut s = Slab::new();
        let a = s.insert(1);
        s.remove(a);
        let c = s.insert(2);
        assert_eq!(c.index, a.index);
        assert_ne!(c.generation, a.generation);
        assert_eq!(s.get(a), None);
        assert_eq!(s.get(c), Some(&2));
    }

    #[test]
    fn test_remove_index_once() {
        let mut s = Slab::new();
        let k = s.insert(5u8);
        assert_eq!(s.remove_index(k.index), Some(5));
        assert_eq!(s.remove_index(k.index), None);
        assert!(s.is_empty());
    }

    #[test]
    fn test_drain() {
        let mut s = Slab::new();
        for i in 0..4 {
            s.insert(i);
        }
        let k = s.keys()[1];
        s.remove(k);
        assert_eq!(s.drain(), vec![0, 2, 3]);
        assert!(s.is_empty());
    }
}
