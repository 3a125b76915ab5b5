//! Generational arena.
//!
//! Entries are addressed by a [`Handle`] carrying the slot index and the
//! generation it was issued under. Removing an entry bumps the slot's
//! generation, so a stale handle can never reach the slot's next occupant and
//! an entry can be removed at most once.

/// Stable reference to an arena entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// Slab of `T` with generation-checked handles.
pub struct Arena<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Insert a value, reusing a vacant slot when one exists.
    pub fn insert(&mut self, value: T) -> Handle {
        self.len += 1;
        if let Some(index) = self.free_head {
            if let Some(&Entry::Vacant {
                generation,
                next_free,
            }) = self.entries.get(index as usize)
            {
                self.free_head = next_free;
                self.entries[index as usize] = Entry::Occupied { generation, value };
                return Handle { index, generation };
            }
        }

        let index = self.entries.len() as u32;
        self.entries.push(Entry::Occupied {
            generation: 0,
            value,
        });
        Handle {
            index,
            generation: 0,
        }
    }

    /// Remove the entry. Returns `None` for a stale or unknown handle.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let entry = self.entries.get_mut(handle.index())?;
        match entry {
            Entry::Occupied { generation, .. } if *generation == handle.generation => {}
            _ => return None,
        }
        let vacant = Entry::Vacant {
            generation: handle.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let old = std::mem::replace(entry, vacant);
        self.free_head = Some(handle.index);
        self.len -= 1;
        match old {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.entries.get(handle.index())? {
            Entry::Occupied { generation, value } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        match self.entries.get_mut(handle.index())? {
            Entry::Occupied { generation, value } if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, value } => Some((
                    Handle {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Entry::Vacant { .. } => None,
            })
    }

    /// Handle of the first live entry matching `pred`.
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<Handle> {
        self.iter().find(|(_, v)| pred(v)).map(|(h, _)| h)
    }

    /// Remove every entry, returning the values in slot order.
    pub fn drain(&mut self) -> Vec<T> {
        let handles: Vec<Handle> = self.iter().map(|(h, _)| h).collect();
        handles
            .into_iter()
            .filter_map(|h| self.remove(h))
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");

        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_remove_at_most_once() {
        let mut arena = Arena::new();
        let h = arena.insert(1);
        assert_eq!(arena.remove(h), Some(1));
        assert_eq!(arena.remove(h), None);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let mut arena = Arena::new();
        let old = arena.insert(10);
        arena.remove(old);
        let new = arena.insert(20);

        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.remove(old), None);
        assert_eq!(arena.get(new), Some(&20));
    }

    #[test]
    fn test_find_and_iter() {
        let mut arena = Arena::new();
        for i in 0..4 {
            arena.insert(i * 10);
        }
        let h = arena.find(|v| *v == 20).unwrap();
        if let Some(v) = arena.get_mut(h) {
            *v = 21;
        }
        let values: Vec<_> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0, 10, 21, 30]);
        assert!(arena.find(|v| *v == 99).is_none());
    }

    #[test]
    fn test_drain() {
        let mut arena = Arena::new();
        let a = arena.insert('a');
        arena.insert('b');
        let drained = arena.drain();
        assert_eq!(drained, vec!['a', 'b']);
        assert!(arena.is_empty());
        assert_eq!(arena.get(a), None);
    }
}
