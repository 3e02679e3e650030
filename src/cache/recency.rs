//! Recency list stored in an arena of slots
//!
//! A doubly linked list ordered from least- to most-recently used. Nodes live
//! in a `Vec` and link to each other by index, and callers hold a
//! [`SlotHandle`] (index + generation) instead of a pointer. That gives:
//!
//! - O(1) push at the MRU end
//! - O(1) move-to-MRU and removal through a stored handle
//! - stale handles are detected instead of aliasing a reused slot
//!
//! ```text
//! head (LRU)                                  tail (MRU)
//!    [3] <──> [0] <──> [5] <──> [1] <──> [2]
//! free slots: [4]
//! ```

/// Stable reference to an entry in a [`RecencyList`]
///
/// Removing the entry bumps the slot's generation, so a handle kept after
/// removal never matches whatever reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    generation: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

/// LRU-ordered list with handle-based O(1) operations
#[derive(Debug)]
pub struct RecencyList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> RecencyList<T> {
    /// Create an empty list
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an empty list with room for `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the list has no entries
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn live(&self, handle: SlotHandle) -> Option<usize> {
        let slot = self.slots.get(handle.index)?;
        (slot.generation == handle.generation && slot.value.is_some()).then_some(handle.index)
    }

    /// Returns true if `handle` refers to a live entry
    pub fn contains(&self, handle: SlotHandle) -> bool {
        self.live(handle).is_some()
    }

    /// Look up an entry
    pub fn get(&self, handle: SlotHandle) -> Option<&T> {
        let index = self.live(handle)?;
        self.slots[index].value.as_ref()
    }

    /// Look up an entry mutably
    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut T> {
        let index = self.live(handle)?;
        self.slots[index].value.as_mut()
    }

    /// Append at the most-recently-used end
    pub fn push_back(&mut self, value: T) -> SlotHandle {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].value = Some(value);
                index
            },
            None => {
                self.slots.push(Slot {
                    value: Some(value),
                    generation: 0,
                    prev: None,
                    next: None,
                });
                self.slots.len() - 1
            },
        };
        self.link_back(index);
        self.len += 1;
        SlotHandle {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Move an entry to the most-recently-used end
    ///
    /// Returns false if the handle is stale.
    pub fn move_to_back(&mut self, handle: SlotHandle) -> bool {
        let Some(index) = self.live(handle) else {
            return false;
        };
        if self.tail != Some(index) {
            self.unlink(index);
            self.link_back(index);
        }
        true
    }

    /// Remove an entry, returning its value
    pub fn remove(&mut self, handle: SlotHandle) -> Option<T> {
        let index = self.live(handle)?;
        self.unlink(index);
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        let value = slot.value.take();
        self.free.push(index);
        self.len -= 1;
        value
    }

    /// Least-recently-used entry
    pub fn front(&self) -> Option<(SlotHandle, &T)> {
        self.iter().next()
    }

    /// Remove the least-recently-used entry
    pub fn pop_front(&mut self) -> Option<T> {
        let index = self.head?;
        let handle = SlotHandle {
            index,
            generation: self.slots[index].generation,
        };
        self.remove(handle)
    }

    /// Iterate from least- to most-recently used
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Remove every entry and invalidate all handles
    pub fn clear(&mut self) {
        while self.pop_front().is_some() {}
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let slot = &self.slots[index];
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        let slot = &mut self.slots[index];
        slot.prev = None;
        slot.next = None;
    }

    fn link_back(&mut self, index: usize) {
        self.slots[index].prev = self.tail;
        self.slots[index].next = None;
        match self.tail {
            Some(t) => self.slots[t].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
    }
}

impl<T> Default for RecencyList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator from LRU to MRU
pub struct Iter<'a, T> {
    list: &'a RecencyList<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (SlotHandle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let slot = &self.list.slots[index];
        self.cursor = slot.next;
        let value = slot.value.as_ref()?;
        Some((
            SlotHandle {
                index,
                generation: slot.generation,
            },
            value,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(list: &RecencyList<&'static str>) -> Vec<&'static str> {
        list.iter().map(|(_, v)| *v).collect()
    }

    #[test]
    fn test_push_and_pop_in_lru_order() {
        let mut list = RecencyList::new();
        assert!(list.is_empty());

        list.push_back("a");
        list.push_back("b");
        list.push_back("c");
        assert_eq!(list.len(), 3);

        assert_eq!(list.pop_front(), Some("a"));
        assert_eq!(list.pop_front(), Some("b"));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_move_to_back() {
        let mut list = RecencyList::new();
        let a = list.push_back("a");
        let _b = list.push_back("b");
        let c = list.push_back("c");

        assert!(list.move_to_back(a));
        assert_eq!(order(&list), vec!["b", "c", "a"]);

        // Already at the back
        assert!(list.move_to_back(a));
        assert!(list.move_to_back(c));
        assert_eq!(order(&list), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_remove_middle() {
        let mut list = RecencyList::new();
        let _a = list.push_back("a");
        let b = list.push_back("b");
        let _c = list.push_back("c");

        assert_eq!(list.remove(b), Some("b"));
        assert_eq!(order(&list), vec!["a", "c"]);
        assert_eq!(list.remove(b), None);
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let mut list = RecencyList::new();
        let a = list.push_back("a");
        list.remove(a);

        let b = list.push_back("b");
        assert!(!list.contains(a));
        assert!(list.contains(b));
        assert_eq!(list.get(a), None);
        assert!(!list.move_to_back(a));
        assert_eq!(list.remove(a), None);
        assert_eq!(list.get(b), Some(&"b"));
    }

    #[test]
    fn test_front_and_get_mut() {
        let mut list = RecencyList::new();
        let a = list.push_back(1u64);
        list.push_back(2u64);

        if let Some(v) = list.get_mut(a) {
            *v += 10;
        }
        let (handle, value) = list.front().unwrap();
        assert_eq!(handle, a);
        assert_eq!(*value, 11);
    }

    #[test]
    fn test_clear_invalidates_handles() {
        let mut list = RecencyList::new();
        let a = list.push_back("a");
        list.push_back("b");
        list.clear();

        assert!(list.is_empty());
        assert!(!list.contains(a));
        assert_eq!(list.front(), None);
    }

    #[test]
    fn test_single_entry_remove_resets_ends() {
        let mut list = RecencyList::new();
        let a = list.push_back("a");
        list.remove(a);
        let b = list.push_back("b");
        assert_eq!(order(&list), vec!["b"]);
        assert!(list.move_to_back(b));
        assert_eq!(list.pop_front(), Some("b"));
        assert_eq!(list.pop_front(), None);
    }
}
