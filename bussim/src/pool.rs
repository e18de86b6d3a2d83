// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Generational index into a [`Pool`]. A handle goes stale when its slot is
/// released; stale handles never alias the slot's next occupant.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Slot position, for diagnostics.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena with an O(1) free list of recycled slots.
#[derive(Debug)]
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self {
            slots: vec![],
            free: vec![],
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: vec![],
            len: 0,
        }
    }

    pub fn acquire(&mut self, value: T) -> Handle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle {
            index,
            generation: 0,
        }
    }

    /// Returns the value and recycles its slot; `None` for a stale handle.
    pub fn release(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slots ever allocated; recycled slots are counted once.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    Handle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_recycled() {
        let mut pool = Pool::new();
        let a = pool.acquire("a");
        let b = pool.acquire("b");
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.release(a), Some("a"));
        let c = pool.acquire("c");
        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.get(c), Some(&"c"));
        assert_eq!(pool.get(b), Some(&"b"));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_stale_handles_do_not_alias() {
        let mut pool = Pool::new();
        let a = pool.acquire(1);
        pool.release(a);
        let b = pool.acquire(2);
        assert_eq!(pool.get(a), None);
        assert_eq!(pool.release(a), None);
        assert_eq!(pool.get(b), Some(&2));
        *pool.get_mut(b).unwrap() += 1;
        assert_eq!(pool.release(b), Some(3));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_clear_invalidates_everything() {
        let mut pool = Pool::new();
        let handles = (0..4).map(|i| pool.acquire(i)).collect::<Vec<_>>();
        pool.clear();
        assert!(handles.iter().all(|h| !pool.contains(*h)));
        assert_eq!(pool.iter().count(), 0);
        pool.acquire(9);
        assert_eq!(pool.capacity(), 4);
    }
}
