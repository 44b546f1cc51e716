//! Concurrent ordered set of currently active values.
//!
//! [`ActiveSet`] remembers values in acceptance order while they are live and
//! forgets them in O(1) through the [`EntryHandle`] returned at insertion.
//! It backs every place where two independently time-varying collections must
//! be paired against each other, most prominently `apply_to`.
//!
//! Enumeration is by snapshot: a snapshot observes exactly the membership at
//! the instant it is taken. An element whose `remove()` returned before the
//! snapshot never appears; an element present for the whole enumeration is
//! never skipped.

use std::sync::{Arc, Mutex, PoisonError};

struct Entry<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Slot<T> {
    generation: u64,
    entry: Option<Entry<T>>,
}

struct SetInner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

/// A thread-safe ordered container with O(1) removal by handle.
pub struct ActiveSet<T> {
    inner: Arc<Mutex<SetInner<T>>>,
}

/// The removal capability for one inserted element.
///
/// Removing an already-removed element is a no-op; slot reuse is guarded by
/// a generation counter so a stale handle can never evict a newer element.
pub struct EntryHandle<T> {
    inner: Arc<Mutex<SetInner<T>>>,
    index: usize,
    generation: u64,
}

impl<T> ActiveSet<T> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SetInner {
                slots: Vec::new(),
                free: Vec::new(),
                head: None,
                tail: None,
                len: 0,
            })),
        }
    }

    /// Appends a value, returning the handle that removes it.
    pub fn add_last(&self, value: T) -> EntryHandle<T> {
        let mut inner = lock(&self.inner);

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                inner.slots.len() - 1
            }
        };

        let prev_tail = inner.tail;
        inner.slots[index].entry = Some(Entry {
            value,
            prev: prev_tail,
            next: None,
        });
        if let Some(tail) = prev_tail {
            if let Some(entry) = inner.slots[tail].entry.as_mut() {
                entry.next = Some(index);
            }
        }
        inner.tail = Some(index);
        if inner.head.is_none() {
            inner.head = Some(index);
        }
        inner.len += 1;

        let generation = inner.slots[index].generation;
        EntryHandle {
            inner: Arc::clone(&self.inner),
            index,
            generation,
        }
    }

    /// Number of live elements.
    pub fn len(&self) -> usize {
        lock(&self.inner).len
    }

    /// Returns true if no elements are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> ActiveSet<T> {
    /// Clones the live values in insertion order.
    pub fn snapshot(&self) -> Vec<T> {
        let inner = lock(&self.inner);
        let mut out = Vec::with_capacity(inner.len);
        let mut cursor = inner.head;
        while let Some(index) = cursor {
            let Some(entry) = inner.slots[index].entry.as_ref() else {
                break;
            };
            out.push(entry.value.clone());
            cursor = entry.next;
        }
        out
    }
}

impl<T> Default for ActiveSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ActiveSet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for ActiveSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSet").field("len", &self.len()).finish()
    }
}

impl<T> EntryHandle<T> {
    /// Unlinks the element this handle was issued for.
    ///
    /// Returns true if the element was still present. Safe to call any
    /// number of times and concurrently with insertions and other removals.
    pub fn remove(&self) -> bool {
        let mut inner = lock(&self.inner);

        if inner.slots[self.index].generation != self.generation {
            return false;
        }
        let Some(entry) = inner.slots[self.index].entry.take() else {
            return false;
        };

        if let Some(prev) = entry.prev {
            if let Some(prev_entry) = inner.slots[prev].entry.as_mut() {
                prev_entry.next = entry.next;
            }
        } else {
            inner.head = entry.next;
        }
        if let Some(next) = entry.next {
            if let Some(next_entry) = inner.slots[next].entry.as_mut() {
                next_entry.prev = entry.prev;
            }
        } else {
            inner.tail = entry.prev;
        }

        inner.slots[self.index].generation += 1;
        inner.free.push(self.index);
        inner.len -= 1;
        true
    }
}

impl<T> std::fmt::Debug for EntryHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryHandle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

fn lock<T>(inner: &Arc<Mutex<SetInner<T>>>) -> std::sync::MutexGuard<'_, SetInner<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
