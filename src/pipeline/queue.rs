//! Arena-backed singly linked queue with stable handles.
//!
//! Values live in a slot arena and are addressed by generation-checked
//! [`NodeHandle`]s, so the manager can remember positions (the priority
//! boundary, a master request, the last request of an item) and splice new
//! entries after them in O(1). Removal only happens at the head.
//!
//! [`QueueCursor`] is an external iterator that does not borrow the queue.
//! After inserting right behind the cursor's current node, call
//! [`QueueCursor::update`] so the next advance visits the new entry instead
//! of skipping it.

use super::id::NodeHandle;

#[derive(Debug)]
struct Node<T> {
    value: T,
    next: Option<NodeHandle>,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

/// Ordered work queue
#[derive(Debug)]
pub struct OrderedQueue<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: Option<NodeHandle>,
    tail: Option<NodeHandle>,
    len: usize,
}

impl<T> Default for OrderedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OrderedQueue<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handle of the first entry
    #[inline]
    pub fn peek(&self) -> Option<NodeHandle> {
        self.head
    }

    /// Handle of the last entry
    #[inline]
    pub fn tail(&self) -> Option<NodeHandle> {
        self.tail
    }

    fn node(&self, handle: NodeHandle) -> Option<&Node<T>> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, handle: NodeHandle) -> Option<&mut Node<T>> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    /// Whether `handle` refers to an entry still in the queue
    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.node(handle).is_some()
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&T> {
        self.node(handle).map(|n| &n.value)
    }

    pub fn get_mut(&mut self, handle: NodeHandle) -> Option<&mut T> {
        self.node_mut(handle).map(|n| &mut n.value)
    }

    /// Successor of `handle`
    pub fn next_of(&self, handle: NodeHandle) -> Option<NodeHandle> {
        self.node(handle).and_then(|n| n.next)
    }

    fn alloc(&mut self, value: T, next: Option<NodeHandle>) -> NodeHandle {
        let node = Node { value, next };
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeHandle {
                    index,
                    generation: 0,
                }
            }
        };
        self.len += 1;
        handle
    }

    /// Insert at the end
    pub fn append(&mut self, value: T) -> NodeHandle {
        self.insert_after(None, value)
    }

    /// Insert at the front
    pub fn prepend(&mut self, value: T) -> NodeHandle {
        let handle = self.alloc(value, self.head);
        if self.head.is_none() {
            self.tail = Some(handle);
        }
        self.head = Some(handle);
        handle
    }

    /// Insert directly after `after`, or at the end when `after` is `None`
    /// or no longer in the queue.
    pub fn insert_after(&mut self, after: Option<NodeHandle>, value: T) -> NodeHandle {
        let after = after.filter(|h| self.contains(*h)).or(self.tail);

        let Some(after) = after else {
            let handle = self.alloc(value, None);
            self.head = Some(handle);
            self.tail = Some(handle);
            return handle;
        };

        let next = self.next_of(after);
        let handle = self.alloc(value, next);
        if let Some(node) = self.node_mut(after) {
            node.next = Some(handle);
        }
        if self.tail == Some(after) {
            self.tail = Some(handle);
        }
        handle
    }

    /// Remove and return the first entry
    pub fn pop(&mut self) -> Option<(NodeHandle, T)> {
        let handle = self.head?;
        let slot = &mut self.slots[handle.index()];
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        self.head = node.next;
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some((handle, node.value))
    }

    /// Iterate entries from head to tail
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            next: self.head,
        }
    }
}

/// Borrowing iterator over a queue
pub struct Iter<'a, T> {
    queue: &'a OrderedQueue<T>,
    next: Option<NodeHandle>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (NodeHandle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.next?;
        let node = self.queue.node(handle)?;
        self.next = node.next;
        Some((handle, &node.value))
    }
}

/// Remembered position in an [`OrderedQueue`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCursor {
    current: Option<NodeHandle>,
    next: Option<NodeHandle>,
    set: bool,
}

impl QueueCursor {
    /// Cursor positioned before the head
    pub fn new<T>(queue: &OrderedQueue<T>) -> Self {
        Self {
            current: None,
            next: queue.peek(),
            set: true,
        }
    }

    /// Reposition before the head of `queue`
    pub fn init<T>(&mut self, queue: &OrderedQueue<T>) {
        *self = Self::new(queue);
    }

    /// Step to the next entry. Returns false at the end.
    pub fn advance<T>(&mut self, queue: &OrderedQueue<T>) -> bool {
        match self.next.filter(|h| queue.contains(*h)) {
            Some(next) => {
                self.current = Some(next);
                self.next = queue.next_of(next);
                true
            }
            None => false,
        }
    }

    /// Current entry, if the cursor has been advanced onto one
    #[inline]
    pub fn current(&self) -> Option<NodeHandle> {
        self.current
    }

    /// Refresh the successor after an insertion behind the current entry
    pub fn update<T>(&mut self, queue: &OrderedQueue<T>) {
        if let Some(current) = self.current {
            self.next = queue.next_of(current);
        }
    }

    /// Return to the unset state
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.set
    }

    /// Whether both cursors stand on the same entry
    pub fn same_position(&self, other: &QueueCursor) -> bool {
        self.current == other.current
    }
}
