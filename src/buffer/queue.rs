//! Chunk queue with partial consumption
//!
//! A singly linked FIFO whose nodes live in an arena and link to each other
//! by index. Freed slots are recycled, so a long-running stream does not grow
//! the arena beyond its peak buffered chunk count.
//!
//! The queue only tracks its node count. The owning stream keeps the total
//! buffered length.

use bytes::{BufMut, Bytes, BytesMut};

use crate::chunk::Chunk;

#[derive(Debug)]
struct Node {
    chunk: Chunk,
    next: Option<usize>,
}

/// FIFO of chunks supporting partial reads across node boundaries
#[derive(Debug, Default)]
pub struct ChunkQueue {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl ChunkQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued chunks
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the queue holds no chunks
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn alloc(&mut self, chunk: Chunk, next: Option<usize>) -> usize {
        let node = Some(Node { chunk, next });
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = node;
                index
            }
            None => {
                self.slots.push(node);
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, index: usize) -> Option<Node> {
        let node = self.slots.get_mut(index)?.take()?;
        self.free.push(index);
        Some(node)
    }

    fn node(&self, index: usize) -> Option<&Node> {
        self.slots.get(index)?.as_ref()
    }

    fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// Append a chunk at the tail
    pub fn push(&mut self, chunk: Chunk) {
        let index = self.alloc(chunk, None);
        match self.tail.and_then(|tail| self.node_mut(tail)) {
            Some(tail) => tail.next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    /// Insert a chunk at the head
    pub fn unshift(&mut self, chunk: Chunk) {
        let index = self.alloc(chunk, self.head);
        if self.head.is_none() {
            self.tail = Some(index);
        }
        self.head = Some(index);
        self.len += 1;
    }

    /// Remove and return the head chunk
    pub fn shift(&mut self) -> Option<Chunk> {
        let head = self.head?;
        let node = self.release(head)?;
        self.head = node.next;
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(node.chunk)
    }

    /// Peek at the head chunk
    pub fn first(&self) -> Option<&Chunk> {
        self.head.and_then(|head| self.node(head)).map(|node| &node.chunk)
    }

    /// Drop every chunk
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    /// Iterate over queued chunks from head to tail
    pub fn iter(&self) -> impl Iterator<Item = &Chunk> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.node(cursor?)?;
            cursor = node.next;
            Some(&node.chunk)
        })
    }

    /// Copy the first `n` bytes without consuming anything
    ///
    /// `n` is expected to be at most the total buffered length; a shorter
    /// result is returned otherwise.
    pub fn concat(&self, n: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(n);
        for chunk in self.iter() {
            let remaining = n - out.len();
            if remaining == 0 {
                break;
            }
            let bytes = chunk.as_bytes().unwrap_or_default();
            out.put_slice(&bytes[..remaining.min(bytes.len())]);
        }
        out.freeze()
    }

    /// Remove and return the first `n` units
    ///
    /// Splits the head chunk when `n` is shorter than it and gathers bytes
    /// from several nodes when `n` is longer.
    pub fn consume(&mut self, n: usize) -> Option<Chunk> {
        let head = self.head?;
        let head_len = self.node(head)?.chunk.len();
        if n < head_len {
            let node = self.node_mut(head)?;
            Some(node.chunk.split_to(n))
        } else if n == head_len {
            self.shift()
        } else {
            Some(Chunk::Bytes(self.copy_bytes(n)))
        }
    }

    fn copy_bytes(&mut self, n: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        let mut consumed = 0;
        let mut cursor = self.head;

        while let Some(index) = cursor {
            let Some(node) = self.node_mut(index) else {
                break;
            };
            let len = node.chunk.len();
            if remaining > len {
                out.put_slice(node.chunk.as_bytes().unwrap_or_default());
                remaining -= len;
                cursor = node.next;
                self.release(index);
                consumed += 1;
                continue;
            }

            let prefix = node.chunk.split_to(remaining);
            out.put_slice(prefix.as_bytes().unwrap_or_default());
            if remaining == len {
                cursor = node.next;
                self.release(index);
                consumed += 1;
            }
            break;
        }

        self.head = cursor;
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= consumed;
        out.freeze()
    }
}
