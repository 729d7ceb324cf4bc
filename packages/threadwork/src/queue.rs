//! Intrusive FIFO of queued tasks whose nodes live in [`FastAlloc`] blocks.

use std::any::type_name;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::{Block, FastAlloc, QueuedTask, Result};

/// One queue entry, stored in a block of the pool's node allocator.
pub(crate) struct TaskNode {
    task: Arc<dyn QueuedTask>,
    next: Option<NonNull<TaskNode>>,

    /// The block this node lives in, needed to give the memory back.
    block: Block,
}

/// Exclusive ownership of an initialized [`TaskNode`] that is not linked into any queue.
///
/// Nodes are prepared and released outside the pool lock so that only the pointer juggling
/// happens while the lock is held.
#[must_use]
pub(crate) struct DetachedNode {
    ptr: NonNull<TaskNode>,
}

// SAFETY: The node is exclusively owned through this value and its contents (an Arc to a
// Send + Sync task and a Block) may move between threads.
unsafe impl Send for DetachedNode {}

impl DetachedNode {
    /// Allocates a node for `task` from `nodes`.
    pub(crate) fn new(nodes: &FastAlloc, task: Arc<dyn QueuedTask>) -> Result<Self> {
        let block = nodes.allocate()?;
        let ptr = block.as_ptr().cast::<TaskNode>();

        debug_assert!(nodes.block_layout().size() >= size_of::<TaskNode>());
        debug_assert!(nodes.block_layout().align() >= align_of::<TaskNode>());

        // SAFETY: The allocator hands out blocks sized and aligned for TaskNode, and the block
        // is exclusively ours until freed.
        unsafe {
            ptr.write(TaskNode {
                task,
                next: None,
                block,
            });
        }

        Ok(Self { ptr })
    }

    /// Destroys the node, returns its block to `nodes` and yields the task it carried.
    pub(crate) fn into_task(self, nodes: &FastAlloc) -> Arc<dyn QueuedTask> {
        // SAFETY: The node was initialized in new() and we are its only owner. Reading it out
        // leaves the memory logically uninitialized, which is fine as we free it right away.
        let TaskNode { task, block, .. } = unsafe { self.ptr.read() };

        nodes.free(block);
        task
    }
}

/// First-in first-out list of task nodes.
///
/// The queue stores links only; node memory is owned by the pool's node allocator and moved in
/// and out of the queue as [`DetachedNode`]s.
pub(crate) struct TaskQueue {
    head: Option<NonNull<TaskNode>>,
    tail: Option<NonNull<TaskNode>>,
    len: usize,
}

// SAFETY: The queue exclusively owns every node linked into it. Nodes are only touched through
// `&mut TaskQueue` and their contents are Send.
unsafe impl Send for TaskQueue {}

// SAFETY: Shared references only expose the length.
unsafe impl Sync for TaskQueue {}

impl TaskQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn push_back(&mut self, node: DetachedNode) {
        let ptr = node.ptr;

        // SAFETY: The detached node is ours and not linked anywhere else.
        unsafe {
            (*ptr.as_ptr()).next = None;
        }

        match self.tail {
            // SAFETY: The tail is a live node owned by this queue.
            Some(tail) => unsafe {
                (*tail.as_ptr()).next = Some(ptr);
            },
            None => self.head = Some(ptr),
        }

        self.tail = Some(ptr);
        self.len = self.len.wrapping_add(1);
    }

    pub(crate) fn pop_front(&mut self) -> Option<DetachedNode> {
        let head = self.head?;

        // SAFETY: The head is a live node owned by this queue.
        let next = unsafe { (*head.as_ptr()).next.take() };

        self.head = next;
        if next.is_none() {
            self.tail = None;
        }

        self.len = self.len.wrapping_sub(1);
        Some(DetachedNode { ptr: head })
    }

    /// Unlinks the node carrying the task at address `task_addr`, if it is queued.
    pub(crate) fn remove(&mut self, task_addr: usize) -> Option<DetachedNode> {
        let mut previous: Option<NonNull<TaskNode>> = None;
        let mut current = self.head;

        while let Some(node) = current {
            // SAFETY: Every node reachable from the head is live and owned by this queue.
            let (next, current_addr) = unsafe {
                let node = node.as_ref();
                (node.next, Arc::as_ptr(&node.task).cast::<()>().addr())
            };

            if current_addr == task_addr {
                match previous {
                    // SAFETY: As above.
                    Some(previous) => unsafe {
                        (*previous.as_ptr()).next = next;
                    },
                    None => self.head = next,
                }

                if self.tail == Some(node) {
                    self.tail = previous;
                }

                // SAFETY: As above; the node is now unlinked and handed out.
                unsafe {
                    (*node.as_ptr()).next = None;
                }

                self.len = self.len.wrapping_sub(1);
                return Some(DetachedNode { ptr: node });
            }

            previous = Some(node);
            current = next;
        }

        None
    }

    /// Unlinks every queued node, oldest first.
    pub(crate) fn take_all(&mut self) -> Vec<DetachedNode> {
        let mut nodes = Vec::with_capacity(self.len);

        while let Some(node) = self.pop_front() {
            nodes.push(node);
        }

        nodes
    }
}

impl fmt::Debug for TaskQueue {
    #[cfg_attr(test, mutants::skip)] // We have no API contract for this.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        // The pool empties the queue during shutdown. Anything left here would leak its node
        // block and the task it refers to.
        debug_assert!(
            self.is_empty(),
            "task queue dropped with {} nodes still linked",
            self.len
        );
    }
}
