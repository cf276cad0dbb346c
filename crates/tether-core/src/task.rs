//! FIFO task queue consumed by the executor's worker thread.
//!
//! The queue itself is not synchronized; [`TaskExecutor`](crate::TaskExecutor)
//! wraps it in a mutex and pairs it with a condition variable.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of a queued task, unique per queue.
///
/// IDs are assigned in enqueue order, so they double as a diagnostic view of
/// the order in which the worker will run tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Get the raw u64 value of this task ID.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// A task together with its queue-assigned ID.
pub struct QueuedTask {
    id: TaskId,
    task: Task,
}

impl QueuedTask {
    /// The ID assigned when this task was enqueued.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Consume and run the task on the current thread.
    pub fn run(self) {
        (self.task)()
    }
}

impl fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedTask").field("id", &self.id).finish()
    }
}

/// An ordered queue of pending tasks.
///
/// Tasks come out in exactly the order they went in.
#[derive(Default)]
pub struct TaskQueue {
    tasks: VecDeque<QueuedTask>,
    next_id: u64,
}

impl TaskQueue {
    /// Create an empty task queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to the back of the queue.
    pub fn push(&mut self, task: Task) -> TaskId {
        self.next_id += 1;
        let id = TaskId(self.next_id);
        self.tasks.push_back(QueuedTask { id, task });
        id
    }

    /// Remove the oldest task, if any.
    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.tasks.pop_front()
    }

    /// Check if there are any pending tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Get the number of pending tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.tasks.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use parking_lot::Mutex;

    #[test]
    fn test_fifo_order() {
        let mut queue = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            queue.push(Box::new(move || order.lock().push(i)));
        }
        assert_eq!(queue.len(), 5);

        while let Some(task) = queue.pop() {
            task.run();
        }

        assert!(queue.is_empty());
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_ids_follow_enqueue_order() {
        let mut queue = TaskQueue::new();
        let first = queue.push(Box::new(|| {}));
        let second = queue.push(Box::new(|| {}));
        assert!(first < second);

        assert_eq!(queue.pop().map(|t| t.id()), Some(first));
        assert_eq!(queue.pop().map(|t| t.id()), Some(second));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
