use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::{self, Rc},
    sync::Arc,
    task::{Wake, Waker},
};

use crate::executor::ExecutorShared;

pub(crate) type LocalTask = Pin<Box<dyn Future<Output = ()> + 'static>>;

pub(crate) struct TaskEntry {
    pub(crate) future: LocalTask,
    pub(crate) waker: Waker,
}

impl TaskEntry {
    pub(crate) fn new(future: LocalTask, executor_shared: Arc<ExecutorShared>, task_index: usize) -> Self {
        let waker = Waker::from(Arc::new(TaskWaker {
            executor_shared,
            task_index,
        }));
        TaskEntry { future, waker }
    }
}

struct TaskWaker {
    executor_shared: Arc<ExecutorShared>,
    task_index: usize,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.executor_shared.schedule_task(self.task_index);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.executor_shared.schedule_task(self.task_index);
    }
}

/// Tasks spawned while the executor is busy polling; admitted on its next pass.
#[derive(Default)]
pub(crate) struct NewTasks {
    tasks: RefCell<Vec<LocalTask>>,
}

impl NewTasks {
    pub(crate) fn take(&self) -> Vec<LocalTask> {
        std::mem::take(&mut *self.tasks.borrow_mut())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }
}

/// Handle for spawning onto an executor from inside its own tasks and
/// microtasks. Holds the executor weakly.
#[derive(Clone)]
pub(crate) struct Spawner {
    pub(crate) inner: rc::Weak<NewTasks>,
}

impl Spawner {
    /// Returns false once the executor is gone.
    pub(crate) fn spawn(&self, future: impl Future<Output = ()> + 'static) -> bool {
        match self.inner.upgrade() {
            Some(new_tasks) => {
                new_tasks.tasks.borrow_mut().push(Box::pin(future));
                true
            }
            None => false,
        }
    }
}

pub(crate) fn new_tasks() -> Rc<NewTasks> {
    Rc::new(NewTasks::default())
}

const BITS: usize = u64::BITS as usize;

fn split(task_index: usize) -> (usize, u64) {
    (task_index / BITS, 1u64 << (task_index % BITS))
}

/// Set of task indices waiting for a poll.
///
/// Stays a single word while every live index is below 64.
pub(crate) enum ReadyQueue {
    Small(u64),
    Chunked { words: Vec<u64>, len: usize },
}

impl ReadyQueue {
    pub fn new() -> Self {
        ReadyQueue::Small(0)
    }

    pub fn push(&mut self, task_index: usize) {
        let (word, bit) = split(task_index);
        if let ReadyQueue::Small(map) = self {
            if word == 0 {
                *map |= bit;
                return;
            }
            let len = map.count_ones() as usize;
            let mut words = vec![0; word + 1];
            words[0] = *map;
            *self = ReadyQueue::Chunked { words, len };
        }
        if let ReadyQueue::Chunked { words, len } = self {
            if word >= words.len() {
                words.resize(word + 1, 0);
            }
            if words[word] & bit == 0 {
                words[word] |= bit;
                *len += 1;
            }
        }
    }

    #[cfg(test)]
    pub fn pop(&mut self) -> Option<usize> {
        let words: &mut [u64] = match self {
            ReadyQueue::Small(map) => std::slice::from_mut(map),
            ReadyQueue::Chunked { words, .. } => words,
        };
        let (word, map) = words.iter_mut().enumerate().find(|(_, map)| **map != 0)?;
        let offset = map.trailing_zeros() as usize;
        *map &= *map - 1;
        if let ReadyQueue::Chunked { len, .. } = self {
            *len -= 1;
        }
        Some(word * BITS + offset)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ReadyQueue::Small(map) => *map == 0,
            ReadyQueue::Chunked { len, .. } => *len == 0,
        }
    }

    /// Take one non-empty word, starting after `last_chunk_index` so that low
    /// indices cannot starve high ones.
    pub fn take_chunk(&mut self, last_chunk_index: Option<usize>) -> BitmapIter {
        match self {
            ReadyQueue::Small(map) => BitmapIter {
                bitmap: std::mem::take(map),
                chunk_index: 0,
            },
            ReadyQueue::Chunked { words, len } => {
                let count = words.len();
                let first = last_chunk_index.map_or(0, |last| (last + 1) % count);
                let found = (0..count)
                    .map(|step| (first + step) % count)
                    .find(|&index| words[index] != 0);
                match found {
                    Some(chunk_index) => {
                        let bitmap = std::mem::take(&mut words[chunk_index]);
                        *len -= bitmap.count_ones() as usize;
                        BitmapIter { bitmap, chunk_index }
                    }
                    None => BitmapIter {
                        bitmap: 0,
                        chunk_index: 0,
                    },
                }
            }
        }
    }
}

/// Indices set in one word of a [`ReadyQueue`], lowest first.
pub(crate) struct BitmapIter {
    bitmap: u64,
    pub(crate) chunk_index: usize,
}

impl Iterator for BitmapIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.bitmap == 0 {
            return None;
        }
        let offset = self.bitmap.trailing_zeros() as usize;
        self.bitmap &= self.bitmap - 1;
        Some(self.chunk_index * BITS + offset)
    }
}
