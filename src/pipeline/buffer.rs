//! Shared chunk log connecting a producer relay to its readers.
//!
//! A `ByteQueue` is append-only: readers never remove chunks. Snapshots
//! (`read_text`) see everything pushed so far, and a `ByteCursor` follows
//! the log from the start, waiting for new chunks until the producer closes
//! the queue. This lets the same queue serve as a captured output buffer and
//! as the stdin source of a downstream stage.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

#[derive(Default)]
struct State {
    chunks: Vec<Bytes>,
    opened: bool,
    closed: bool,
    detached: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    // Critical sections are Vec pushes and clones; a poisoned lock still holds
    // valid chunks, so recover it instead of propagating the panic.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Append-only byte chunk queue, shared by cloning.
#[derive(Clone, Default)]
pub struct ByteQueue {
    shared: Arc<Shared>,
}

impl ByteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Empty chunks and pushes after `close` are ignored.
    pub fn push(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        {
            let mut state = self.shared.lock();
            if state.closed {
                return;
            }
            state.chunks.push(chunk);
        }
        self.shared.notify.notify_waiters();
    }

    /// Record that the producer has been started
    pub fn open(&self) {
        self.shared.lock().opened = true;
    }

    pub fn is_opened(&self) -> bool {
        self.shared.lock().opened
    }

    /// Mark the producer as finished. Cursors drain what is left, then end.
    pub fn close(&self) {
        {
            let mut state = self.shared.lock();
            state.opened = true;
            state.closed = true;
        }
        self.shared.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Record that the consuming stage is gone. The producer's relay stops
    /// reading so the process sees a broken pipe on its next write.
    pub fn detach_reader(&self) {
        self.shared.lock().detached = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_reader_detached(&self) -> bool {
        self.shared.lock().detached
    }

    /// Resolves once `detach_reader` has been called
    pub async fn reader_detached(&self) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_reader_detached() {
                return;
            }
            notified.await;
        }
    }

    /// Number of chunks pushed so far
    pub fn len(&self) -> usize {
        self.shared.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenation of every chunk pushed so far
    pub fn snapshot(&self) -> Bytes {
        let state = self.shared.lock();
        let total = state.chunks.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for chunk in &state.chunks {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }

    /// Lossy UTF-8 decoding of `snapshot`
    pub fn read_text(&self) -> String {
        String::from_utf8_lossy(&self.snapshot()).into_owned()
    }

    /// A reader that follows this queue from its first chunk
    pub fn cursor(&self) -> ByteCursor {
        ByteCursor {
            shared: self.shared.clone(),
            position: 0,
        }
    }

    /// True when both handles refer to the same underlying queue
    pub fn same_queue(&self, other: &ByteQueue) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for ByteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("ByteQueue")
            .field("chunks", &state.chunks.len())
            .field("closed", &state.closed)
            .field("detached", &state.detached)
            .finish()
    }
}

/// Independent read position over a `ByteQueue`.
pub struct ByteCursor {
    shared: Arc<Shared>,
    position: usize,
}

impl ByteCursor {
    /// Next chunk in push order, or `None` once the queue is closed and every
    /// chunk has been seen.
    pub async fn next(&mut self) -> Option<Bytes> {
        loop {
            // Register interest before checking so a push between the check
            // and the await is not missed.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.shared.lock();
                if let Some(chunk) = state.chunks.get(self.position) {
                    self.position += 1;
                    return Some(chunk.clone());
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_snapshot_is_non_destructive() {
        let queue = ByteQueue::new();
        assert_eq!(queue.read_text(), "");

        queue.push(Bytes::from_static(b"hello "));
        queue.push(Bytes::from_static(b"world"));
        queue.push(Bytes::new());

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.read_text(), "hello world");
        assert_eq!(queue.read_text(), "hello world");
    }

    #[test]
    fn test_push_after_close_is_ignored() {
        let queue = ByteQueue::new();
        queue.push(Bytes::from_static(b"a"));
        queue.close();
        queue.push(Bytes::from_static(b"b"));

        assert!(queue.is_closed());
        assert!(queue.is_opened());
        assert_eq!(queue.read_text(), "a");
    }

    #[test]
    fn test_clones_share_state() {
        let queue = ByteQueue::new();
        let other = queue.clone();
        other.push(Bytes::from_static(b"x"));

        assert!(queue.same_queue(&other));
        assert!(!queue.same_queue(&ByteQueue::new()));
        assert_eq!(queue.read_text(), "x");
    }

    #[tokio::test]
    async fn test_detach_reader_wakes_waiter() {
        let queue = ByteQueue::new();
        let waiter = queue.clone();
        let handle = tokio::spawn(async move { waiter.reader_detached().await });

        queue.push(Bytes::from_static(b"still attached"));
        assert!(!queue.is_reader_detached());
        queue.detach_reader();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter missed detach")
            .unwrap();
        assert!(queue.is_reader_detached());
        // Already detached resolves immediately.
        queue.reader_detached().await;
    }

    #[tokio::test]
    async fn test_cursor_drains_then_ends() {
        let queue = ByteQueue::new();
        queue.push(Bytes::from_static(b"1"));
        queue.push(Bytes::from_static(b"2"));
        queue.close();

        let mut cursor = queue.cursor();
        assert_eq!(cursor.next().await, Some(Bytes::from_static(b"1")));
        assert_eq!(cursor.next().await, Some(Bytes::from_static(b"2")));
        assert_eq!(cursor.next().await, None);

        // A second cursor replays from the start.
        let mut replay = queue.cursor();
        assert_eq!(replay.next().await, Some(Bytes::from_static(b"1")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cursor_waits_for_producer() {
        let queue = ByteQueue::new();
        let producer = queue.clone();

        let reader = tokio::spawn(async move {
            let mut cursor = queue.cursor();
            let mut seen = Vec::new();
            while let Some(chunk) = cursor.next().await {
                seen.push(chunk);
            }
            seen
        });

        for i in 0..50u8 {
            producer.push(Bytes::from(vec![i]));
            if i % 10 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        producer.close();

        let seen = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("cursor did not observe close")
            .unwrap();
        let bytes: Vec<u8> = seen.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(bytes, (0..50u8).collect::<Vec<_>>());
    }
}
