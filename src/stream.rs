use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::subscriptions::{Subscription, Subscriptions};

/// Opaque per-buffer tag a writer can attach; surfaced to the reader
/// at the boundary where the buffer's first byte is delivered.
pub type StreamHeader = Arc<dyn Any + Send + Sync>;

/// Readiness events from the reader half.
pub trait StreamReaderObserver: Send + Sync {
    /// data became available after the queue was empty.
    fn on_reader_ready(&self);
}

/// Readiness events from the writer half.
pub trait StreamWriterObserver: Send + Sync {
    /// a reader signalled it is ready to consume.
    fn on_writer_ready(&self);
}

struct Buffer {
    bytes: Bytes,
    header: Option<StreamHeader>,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<Buffer>,
    /// pending block-mode accumulation, flushed as one frame.
    blocked: Option<BytesMut>,
    blocked_header: Option<StreamHeader>,
    /// the reader called `notify_ready_to_read` at least once.
    reader_ready: bool,
    /// writer-ready already edge-fired for the current readiness.
    writer_ready_fired: bool,
    cancelled: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    reader_subs: Subscriptions<dyn StreamReaderObserver>,
    writer_subs: Subscriptions<dyn StreamWriterObserver>,
}

impl Shared {
    fn fire(&self, reader: bool, writer: bool) {
        if reader {
            self.reader_subs.for_each(|o| o.on_reader_ready());
        }

        if writer {
            self.writer_subs.for_each(|o| o.on_writer_ready());
        }
    }
}

/// An in-process framed byte pipe.
///
/// A stream is an ordered queue of buffers shared by exactly one
/// writer and one reader endpoint; writers append, readers consume
/// from the front, and both sides learn about readiness through
/// edge-triggered observer callbacks rather than polling.
pub struct TransportStream;

impl TransportStream {
    pub fn create() -> (StreamWriter, StreamReader) {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            reader_subs: Subscriptions::default(),
            writer_subs: Subscriptions::default(),
        });

        (
            StreamWriter {
                shared: shared.clone(),
            },
            StreamReader { shared },
        )
    }
}

#[derive(Clone)]
pub struct StreamWriter {
    shared: Arc<Shared>,
}

impl StreamWriter {
    pub fn write(&self, bytes: &[u8]) {
        self.write_internal(bytes, None)
    }

    pub fn write_with_header(&self, bytes: &[u8], header: StreamHeader) {
        self.write_internal(bytes, Some(header))
    }

    fn write_internal(&self, bytes: &[u8], header: Option<StreamHeader>) {
        let mut fire_reader = false;
        {
            let mut inner = self.shared.inner.lock();
            if inner.cancelled || bytes.is_empty() {
                return;
            }

            if let Some(blocked) = inner.blocked.as_mut() {
                blocked.extend_from_slice(bytes);
                if inner.blocked_header.is_none() {
                    inner.blocked_header = header;
                }
            } else {
                let was_empty = inner.queue.is_empty();
                inner.queue.push_back(Buffer {
                    bytes: Bytes::copy_from_slice(bytes),
                    header,
                });

                fire_reader = was_empty && inner.reader_ready;
            }
        }

        self.shared.fire(fire_reader, false);
    }

    /// enter or leave block mode.
    ///
    /// While blocked, writes accumulate into a single logical frame;
    /// leaving block mode flushes the frame to the reader.
    pub fn block(&self, block: bool) {
        let mut fire_reader = false;
        {
            let mut inner = self.shared.inner.lock();
            if inner.cancelled {
                return;
            }

            if block {
                if inner.blocked.is_none() {
                    inner.blocked = Some(BytesMut::new());
                }
            } else if let Some(pending) = inner.blocked.take() {
                let header = inner.blocked_header.take();
                if !pending.is_empty() {
                    let was_empty = inner.queue.is_empty();
                    inner.queue.push_back(Buffer {
                        bytes: pending.freeze(),
                        header,
                    });

                    fire_reader = was_empty && inner.reader_ready;
                }
            }
        }

        self.shared.fire(fire_reader, false);
    }

    pub fn subscribe(&self, observer: Arc<dyn StreamWriterObserver>) -> Subscription {
        let fire = {
            let inner = self.shared.inner.lock();
            inner.reader_ready && !inner.cancelled
        };

        let subscription = self.shared.writer_subs.subscribe(observer);
        // a late subscriber still learns about the current readiness.
        if fire {
            self.shared.fire(false, true);
        }

        subscription
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.inner.lock().cancelled
    }

    pub fn cancel(&self) {
        cancel(&self.shared);
    }
}

#[derive(Clone)]
pub struct StreamReader {
    shared: Arc<Shared>,
}

impl StreamReader {
    /// announce readiness to consume.
    ///
    /// This is what arms both edges: the writer side fires
    /// `on_writer_ready` once per readiness transition, and queued data
    /// is announced through `on_reader_ready`.
    pub fn notify_ready_to_read(&self) {
        let (fire_reader, fire_writer) = {
            let mut inner = self.shared.inner.lock();
            if inner.cancelled {
                return;
            }

            inner.reader_ready = true;
            let fire_writer = !inner.writer_ready_fired;
            inner.writer_ready_fired = true;

            (!inner.queue.is_empty(), fire_writer)
        };

        self.shared.fire(fire_reader, fire_writer);
    }

    /// consume up to `out.len()` bytes across buffer boundaries.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let mut inner = self.shared.inner.lock();
        let mut copied = 0;

        while copied < out.len() {
            let Some(front) = inner.queue.front_mut() else {
                break;
            };

            let take = (out.len() - copied).min(front.bytes.len());
            out[copied..copied + take].copy_from_slice(&front.bytes[..take]);
            copied += take;

            if take == front.bytes.len() {
                inner.queue.pop_front();
            } else {
                let _ = front.bytes.split_to(take);
            }
        }

        copied
    }

    /// consume bytes of the frontmost buffer only, surfacing its
    /// header.  The read never crosses a buffer boundary so the header
    /// always belongs to every byte returned.
    pub fn read_next_with_header(&self, out: &mut [u8]) -> (usize, Option<StreamHeader>) {
        let mut inner = self.shared.inner.lock();
        let Some(front) = inner.queue.front_mut() else {
            return (0, None);
        };

        let header = front.header.take();
        let take = out.len().min(front.bytes.len());
        out[..take].copy_from_slice(&front.bytes[..take]);

        if take == front.bytes.len() {
            inner.queue.pop_front();
        } else {
            let _ = front.bytes.split_to(take);
        }

        (take, header)
    }

    /// non-destructive read starting `offset` bytes in.
    pub fn peek(&self, out: &mut [u8], offset: usize) -> usize {
        let inner = self.shared.inner.lock();
        let mut skipped = 0;
        let mut copied = 0;

        for buffer in inner.queue.iter() {
            let mut start = 0;
            if skipped < offset {
                let skip = (offset - skipped).min(buffer.bytes.len());
                skipped += skip;
                start = skip;
                if start == buffer.bytes.len() {
                    continue;
                }
            }

            let take = (out.len() - copied).min(buffer.bytes.len() - start);
            out[copied..copied + take].copy_from_slice(&buffer.bytes[start..start + take]);
            copied += take;

            if copied == out.len() {
                break;
            }
        }

        copied
    }

    pub fn total_size_available(&self) -> usize {
        self.shared
            .inner
            .lock()
            .queue
            .iter()
            .map(|b| b.bytes.len())
            .sum()
    }

    pub fn total_buffers_available(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    pub fn subscribe(&self, observer: Arc<dyn StreamReaderObserver>) -> Subscription {
        self.shared.reader_subs.subscribe(observer)
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.inner.lock().cancelled
    }

    pub fn cancel(&self) {
        cancel(&self.shared);
    }
}

fn cancel(shared: &Shared) {
    {
        let mut inner = shared.inner.lock();
        if inner.cancelled {
            return;
        }

        inner.cancelled = true;
        inner.queue.clear();
        inner.blocked = None;
        inner.blocked_header = None;
    }

    shared.reader_subs.clear();
    shared.writer_subs.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl StreamReaderObserver for Counter {
        fn on_reader_ready(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl StreamWriterObserver for Counter {
        fn on_writer_ready(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn bytes_survive_any_read_split() {
        let (writer, reader) = TransportStream::create();
        writer.write(b"hello ");
        writer.write(b"transport ");
        writer.write(b"stream");

        let mut collected = Vec::new();
        for chunk in [1usize, 4, 7, 64] {
            let mut buf = vec![0u8; chunk];
            let n = reader.read(&mut buf);
            collected.extend_from_slice(&buf[..n]);
        }

        assert_eq!(&collected, b"hello transport stream");
        assert_eq!(reader.total_size_available(), 0);
    }

    #[test]
    fn reader_ready_fires_on_empty_to_nonempty_edges() {
        let (writer, reader) = TransportStream::create();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let _sub = reader.subscribe(counter.clone());

        // not signalled ready yet: no event.
        writer.write(b"a");
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        reader.notify_ready_to_read();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        // queue stays non-empty: additional writes are silent.
        writer.write(b"b");
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf), 2);

        // drained and refilled: one more edge.
        writer.write(b"c");
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn writer_ready_fires_once_per_transition() {
        let (writer, reader) = TransportStream::create();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let _sub = writer.subscribe(counter.clone());

        reader.notify_ready_to_read();
        reader.notify_ready_to_read();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn block_mode_collapses_writes_into_one_frame() {
        let (writer, reader) = TransportStream::create();
        writer.block(true);
        writer.write(b"one");
        writer.write(b"two");
        writer.block(false);

        assert_eq!(reader.total_buffers_available(), 1);

        let mut buf = [0u8; 16];
        let (n, _) = reader.read_next_with_header(&mut buf);
        assert_eq!(&buf[..n], b"onetwo");
    }

    #[test]
    fn header_surfaces_with_its_first_byte() {
        let (writer, reader) = TransportStream::create();
        writer.write_with_header(b"tagged", Arc::new(7u32));
        writer.write(b"plain");

        let mut buf = [0u8; 3];
        let (n, header) = reader.read_next_with_header(&mut buf);
        assert_eq!(n, 3);
        let header = header.expect("header on first byte");
        assert_eq!(*header.downcast_ref::<u32>().unwrap(), 7);

        // remainder of the same buffer no longer carries the header.
        let (n, header) = reader.read_next_with_header(&mut buf);
        assert_eq!(n, 3);
        assert!(header.is_none());
    }

    #[test]
    fn peek_is_non_destructive() {
        let (writer, reader) = TransportStream::create();
        writer.write(b"abcdef");

        let mut buf = [0u8; 3];
        assert_eq!(reader.peek(&mut buf, 2), 3);
        assert_eq!(&buf, b"cde");
        assert_eq!(reader.total_size_available(), 6);
    }

    #[test]
    fn cancel_makes_all_operations_noops() {
        let (writer, reader) = TransportStream::create();
        writer.write(b"data");
        reader.cancel();

        writer.write(b"more");
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf), 0);
        assert!(writer.is_cancelled());
    }
}
