use bytes::BytesMut;
use parking_lot::Mutex;

use std::sync::{Arc, Weak};

use crate::stream::{StreamReader, StreamReaderObserver, StreamWriter};
use crate::subscriptions::Subscription;

/// largest single message accepted before the peer is considered
/// broken.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

pub trait RudpMessagingObserver: Send + Sync {
    /// one complete message arrived.
    fn on_message(&self, messaging: &Arc<RudpMessaging>, message: &[u8]);
}

struct Inner {
    buffer: BytesMut,
    cancelled: bool,
    _sub: Option<Subscription>,
}

/// Message boundaries over a reliable byte stream.
///
/// Each message travels as a 32-bit big-endian length prefix followed
/// by its bytes; partial reads reassemble transparently, so observers
/// only ever see whole messages.
pub struct RudpMessaging {
    writer: StreamWriter,
    reader: StreamReader,
    observer: Arc<dyn RudpMessagingObserver>,
    inner: Mutex<Inner>,
}

struct ReaderBridge(Weak<RudpMessaging>);

impl StreamReaderObserver for ReaderBridge {
    fn on_reader_ready(&self) {
        if let Some(messaging) = self.0.upgrade() {
            messaging.pump();
        }
    }
}

impl RudpMessaging {
    /// wrap a channel's stream endpoints: `writer` feeds the send
    /// side, `reader` drains the delivered side.
    pub fn create(
        writer: StreamWriter,
        reader: StreamReader,
        observer: Arc<dyn RudpMessagingObserver>,
    ) -> Arc<Self> {
        let messaging = Arc::new(Self {
            writer,
            reader,
            observer,
            inner: Mutex::new(Inner {
                buffer: BytesMut::new(),
                cancelled: false,
                _sub: None,
            }),
        });

        let sub = messaging
            .reader
            .subscribe(Arc::new(ReaderBridge(Arc::downgrade(&messaging))));
        messaging.inner.lock()._sub = Some(sub);
        messaging.reader.notify_ready_to_read();

        messaging
    }

    /// send one message, framed.
    pub fn send(&self, message: &[u8]) {
        if self.inner.lock().cancelled {
            return;
        }

        // block mode keeps the prefix and body in one frame.
        self.writer.block(true);
        self.writer.write(&(message.len() as u32).to_be_bytes());
        self.writer.write(message);
        self.writer.block(false);
    }

    pub fn cancel(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.cancelled {
                return;
            }

            inner.cancelled = true;
            inner.buffer.clear();
            inner._sub = None;
        }

        self.writer.cancel();
        self.reader.cancel();
    }

    fn pump(self: &Arc<Self>) {
        loop {
            let message = {
                let mut inner = self.inner.lock();
                if inner.cancelled {
                    return;
                }

                // pull whatever the stream has buffered.
                let available = self.reader.total_size_available();
                if available > 0 {
                    let start = inner.buffer.len();
                    inner.buffer.resize(start + available, 0);
                    let n = {
                        let slice = &mut inner.buffer[start..];
                        self.reader.read(slice)
                    };
                    inner.buffer.truncate(start + n);
                }

                if inner.buffer.len() < 4 {
                    return;
                }

                let size = u32::from_be_bytes(inner.buffer[..4].try_into().expect("prefix")) as usize;
                if size > MAX_MESSAGE_SIZE {
                    log::warn!("oversized message dropped: size={}", size);
                    inner.buffer.clear();
                    return;
                }

                if inner.buffer.len() < 4 + size {
                    return;
                }

                let _ = inner.buffer.split_to(4);
                inner.buffer.split_to(size)
            };

            self.observer.on_message(self, &message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::TransportStream;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct Sink(PlMutex<Vec<Vec<u8>>>);

    impl RudpMessagingObserver for Sink {
        fn on_message(&self, _: &Arc<RudpMessaging>, message: &[u8]) {
            self.0.lock().push(message.to_vec());
        }
    }

    #[test]
    fn messages_survive_arbitrary_chunking() {
        // the wire side: what the sender's messaging writes comes out
        // of `wire_reader`; feed it back in small chunks.
        let (wire_writer, wire_reader) = TransportStream::create();
        let (delivery_writer, delivery_reader) = TransportStream::create();

        let sink = Arc::new(Sink::default());
        let sender = RudpMessaging::create(
            wire_writer,
            TransportStream::create().1,
            Arc::new(Sink::default()),
        );
        let receiver = RudpMessaging::create(
            TransportStream::create().0,
            delivery_reader,
            sink.clone(),
        );

        sender.send(b"first message");
        sender.send(b"second");

        // trickle the framed bytes across one byte at a time.
        let mut byte = [0u8; 1];
        loop {
            let n = wire_reader.read(&mut byte);
            if n == 0 {
                break;
            }

            delivery_writer.write(&byte);
        }

        let _ = receiver;
        assert_eq!(
            sink.0.lock().as_slice(),
            &[b"first message".to_vec(), b"second".to_vec()]
        );
    }

    #[test]
    fn cancel_stops_delivery() {
        let (writer, reader) = TransportStream::create();
        let sink = Arc::new(Sink::default());
        let messaging = RudpMessaging::create(TransportStream::create().0, reader, sink.clone());

        messaging.cancel();
        writer.write(&8u32.to_be_bytes());
        writer.write(b"too late");

        assert!(sink.0.lock().is_empty());
    }
}
