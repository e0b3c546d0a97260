mod messaging;
mod packet;
mod stream;
mod transport;

pub use messaging::{RudpMessaging, RudpMessagingObserver};
pub use packet::{
    HEADER_SIZE, MAX_PAYLOAD, MAX_VECTOR, RudpFlags, RudpPacket, decode_vector, encode_vector,
    extend_sequence,
};
pub use stream::{
    RudpChannelStream, RudpStreamObserver, RudpStreamOptions, RudpStreamState,
};
pub use transport::{
    ChannelStreams, RUDP_CHANNEL_RANGE, RudpChannel, RudpChannelState, RudpTransport,
    RudpTransportObserver, RudpTransportState,
};

/// RUDP protocol failures.
///
/// `IllegalAck` is deliberately survivable: the stream drops the
/// offending ACK and keeps the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RudpError {
    IllegalPacket,
    IllegalAck,
}

impl std::fmt::Display for RudpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for RudpError {}
