//! lapin error classification.

use lapin::protocol::{AMQPError, AMQPErrorKind, AMQPSoftError};
use mqkit_core::BrokerError;

/// Map a lapin failure onto the broker error set.
///
/// Channel-level AMQP exceptions arrive as protocol errors carrying the
/// broker's reply code.
pub(crate) fn broker_error(err: &lapin::Error) -> BrokerError {
    match err {
        lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed,
        lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
            BrokerError::ConnectionClosed
        }
        lapin::Error::ProtocolError(amqp) => classify(amqp),
        other => BrokerError::Protocol(other.to_string()),
    }
}

fn classify(err: &AMQPError) -> BrokerError {
    let message = err.to_string();
    match err.kind() {
        AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BrokerError::NotFound(message),
        AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
            BrokerError::PreconditionFailed(message)
        }
        AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => BrokerError::AccessRefused(message),
        AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED) => BrokerError::ResourceLocked(message),
        AMQPErrorKind::Soft(AMQPSoftError::NOROUTE | AMQPSoftError::NOCONSUMERS) => {
            BrokerError::Unroutable(message)
        }
        _ => BrokerError::Protocol(message),
    }
}
