//! Payload-less signaling between components.

use tokio::sync::watch;

/// Transmitter side of a signal channel.
pub type SignalTx = watch::Sender<()>;

/// Receiver side of a signal channel.
///
/// Receivers wait with [`watch::Receiver::changed`], every send wakes them once.
pub type SignalRx = watch::Receiver<()>;

/// Creates a new signal channel.
///
/// The initial value is marked as seen, so a receiver only wakes up on the first explicit
/// [`watch::Sender::send`].
pub fn create_signal() -> (SignalTx, SignalRx) {
    let (tx, rx) = watch::channel(());
    (tx, rx)
}
