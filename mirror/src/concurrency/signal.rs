//! Signaling primitives for worker coordination.
//!
//! Wraps tokio's watch channels into signal types that carry no payload. All receivers observe the
//! same signal, which makes them suitable for waking the running loop of a mirror whenever a
//! snapshot worker made progress.

use tokio::sync::watch;

/// Transmitter side of a coordination signal channel.
pub type SignalTx = watch::Sender<()>;

/// Receiver side of a coordination signal channel.
pub type SignalRx = watch::Receiver<()>;

/// Creates a new coordination signal channel.
///
/// The channel starts unsignaled: [`watch::Receiver::changed`] resolves only after the first
/// [`watch::Sender::send`].
pub fn create_signal() -> (SignalTx, SignalRx) {
    let (tx, rx) = watch::channel(());
    (tx, rx)
}
