use std::fmt;
use tokio::sync::watch;

/// What the running loop of a mirror is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopDirective {
    /// Keep applying batches.
    Run,
    /// Finish the in-flight batch, then stop and leave the mirror paused.
    Pause,
    /// Finish or abort the in-flight batch, then stop without touching the mirror state.
    Stop,
}

impl fmt::Display for LoopDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopDirective::Run => write!(f, "run"),
            LoopDirective::Pause => write!(f, "pause"),
            LoopDirective::Stop => write!(f, "stop"),
        }
    }
}

/// Transmitter side of the directive channel of a running loop.
///
/// A stop overrides a pause, a pause never overrides a stop.
#[derive(Debug, Clone)]
pub struct DirectiveTx(watch::Sender<LoopDirective>);

impl DirectiveTx {
    /// Wraps a watch sender into a [`DirectiveTx`].
    pub fn new(tx: watch::Sender<LoopDirective>) -> Self {
        Self(tx)
    }

    /// Asks the loop to pause at the next batch boundary.
    pub fn pause(&self) {
        // `send_if_modified` succeeds even when the loop already exited and dropped its receiver.
        self.0.send_if_modified(|directive| {
            if *directive == LoopDirective::Run {
                *directive = LoopDirective::Pause;
                return true;
            }

            false
        });
    }

    /// Asks the loop to stop at the next batch boundary.
    pub fn stop(&self) {
        self.0.send_replace(LoopDirective::Stop);
    }

    /// Returns the latest directive sent.
    pub fn current(&self) -> LoopDirective {
        *self.0.borrow()
    }

    /// Creates a new directive receiver subscription.
    pub fn subscribe(&self) -> DirectiveRx {
        self.0.subscribe()
    }
}

/// Receiver side of the directive channel of a running loop.
pub type DirectiveRx = watch::Receiver<LoopDirective>;

/// Creates a new directive channel starting at [`LoopDirective::Run`].
pub fn create_directive_channel() -> (DirectiveTx, DirectiveRx) {
    let (tx, rx) = watch::channel(LoopDirective::Run);
    (DirectiveTx::new(tx), rx)
}
