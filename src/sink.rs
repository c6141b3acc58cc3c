/// Event sink boundary
///
/// Receives one notification per detected double clap. Implementations
/// must return promptly: the call is made from the detection loop.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::error;

/// A completed double clap
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoubleClapEvent {
    /// Source time of the second clap
    pub timestamp: Duration,

    /// Time between the two claps
    pub gap: Duration,

    pub first_peak: f32,
    pub second_peak: f32,
}

#[cfg_attr(test, mockall::automock)]
pub trait EventSink {
    fn on_double_clap_detected(&mut self, event: &DoubleClapEvent);
}

/// Forwards events over an unbounded channel; never blocks
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DoubleClapEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<DoubleClapEvent>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end for the async side of the service
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DoubleClapEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl EventSink for ChannelSink {
    fn on_double_clap_detected(&mut self, event: &DoubleClapEvent) {
        if let Err(e) = self.tx.send(event.clone()) {
            error!("Failed to send double-clap event: {}", e);
        }
    }
}
