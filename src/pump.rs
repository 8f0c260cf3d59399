//! Turns the increment channel into discrete, rate-limited events.
//!
//! The event loop calls [`StreamPump::next_event`] once per event; that call
//! is the only place the loop waits while a reply is streaming. Increments are
//! buffered and released at most once per flush interval, in arrival order.
//! Cancellation wins over everything and discards whatever is buffered.

use crate::api::IncrementReceiver;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEvent {
    /// One or more increments, concatenated in order.
    Batch(String),
    /// No more assistant text for this turn.
    Finished,
}

pub struct StreamPump {
    increments: IncrementReceiver,
    cancel: CancellationToken,
    buffer: String,
    flush_interval: Duration,
    finished: bool,
}

impl StreamPump {
    pub fn new(increments: IncrementReceiver) -> Self {
        Self::with_flush_interval(increments, DEFAULT_FLUSH_INTERVAL)
    }

    pub fn with_flush_interval(increments: IncrementReceiver, flush_interval: Duration) -> Self {
        Self {
            increments,
            cancel: CancellationToken::new(),
            buffer: String::new(),
            flush_interval,
            finished: false,
        }
    }

    /// A handle that cancels this stream from elsewhere (e.g. a signal handler).
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Closes the cancellation signal. Calling it again does nothing.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            log::info!("Stream cancelled");
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Waits for the next batch or for the end of the stream.
    ///
    /// Once `Finished` has been returned every later call returns it again.
    pub async fn next_event(&mut self) -> PumpEvent {
        if self.finished {
            return PumpEvent::Finished;
        }

        let mut ticker = interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    if !self.buffer.is_empty() {
                        log::debug!("Dropping {} buffered bytes on cancel", self.buffer.len());
                    }
                    self.buffer.clear();
                    return self.finish();
                }
                increment = self.increments.recv() => match increment {
                    Some(text) => self.buffer.push_str(&text),
                    None if self.buffer.is_empty() => return self.finish(),
                    // Closed: hand over the tail now, `Finished` comes on the next call.
                    None => return PumpEvent::Batch(std::mem::take(&mut self.buffer)),
                },
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        return PumpEvent::Batch(std::mem::take(&mut self.buffer));
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> PumpEvent {
        self.finished = true;
        PumpEvent::Finished
    }
}
