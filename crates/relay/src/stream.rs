//! The per-connection notification stream.
//!
//! A stream yields `connected` once, then interleaves wake-ups from its
//! registry channel with a `ping` every `ping_interval`. It ends when the
//! registry drops the channel's sender (reaped, or the relay shutting down).
//! Dropping the stream drops its [`ConnectionGuard`], which deregisters the
//! channel immediately. Every frame handed to the reader is reported to the
//! guard so the reaper can tell a live reader from one that stopped polling.

use crate::registry::ConnectionGuard;
use futures_util::stream::{self, Stream, StreamExt};
use protocol::StreamMessage;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

struct StreamState {
    guard: ConnectionGuard,
    rx: mpsc::Receiver<StreamMessage>,
    ticker: Interval,
}

/// Build the message stream for one registered channel.
pub fn notification_stream(
    guard: ConnectionGuard,
    rx: mpsc::Receiver<StreamMessage>,
    ping_interval: Duration,
) -> impl Stream<Item = StreamMessage> + Send + 'static {
    let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = StreamState {
        guard,
        rx,
        ticker,
    };

    let messages = stream::unfold(state, |mut st| async move {
        let next = tokio::select! {
            msg = st.rx.recv() => msg,
            _ = st.ticker.tick() => Some(StreamMessage::Ping),
        };
        let msg = next?;
        st.guard.mark_read();
        Some((msg, st))
    });

    stream::iter([StreamMessage::Connected]).chain(messages)
}
