//! Bounded per-viewer outbound queue.
//!
//! The budget is expressed in bytes (a multiple of the last keyframe
//! size). Policy:
//!
//! - A delta that does not fit is dropped, newest first.
//! - A keyframe is never dropped. If it does not fit, the whole backlog
//!   is discarded (the new keyframe supersedes it), the keyframe is
//!   queued over budget and the viewer is marked stalled.
//! - A delta is only accepted when it references the frame accepted
//!   just before it; after any drop the queue waits for a keyframe.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::stream::types::Frame;

/// Result of offering a frame to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The frame was withheld from this viewer.
    Dropped(DropReason),
    /// A keyframe was queued over budget; `entered` is true when this
    /// push started the stall.
    Stalled { entered: bool },
    /// The viewer stayed stalled for longer than the timeout.
    StallExpired,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No room left for another delta.
    QueueFull,
    /// The delta's reference was not delivered to this viewer.
    BrokenChain,
    /// Deltas are withheld until the resync keyframe arrives.
    AwaitingKeyframe,
}

#[derive(Debug)]
pub struct OutboundQueue {
    frames: VecDeque<Arc<Frame>>,
    queued_bytes: usize,
    /// Sequence of the newest frame accepted into the queue.
    last_accepted: Option<u64>,
    /// Sequence of the newest frame handed to the transport.
    last_sent: Option<u64>,
    awaiting_keyframe: bool,
    stalled_since: Option<Instant>,
    dropped: u64,
    closed: bool,
}

impl OutboundQueue {
    /// A new queue; delivery starts at the next keyframe.
    pub fn new() -> Self {
        Self {
            frames: VecDeque::new(),
            queued_bytes: 0,
            last_accepted: None,
            last_sent: None,
            awaiting_keyframe: true,
            stalled_since: None,
            dropped: 0,
            closed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled_since.is_some()
    }

    pub fn is_awaiting_keyframe(&self) -> bool {
        self.awaiting_keyframe
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn last_sent(&self) -> Option<u64> {
        self.last_sent
    }

    /// Offer `frame` under a byte `budget`.
    pub fn push(
        &mut self,
        frame: Arc<Frame>,
        budget: usize,
        stall_timeout: Duration,
        now: Instant,
    ) -> PushOutcome {
        if self.closed {
            return PushOutcome::Closed;
        }
        if self.stall_expired(stall_timeout, now) {
            return PushOutcome::StallExpired;
        }

        let len = frame.payload_len();
        let fits = self.frames.is_empty() || self.queued_bytes + len <= budget;

        match frame.reference() {
            None => {
                let mut outcome = PushOutcome::Queued;
                if !fits {
                    self.discard_backlog();
                    if self.stalled_since.is_none() {
                        self.stalled_since = Some(now);
                        outcome = PushOutcome::Stalled { entered: true };
                    } else {
                        outcome = PushOutcome::Stalled { entered: false };
                    }
                }
                self.awaiting_keyframe = false;
                self.accept(frame, len);
                outcome
            }
            Some(reference) => {
                let reason = if self.awaiting_keyframe {
                    Some(DropReason::AwaitingKeyframe)
                } else if self.last_accepted != Some(reference) {
                    Some(DropReason::BrokenChain)
                } else if self.stalled_since.is_some() {
                    Some(DropReason::AwaitingKeyframe)
                } else if !fits {
                    Some(DropReason::QueueFull)
                } else {
                    None
                };

                match reason {
                    Some(reason) => {
                        self.awaiting_keyframe = true;
                        self.dropped += 1;
                        PushOutcome::Dropped(reason)
                    }
                    None => {
                        self.accept(frame, len);
                        PushOutcome::Queued
                    }
                }
            }
        }
    }

    /// Next frame to write, re-checking the reference chain against
    /// what was actually sent.
    pub fn pop(&mut self) -> Option<Arc<Frame>> {
        while let Some(frame) = self.frames.pop_front() {
            self.queued_bytes -= frame.payload_len();
            let chained = match frame.reference() {
                None => true,
                Some(reference) => self.last_sent == Some(reference),
            };
            if chained {
                self.last_sent = Some(frame.sequence);
                return Some(frame);
            }
            self.dropped += 1;
        }
        None
    }

    /// Clear the stall once the backlog has drained; returns whether the
    /// viewer left the stalled state.
    pub fn settle(&mut self) -> bool {
        if self.stalled_since.is_some() && self.frames.is_empty() {
            self.stalled_since = None;
            return true;
        }
        false
    }

    /// Whether the viewer has been stalled for at least `stall_timeout`.
    pub fn stall_expired(&self, stall_timeout: Duration, now: Instant) -> bool {
        self.stalled_since
            .is_some_and(|since| now.saturating_duration_since(since) >= stall_timeout)
    }

    /// Stop accepting frames and release the backlog.
    pub fn close(&mut self) {
        self.closed = true;
        self.frames.clear();
        self.queued_bytes = 0;
    }

    fn accept(&mut self, frame: Arc<Frame>, len: usize) {
        self.last_accepted = Some(frame.sequence);
        self.queued_bytes += len;
        self.frames.push_back(frame);
    }

    fn discard_backlog(&mut self) {
        self.dropped += self.frames.len() as u64;
        self.frames.clear();
        self.queued_bytes = 0;
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
