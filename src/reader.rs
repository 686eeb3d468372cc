//! Bounded frame pool with latest-frame acquisition.
//!
//! A [`FrameReader`] owns at most `depth` frames at once, counting both
//! frames waiting to be acquired and frames the consumer still holds. The
//! producer side ([`FrameProducer`]) hands frames in from the device; the
//! consumer takes only the newest with [`FrameReader::acquire_latest`],
//! which releases every older pending frame. This is the only
//! back-pressure: a slow consumer causes drops, never a backlog.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::trace;

use crate::types::Resolution;

/// Counters describing what happened to frames handed to a reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Frames accepted from the producer.
    pub submitted: u64,
    /// Frames handed to the consumer.
    pub acquired: u64,
    /// Frames released without ever being acquired.
    pub dropped: u64,
    /// Frames rejected because every slot was held by the consumer.
    pub rejected: u64,
}

struct State<F> {
    pending: VecDeque<F>,
    held: usize,
    closed: bool,
    signal: Option<Sender<()>>,
    stats: ReaderStats,
}

struct Shared<F> {
    resolution: Resolution,
    depth: usize,
    state: Mutex<State<F>>,
}

impl<F> Shared<F> {
    fn lock(&self) -> MutexGuard<'_, State<F>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Consumer side of the frame pool.
pub struct FrameReader<F> {
    shared: Arc<Shared<F>>,
}

impl<F> Clone for FrameReader<F> {
    fn clone(&self) -> Self {
        FrameReader {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F> FrameReader<F> {
    /// Create a reader holding at most `depth` frames (at least one).
    ///
    /// The returned receiver yields one ready signal per accepted frame,
    /// coalesced: a full signal channel means the consumer already has a
    /// wake-up pending that will observe the newest frame.
    pub fn new(resolution: Resolution, depth: usize) -> (Self, Receiver<()>) {
        let depth = depth.max(1);
        let (tx, rx) = crossbeam_channel::bounded(depth);
        let reader = FrameReader {
            shared: Arc::new(Shared {
                resolution,
                depth,
                state: Mutex::new(State {
                    pending: VecDeque::with_capacity(depth),
                    held: 0,
                    closed: false,
                    signal: Some(tx),
                    stats: ReaderStats::default(),
                }),
            }),
        };
        (reader, rx)
    }

    pub fn resolution(&self) -> Resolution {
        self.shared.resolution
    }

    pub fn depth(&self) -> usize {
        self.shared.depth
    }

    /// Handle for the device side.
    pub fn producer(&self) -> FrameProducer<F> {
        FrameProducer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Take the newest pending frame, releasing any older ones.
    ///
    /// Returns `None` when nothing is pending or the reader is closed.
    pub fn acquire_latest(&self) -> Option<AcquiredFrame<F>> {
        let mut stale = VecDeque::new();
        let frame = {
            let mut state = self.shared.lock();
            if state.closed {
                return None;
            }
            let frame = state.pending.pop_back()?;
            std::mem::swap(&mut stale, &mut state.pending);
            state.stats.dropped += stale.len() as u64;
            state.stats.acquired += 1;
            state.held += 1;
            frame
        };
        if !stale.is_empty() {
            trace!(count = stale.len(), "discarding older pending frames");
        }
        // Older frames go back to the device outside the lock.
        drop(stale);
        Some(AcquiredFrame {
            frame: Some(frame),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Frames pending plus frames held by the consumer.
    pub fn in_flight(&self) -> usize {
        let state = self.shared.lock();
        state.pending.len() + state.held
    }

    pub fn stats(&self) -> ReaderStats {
        self.shared.lock().stats
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Release pending frames and stop accepting new ones.
    ///
    /// Frames the consumer still holds stay valid until dropped. Closing also
    /// disconnects the ready-signal channel.
    pub fn close(&self) {
        let (pending, signal) = {
            let mut state = self.shared.lock();
            state.closed = true;
            state.stats.dropped += state.pending.len() as u64;
            (std::mem::take(&mut state.pending), state.signal.take())
        };
        drop(pending);
        drop(signal);
    }
}

/// Device side of the frame pool.
pub struct FrameProducer<F> {
    shared: Arc<Shared<F>>,
}

impl<F> Clone for FrameProducer<F> {
    fn clone(&self) -> Self {
        FrameProducer {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Why a frame was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    Closed,
    /// Every slot is held by the consumer.
    Full,
}

impl<F> FrameProducer<F> {
    pub fn resolution(&self) -> Resolution {
        self.shared.resolution
    }

    /// Hand a frame to the reader.
    ///
    /// When the pool is full the oldest pending frame is evicted to make
    /// room. Only when the consumer holds every slot is the new frame
    /// rejected. Rejected frames are dropped by the caller.
    pub fn submit(&self, frame: F) -> Result<(), (SubmitError, F)> {
        let evicted = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err((SubmitError::Closed, frame));
            }
            let mut evicted = None;
            if state.pending.len() + state.held >= self.shared.depth {
                if state.pending.is_empty() {
                    state.stats.rejected += 1;
                    return Err((SubmitError::Full, frame));
                }
                evicted = state.pending.pop_front();
                state.stats.dropped += 1;
            }
            state.pending.push_back(frame);
            state.stats.submitted += 1;
            if let Some(signal) = &state.signal {
                match signal.try_send(()) {
                    Ok(()) | Err(TrySendError::Full(())) => {}
                    Err(TrySendError::Disconnected(())) => {
                        trace!("frame consumer has gone away");
                    }
                }
            }
            evicted
        };
        drop(evicted);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

/// A frame held by the consumer. Dropping it returns the slot to the pool.
pub struct AcquiredFrame<F> {
    frame: Option<F>,
    shared: Arc<Shared<F>>,
}

impl<F> Deref for AcquiredFrame<F> {
    type Target = F;

    fn deref(&self) -> &F {
        // Only taken in `drop`.
        match &self.frame {
            Some(frame) => frame,
            None => unreachable!("acquired frame accessed after release"),
        }
    }
}

impl<F> Drop for AcquiredFrame<F> {
    fn drop(&mut self) {
        // Release the device buffer before freeing the slot, so the producer
        // never sees a free slot whose buffer is still in use.
        drop(self.frame.take());
        let mut state = self.shared.lock();
        state.held = state.held.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(depth: usize) -> (FrameReader<u32>, Receiver<()>) {
        FrameReader::new(Resolution::new(4, 4), depth)
    }

    #[test]
    fn acquire_latest_discards_older_frames() {
        let (reader, _rx) = reader(3);
        let producer = reader.producer();
        producer.submit(1).unwrap();
        producer.submit(2).unwrap();
        producer.submit(3).unwrap();

        let frame = reader.acquire_latest().unwrap();
        assert_eq!(*frame, 3);
        assert!(reader.acquire_latest().is_none());

        let stats = reader.stats();
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.dropped, 2);
    }

    #[test]
    fn empty_reader_yields_nothing() {
        let (reader, _rx) = reader(2);
        assert!(reader.acquire_latest().is_none());
        assert_eq!(reader.stats(), ReaderStats::default());
    }

    #[test]
    fn full_pool_evicts_oldest_pending() {
        let (reader, _rx) = reader(2);
        let producer = reader.producer();
        producer.submit(1).unwrap();
        producer.submit(2).unwrap();
        producer.submit(3).unwrap();
        assert_eq!(reader.in_flight(), 2);
        assert_eq!(reader.stats().dropped, 1);
        assert_eq!(*reader.acquire_latest().unwrap(), 3);
    }

    #[test]
    fn held_frames_count_against_depth() {
        let (reader, _rx) = reader(2);
        let producer = reader.producer();
        producer.submit(1).unwrap();
        let first = reader.acquire_latest().unwrap();
        producer.submit(2).unwrap();
        let second = reader.acquire_latest().unwrap();

        // Both slots held: nothing to evict, so the frame is rejected.
        assert_eq!(producer.submit(3), Err((SubmitError::Full, 3)));
        assert_eq!(reader.stats().rejected, 1);

        drop(first);
        assert_eq!(reader.in_flight(), 1);
        producer.submit(4).unwrap();
        drop(second);
        assert_eq!(*reader.acquire_latest().unwrap(), 4);
    }

    #[test]
    fn dropping_acquired_frame_frees_slot() {
        let (reader, _rx) = reader(1);
        let producer = reader.producer();
        producer.submit(7).unwrap();
        {
            let frame = reader.acquire_latest().unwrap();
            assert_eq!(*frame, 7);
            assert_eq!(reader.in_flight(), 1);
        }
        assert_eq!(reader.in_flight(), 0);
    }

    #[test]
    fn signals_are_coalesced_to_depth() {
        let (reader, rx) = reader(2);
        let producer = reader.producer();
        for i in 0..5 {
            producer.submit(i).unwrap();
        }
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn close_releases_pending_and_disconnects_signal() {
        let (reader, rx) = reader(2);
        let producer = reader.producer();
        producer.submit(1).unwrap();
        producer.submit(2).unwrap();
        reader.close();

        assert!(reader.is_closed());
        assert!(producer.is_closed());
        assert_eq!(reader.in_flight(), 0);
        assert_eq!(reader.stats().dropped, 2);
        assert!(reader.acquire_latest().is_none());
        assert_eq!(producer.submit(3), Err((SubmitError::Closed, 3)));

        // Buffered signals drain, then the channel reports disconnection.
        while rx.try_recv().is_ok() {}
        assert!(matches!(
            rx.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn frames_held_across_close_stay_valid() {
        let (reader, _rx) = reader(2);
        reader.producer().submit(5).unwrap();
        let frame = reader.acquire_latest().unwrap();
        reader.close();
        assert_eq!(*frame, 5);
        drop(frame);
        assert_eq!(reader.in_flight(), 0);
    }

    #[test]
    fn zero_depth_is_raised_to_one() {
        let (reader, _rx) = reader(0);
        assert_eq!(reader.depth(), 1);
    }
}
