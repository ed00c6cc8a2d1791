//! The event queue driving the engine.
//!
//! Everything external reaches the engine as an [`Event`]: bytes from the
//! RCP serial pipe, IPv6 packets from the TUN device, operator requests
//! and the canonical 100 ms tick. Events are queued in three priority
//! bands; within a band they are strictly FIFO, and the engine never
//! suspends inside a handler.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::handle::Request;

/// Event priority bands, drained high to low
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

/// Everything the engine reacts to
#[derive(Debug)]
pub enum Event {
    /// A chunk of bytes read from the RCP serial link
    SerialRx(Vec<u8>),
    /// An IPv6 packet read from the TUN device
    TunRx(Vec<u8>),
    /// An operator request submitted through the handle
    Management(Request),
    /// The canonical 100 ms tick
    Tick,
    /// A one-shot delay elapsed; the token identifies who armed it
    Delay(u32, Duration),
    Shutdown,
}

impl Event {
    /// The band an event is queued in
    pub fn priority(&self) -> Priority {
        match self {
            Self::SerialRx(_) | Self::Shutdown => Priority::High,
            Self::Tick | Self::Delay(..) => Priority::Medium,
            Self::TunRx(_) | Self::Management(_) => Priority::Low,
        }
    }
}

/// Three FIFO bands with a single ingest channel
pub struct EventQueue {
    bands: [std::collections::VecDeque<Event>; 3],
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            bands: Default::default(),
        }
    }

    pub fn push(&mut self, event: Event) {
        self.bands[event.priority() as usize].push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.bands.iter_mut().find_map(|band| band.pop_front())
    }

    pub fn len(&self) -> usize {
        self.bands.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.iter().all(|b| b.is_empty())
    }

    /// Returns the next event to process: drains whatever is already
    /// queued on the channel into the bands, then pops the highest band.
    /// Blocks only when everything is empty; that wait is the loop's
    /// single suspension point between events.
    pub async fn next(&mut self, rx: &mut mpsc::UnboundedReceiver<Event>) -> Option<Event> {
        loop {
            while let Ok(event) = rx.try_recv() {
                self.push(event);
            }
            if let Some(event) = self.pop() {
                return Some(event);
            }
            match rx.recv().await {
                Some(event) => self.push(event),
                None => return None,
            }
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A cancellable one-shot delay.
///
/// Arms a timer that posts [`Event::Delay`] with the given token once the
/// time passes; `ignore()` disarms it if it has not fired yet.
pub struct Delay {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Delay {
    /// Arms a delay of `time` that will post `Event::Delay(token, time)`
    /// on `channel`
    pub fn by(time: Duration, token: u32, channel: mpsc::UnboundedSender<Event>) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(time).await;
            channel.send(Event::Delay(token, time)).ok();
        });
        Self {
            handle: Some(handle),
        }
    }

    /// A delay that never fires
    pub fn idle() -> Self {
        Self { handle: None }
    }

    /// Once called, the event won't be posted (if it has not fired
    /// already)
    pub fn ignore(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        self.ignore();
    }
}
