//! Append-only instrument event record.
//!
//! Protection trips and topology changes must stay visible to the operator
//! after the condition itself has passed. The log keeps a bounded record of
//! such events for the display/SCPI layers to drain, and mirrors each entry
//! through the `log` facade for whatever diagnostic sink the firmware has
//! installed.

use heapless::Deque;
use log::{error, info};

use crate::scheduler::Instant;
use crate::ChannelId;

/// Capacity of the in-memory event record. The oldest entry is evicted once
/// the record is full.
pub const EVENT_LOG_DEPTH: usize = 32;

/// Identifies what happened.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
pub enum EventId {
    OvpTripped,
    OcpTripped,
    OppTripped,
    OtpTripped,
    CoupledInParallel,
    CoupledInSeries,
    CoupledCommonGround,
    CoupledSplitRails,
    Uncoupled,
    ChannelsTracked,
    TrackingDisabled,
    OutputInhibited,
    InhibitCleared,
    TriggerAborted,
    RampAborted,
    ListAborted,
    Standby,
    ModuleFault,
    ModuleRecovered,
}

impl EventId {
    /// Whether this event indicates a fault rather than an operator action.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            EventId::OvpTripped
                | EventId::OcpTripped
                | EventId::OppTripped
                | EventId::OtpTripped
                | EventId::RampAborted
                | EventId::ListAborted
                | EventId::ModuleFault
        )
    }
}

/// A single recorded event.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub channel: Option<ChannelId>,
    pub at: Instant,
}

/// Bounded append-only event record.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Deque<Event, EVENT_LOG_DEPTH>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event, evicting the oldest entry if the record is full.
    pub fn push(&mut self, id: EventId, channel: Option<ChannelId>, at: Instant) {
        if self.entries.is_full() {
            self.entries.pop_front();
        }

        let event = Event { id, channel, at };
        if id.is_error() {
            error!("event: {:?} (channel {:?})", id, channel);
        } else {
            info!("event: {:?} (channel {:?})", id, channel);
        }

        // Capacity was just guaranteed above.
        self.entries.push_back(event).ok();
    }

    /// Iterate over recorded events, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.entries.iter()
    }

    /// The most recent fault-class event still in the record.
    pub fn last_error(&self) -> Option<&Event> {
        let mut found = None;
        for event in self.entries.iter() {
            if event.id.is_error() {
                found = Some(event);
            }
        }
        found
    }

    /// The most recent event of any class.
    pub fn last(&self) -> Option<&Event> {
        self.entries.iter().last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discard all recorded events.
    pub fn clear(&mut self) {
        while self.entries.pop_front().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Instant {
        Instant::from_ticks(ms)
    }

    #[test]
    fn oldest_entry_is_evicted_when_full() {
        let mut log = EventLog::new();
        for i in 0..EVENT_LOG_DEPTH + 4 {
            log.push(EventId::Uncoupled, None, at(i as u64));
        }

        assert_eq!(log.len(), EVENT_LOG_DEPTH);
        assert_eq!(log.iter().next().unwrap().at, at(4));
        assert_eq!(log.last().unwrap().at, at((EVENT_LOG_DEPTH + 3) as u64));
    }

    #[test]
    fn last_error_skips_informational_events() {
        let mut log = EventLog::new();
        log.push(EventId::OvpTripped, Some(ChannelId::Zero), at(1));
        log.push(EventId::CoupledInSeries, None, at(2));

        assert_eq!(log.last_error().unwrap().id, EventId::OvpTripped);
        assert_eq!(log.last().unwrap().id, EventId::CoupledInSeries);
    }
}
