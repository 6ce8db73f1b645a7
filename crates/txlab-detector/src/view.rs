use txlab_domain::{EventType, TraceEvent};

/// A trace sorted by `sequence_order` with per-actor lookups.
///
/// Malformed input is tolerated: events are re-sorted, and actors without a
/// terminal event simply never count as committed or rolled back.
#[derive(Debug)]
pub struct TraceView<'a> {
    events: Vec<&'a TraceEvent>,
    actors: Vec<&'a str>,
}

impl<'a> TraceView<'a> {
    #[must_use]
    pub fn new(events: &'a [TraceEvent]) -> Self {
        let mut sorted: Vec<&TraceEvent> = events.iter().collect();
        sorted.sort_by_key(|event| event.sequence_order);

        let mut actors: Vec<&str> = Vec::new();
        for event in &sorted {
            if !actors.contains(&event.tx_name.as_str()) {
                actors.push(event.tx_name.as_str());
            }
        }

        Self {
            events: sorted,
            actors,
        }
    }

    #[must_use]
    pub fn events(&self) -> &[&'a TraceEvent] {
        &self.events
    }

    /// Actor names in order of first appearance.
    #[must_use]
    pub fn actors(&self) -> &[&'a str] {
        &self.actors
    }

    pub fn events_of(&self, tx_name: &'a str) -> impl Iterator<Item = &'a TraceEvent> + '_ {
        self.events
            .iter()
            .copied()
            .filter(move |event| event.tx_name == tx_name)
    }

    /// The actor's first COMMIT or ROLLBACK.
    #[must_use]
    pub fn terminal(&self, tx_name: &str) -> Option<&'a TraceEvent> {
        self.events
            .iter()
            .copied()
            .find(|event| event.tx_name == tx_name && event.event_type.is_terminal())
    }

    /// Whether `tx_name` committed after `sequence_order`.
    #[must_use]
    pub fn committed_after(&self, tx_name: &str, sequence_order: u64) -> bool {
        self.terminal(tx_name).is_some_and(|event| {
            event.event_type == EventType::Commit && event.sequence_order > sequence_order
        })
    }

    /// Sequence of the actor's ROLLBACK, if it rolled back after `sequence_order`.
    #[must_use]
    pub fn rolled_back_after(&self, tx_name: &str, sequence_order: u64) -> Option<u64> {
        self.terminal(tx_name)
            .filter(|event| {
                event.event_type == EventType::Rollback && event.sequence_order > sequence_order
            })
            .map(|event| event.sequence_order)
    }

    /// Whether the actor was still open (no terminal event yet) at `sequence_order`.
    #[must_use]
    pub fn open_at(&self, tx_name: &str, sequence_order: u64) -> bool {
        self.terminal(tx_name)
            .map_or(true, |event| event.sequence_order > sequence_order)
    }

    /// Non-aggregate READs and WRITEs that carry a record key.
    pub fn keyed(
        &self,
        event_type: EventType,
    ) -> impl Iterator<Item = (&'a str, &'a TraceEvent)> + '_ {
        self.events.iter().copied().filter_map(move |event| {
            if event.event_type != event_type || event.aggregate.is_some() {
                return None;
            }
            event.record_key.as_deref().map(|key| (key, event))
        })
    }

    /// Whether the actor wrote a key accepted by `covers` strictly between two sequence numbers.
    pub fn wrote_between(
        &self,
        tx_name: &str,
        after: u64,
        before: u64,
        covers: impl Fn(&str) -> bool,
    ) -> bool {
        self.events.iter().any(|event| {
            event.tx_name == tx_name
                && event.event_type == EventType::Write
                && event.sequence_order > after
                && event.sequence_order < before
                && event.record_key.as_deref().is_some_and(&covers)
        })
    }
}

pub(crate) fn parse_amount(value: Option<&str>) -> Option<i64> {
    value.and_then(|raw| raw.trim().parse::<i64>().ok())
}
