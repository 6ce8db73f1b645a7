use std::collections::{BTreeMap, BTreeSet};

use txlab_domain::{Anomaly, AnomalyType, EventType, FailureReason, TraceEvent, WriteSkewPolicy};

use crate::view::{parse_amount, TraceView};
use crate::DetectionRule;

fn names<'a>(items: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    items.into_iter().map(ToString::to_string).collect()
}

fn display(value: Option<&str>) -> &str {
    value.unwrap_or("NULL")
}

/// Two actors read the same value of a key and both committed a write to it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LostUpdateRule;

impl DetectionRule for LostUpdateRule {
    fn anomaly_type(&self) -> AnomalyType {
        AnomalyType::LostUpdate
    }

    fn detect(&self, view: &TraceView<'_>) -> Vec<Anomaly> {
        let mut reads: BTreeMap<&str, Vec<&TraceEvent>> = BTreeMap::new();
        for (key, event) in view.keyed(EventType::Read) {
            reads.entry(key).or_default().push(event);
        }
        let mut writes: BTreeMap<&str, Vec<&TraceEvent>> = BTreeMap::new();
        for (key, event) in view.keyed(EventType::Write) {
            writes.entry(key).or_default().push(event);
        }

        let mut out = Vec::new();
        for (key, key_reads) in &reads {
            let Some(key_writes) = writes.get(key) else {
                continue;
            };

            // Readers grouped by the value they saw, in order of first read.
            let mut groups: Vec<(&str, Vec<&TraceEvent>)> = Vec::new();
            for read in key_reads {
                let Some(value) = read.read_value() else {
                    continue;
                };
                match groups.iter().position(|(seen, _)| *seen == value) {
                    Some(index) => {
                        let readers = &mut groups[index].1;
                        if !readers.iter().any(|other| other.tx_name == read.tx_name) {
                            readers.push(*read);
                        }
                    }
                    None => groups.push((value, vec![*read])),
                }
            }

            for (value, readers) in groups {
                let committed: Vec<&TraceEvent> = key_writes
                    .iter()
                    .copied()
                    .filter(|write| {
                        readers.iter().any(|read| {
                            read.tx_name == write.tx_name
                                && read.sequence_order < write.sequence_order
                        }) && view.committed_after(&write.tx_name, write.sequence_order)
                    })
                    .collect();
                let Some(first) = committed.first() else {
                    continue;
                };
                let Some(last) = committed
                    .iter()
                    .rev()
                    .find(|write| write.tx_name != first.tx_name)
                else {
                    continue;
                };

                let pair = [first.tx_name.as_str(), last.tx_name.as_str()];
                let mut sequence: BTreeSet<u64> = readers
                    .iter()
                    .filter(|read| pair.contains(&read.tx_name.as_str()))
                    .map(|read| read.sequence_order)
                    .collect();
                sequence.insert(first.sequence_order);
                sequence.insert(last.sequence_order);

                out.push(Anomaly::new(
                    AnomalyType::LostUpdate,
                    format!(
                        "Lost update on {key}: {} wrote {} (from {value}), then {} overwrote it \
                         with {} (also from {value}); {}'s update was lost.",
                        first.tx_name,
                        display(first.new_value.as_deref()),
                        last.tx_name,
                        display(last.new_value.as_deref()),
                        first.tx_name,
                    ),
                    names(pair),
                    sequence,
                ));
                break;
            }
        }
        out
    }
}

/// A read observed a write whose transaction later rolled back.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirtyReadRule;

impl DirtyReadRule {
    /// The uncommitted WRITE a READ observed, if any.
    fn source_write<'a>(
        view: &TraceView<'a>,
        key: &str,
        read: &TraceEvent,
    ) -> Option<&'a TraceEvent> {
        let value = read.read_value()?;
        let pending = view
            .keyed(EventType::Write)
            .filter(|(write_key, write)| {
                *write_key == key
                    && write.tx_name != read.tx_name
                    && write.sequence_order < read.sequence_order
                    && view.open_at(&write.tx_name, read.sequence_order)
            })
            .map(|(_, write)| write)
            .last();
        if let Some(write) = pending {
            // A write that kept the committed value is indistinguishable by value alone.
            let unchanged = write.new_value == write.old_value;
            if write.new_value.as_deref() == Some(value)
                && (!unchanged || read.observed_uncommitted)
            {
                return Some(write);
            }
        }

        // The reader saw a pending version but the writer's WRITE was recorded after the READ.
        if read.observed_uncommitted {
            return view
                .keyed(EventType::Write)
                .find(|(write_key, write)| {
                    *write_key == key
                        && write.tx_name != read.tx_name
                        && write.new_value.as_deref() == Some(value)
                        && view
                            .rolled_back_after(&write.tx_name, read.sequence_order)
                            .is_some()
                })
                .map(|(_, write)| write);
        }
        None
    }
}

impl DetectionRule for DirtyReadRule {
    fn anomaly_type(&self) -> AnomalyType {
        AnomalyType::DirtyRead
    }

    fn detect(&self, view: &TraceView<'_>) -> Vec<Anomaly> {
        let mut seen: BTreeSet<(String, String, String)> = BTreeSet::new();
        let mut out = Vec::new();
        for (key, read) in view.keyed(EventType::Read) {
            let Some(write) = Self::source_write(view, key, read) else {
                continue;
            };
            let Some(rollback) = view.rolled_back_after(&write.tx_name, read.sequence_order) else {
                continue;
            };
            if !seen.insert((write.tx_name.clone(), read.tx_name.clone(), key.to_string())) {
                continue;
            }
            out.push(Anomaly::new(
                AnomalyType::DirtyRead,
                format!(
                    "Dirty read on {key}: {} read {} written by {} before it committed, \
                     then {} rolled back.",
                    read.tx_name,
                    display(read.read_value()),
                    write.tx_name,
                    write.tx_name,
                ),
                names([write.tx_name.as_str(), read.tx_name.as_str()]),
                [write.sequence_order, read.sequence_order, rollback]
                    .into_iter()
                    .collect(),
            ));
        }
        out
    }
}

/// Finds, per actor and key, the first later read that differs from the first one
/// without the actor having written the key in between.
fn repeated_read_changes<'a>(
    view: &TraceView<'a>,
    actor: &'a str,
    aggregate: bool,
) -> Vec<(&'a TraceEvent, &'a TraceEvent)> {
    let mut by_key: BTreeMap<&str, Vec<&TraceEvent>> = BTreeMap::new();
    for event in view.events_of(actor) {
        if event.event_type != EventType::Read || event.aggregate.is_some() != aggregate {
            continue;
        }
        if let Some(key) = event.record_key.as_deref() {
            by_key.entry(key).or_default().push(event);
        }
    }

    let mut out = Vec::new();
    for (key, reads) in by_key {
        let Some((first, rest)) = reads.split_first() else {
            continue;
        };
        let covers = |written: &str| match &first.aggregate {
            Some(aggregate) => aggregate.covers(written),
            None => written == key,
        };
        let changed = rest.iter().find(|later| {
            later.read_value() != first.read_value()
                && !view.wrote_between(actor, first.sequence_order, later.sequence_order, covers)
        });
        if let Some(later) = changed {
            out.push((*first, *later));
        }
    }
    out
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NonRepeatableReadRule;

impl DetectionRule for NonRepeatableReadRule {
    fn anomaly_type(&self) -> AnomalyType {
        AnomalyType::NonRepeatableRead
    }

    fn detect(&self, view: &TraceView<'_>) -> Vec<Anomaly> {
        let mut out = Vec::new();
        for &actor in view.actors() {
            for (first, later) in repeated_read_changes(view, actor, false) {
                out.push(Anomaly::new(
                    AnomalyType::NonRepeatableRead,
                    format!(
                        "Non-repeatable read: {actor} read {} twice and got different values: \
                         first={}, second={}.",
                        display(first.record_key.as_deref()),
                        display(first.read_value()),
                        display(later.read_value()),
                    ),
                    names([actor]),
                    [first.sequence_order, later.sequence_order]
                        .into_iter()
                        .collect(),
                ));
            }
        }
        out
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PhantomReadRule;

impl DetectionRule for PhantomReadRule {
    fn anomaly_type(&self) -> AnomalyType {
        AnomalyType::PhantomRead
    }

    fn detect(&self, view: &TraceView<'_>) -> Vec<Anomaly> {
        let mut out = Vec::new();
        for &actor in view.actors() {
            for (first, later) in repeated_read_changes(view, actor, true) {
                out.push(Anomaly::new(
                    AnomalyType::PhantomRead,
                    format!(
                        "Phantom read: {actor} ran {} twice and saw different results: \
                         first={}, second={}.",
                        display(first.record_key.as_deref()),
                        display(first.read_value()),
                        display(later.read_value()),
                    ),
                    names([actor]),
                    [first.sequence_order, later.sequence_order]
                        .into_iter()
                        .collect(),
                ));
            }
        }
        out
    }
}

/// Actors that read the same aggregate and then committed disjoint writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteSkewRule {
    pub policy: WriteSkewPolicy,
}

struct SkewCandidate<'a> {
    actor: &'a str,
    read: &'a TraceEvent,
    writes: Vec<&'a TraceEvent>,
}

impl WriteSkewRule {
    #[must_use]
    pub const fn new(policy: WriteSkewPolicy) -> Self {
        Self { policy }
    }

    fn breaches(&self, first: &SkewCandidate<'_>, second: &SkewCandidate<'_>) -> bool {
        let WriteSkewPolicy::ConstraintBreach { min_total } = self.policy else {
            return true;
        };
        let base = parse_amount(first.read.read_value());
        if base.is_none() || base != parse_amount(second.read.read_value()) {
            return false;
        }
        let Some(aggregate) = first.read.aggregate.as_ref() else {
            return false;
        };

        let mut projected = base.unwrap_or_default();
        for write in first.writes.iter().chain(&second.writes) {
            let Some(key) = write.record_key.as_deref() else {
                continue;
            };
            if !aggregate.covers(key) {
                continue;
            }
            let old = parse_amount(write.old_value.as_deref()).unwrap_or(0);
            let Some(new) = parse_amount(write.new_value.as_deref()) else {
                return false;
            };
            projected = projected.saturating_add(new.saturating_sub(old));
        }
        projected < min_total
    }
}

impl DetectionRule for WriteSkewRule {
    fn anomaly_type(&self) -> AnomalyType {
        AnomalyType::WriteSkew
    }

    fn detect(&self, view: &TraceView<'_>) -> Vec<Anomaly> {
        let mut scopes: BTreeMap<&str, Vec<SkewCandidate<'_>>> = BTreeMap::new();
        for &actor in view.actors() {
            let mut first_reads: BTreeMap<&str, &TraceEvent> = BTreeMap::new();
            for event in view.events_of(actor) {
                let Some(key) = event.record_key.as_deref() else {
                    continue;
                };
                if event.is_aggregate_read() {
                    first_reads.entry(key).or_insert(event);
                }
            }
            for (key, read) in first_reads {
                let writes: Vec<&TraceEvent> = view
                    .events_of(actor)
                    .filter(|event| {
                        event.event_type == EventType::Write
                            && event.record_key.is_some()
                            && event.sequence_order > read.sequence_order
                            && view.committed_after(actor, event.sequence_order)
                    })
                    .collect();
                if !writes.is_empty() {
                    scopes.entry(key).or_default().push(SkewCandidate {
                        actor,
                        read,
                        writes,
                    });
                }
            }
        }

        let mut out = Vec::new();
        for (scope, candidates) in &scopes {
            let pair = candidates.iter().enumerate().find_map(|(index, first)| {
                candidates[index + 1..]
                    .iter()
                    .find(|second| disjoint(first, second) && self.breaches(first, second))
                    .map(|second| (first, second))
            });
            let Some((first, second)) = pair else {
                continue;
            };

            let sequence: BTreeSet<u64> = [first, second]
                .iter()
                .flat_map(|candidate| {
                    std::iter::once(candidate.read.sequence_order)
                        .chain(candidate.writes.iter().map(|write| write.sequence_order))
                })
                .collect();
            out.push(Anomaly::new(
                AnomalyType::WriteSkew,
                format!(
                    "Write skew on {scope}: {} and {} both read {scope} ({} and {}) and then \
                     committed writes to disjoint records ({} and {}).",
                    first.actor,
                    second.actor,
                    display(first.read.read_value()),
                    display(second.read.read_value()),
                    written_keys(first).join(","),
                    written_keys(second).join(","),
                ),
                names([first.actor, second.actor]),
                sequence,
            ));
        }
        out
    }
}

fn written_keys<'a>(candidate: &SkewCandidate<'a>) -> Vec<&'a str> {
    let keys: BTreeSet<&str> = candidate
        .writes
        .iter()
        .filter_map(|write| write.record_key.as_deref())
        .collect();
    keys.into_iter().collect()
}

fn disjoint(first: &SkewCandidate<'_>, second: &SkewCandidate<'_>) -> bool {
    let theirs = written_keys(second);
    written_keys(first).iter().all(|key| !theirs.contains(key))
}

/// A ROLLBACK the store forced to break a lock cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeadlockRule;

impl DetectionRule for DeadlockRule {
    fn anomaly_type(&self) -> AnomalyType {
        AnomalyType::Deadlock
    }

    fn detect(&self, view: &TraceView<'_>) -> Vec<Anomaly> {
        view.events()
            .iter()
            .filter(|event| {
                event.event_type == EventType::Rollback
                    && event.failure == Some(FailureReason::Deadlock)
            })
            .map(|rollback| {
                let victim = rollback.tx_name.as_str();
                let mut affected = names([victim]);
                affected.extend(
                    view.actors()
                        .iter()
                        .filter(|actor| **actor != victim)
                        .map(ToString::to_string),
                );
                Anomaly::new(
                    AnomalyType::Deadlock,
                    format!(
                        "Deadlock: {victim} was chosen as the deadlock victim and rolled back \
                         to break a circular lock wait."
                    ),
                    affected,
                    [rollback.sequence_order].into_iter().collect(),
                )
            })
            .collect()
    }
}
