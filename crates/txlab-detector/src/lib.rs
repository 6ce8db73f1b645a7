#![forbid(unsafe_code)]

//! Rule-based classification of a finished trace.
//!
//! Detection is pure: it never touches a store and never fails. Events may
//! arrive in any order; every rule works on a [`TraceView`] sorted by
//! `sequence_order`.

use txlab_domain::{Anomaly, AnomalyType, DetectorSettings, TraceEvent};

mod rules;
mod view;

pub use rules::{
    DeadlockRule, DirtyReadRule, LostUpdateRule, NonRepeatableReadRule, PhantomReadRule,
    WriteSkewRule,
};
pub use view::TraceView;

/// One anomaly classifier over a whole trace.
pub trait DetectionRule: Send + Sync {
    fn anomaly_type(&self) -> AnomalyType;

    fn detect(&self, view: &TraceView<'_>) -> Vec<Anomaly>;
}

pub struct Detector {
    rules: Vec<Box<dyn DetectionRule>>,
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<&str> = self
            .rules
            .iter()
            .map(|rule| rule.anomaly_type().as_str())
            .collect();
        f.debug_struct("Detector").field("rules", &kinds).finish()
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new(DetectorSettings::default())
    }
}

impl Detector {
    /// The six built-in rules, in [`AnomalyType::ALL`] order.
    #[must_use]
    pub fn new(settings: DetectorSettings) -> Self {
        Self::with_rules(vec![
            Box::new(LostUpdateRule),
            Box::new(DirtyReadRule),
            Box::new(NonRepeatableReadRule),
            Box::new(PhantomReadRule),
            Box::new(WriteSkewRule::new(settings.write_skew)),
            Box::new(DeadlockRule),
        ])
    }

    #[must_use]
    pub fn with_rules(rules: Vec<Box<dyn DetectionRule>>) -> Self {
        Self { rules }
    }

    #[must_use]
    pub fn rule_types(&self) -> Vec<AnomalyType> {
        self.rules.iter().map(|rule| rule.anomaly_type()).collect()
    }

    #[must_use]
    pub fn detect(&self, events: &[TraceEvent]) -> Vec<Anomaly> {
        if events.is_empty() {
            return Vec::new();
        }
        let view = TraceView::new(events);
        self.rules
            .iter()
            .flat_map(|rule| rule.detect(&view))
            .collect()
    }
}

/// Run the default rule set.
#[must_use]
pub fn detect(events: &[TraceEvent]) -> Vec<Anomaly> {
    Detector::default().detect(events)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use proptest::prelude::*;
    use txlab_domain::{
        now_utc, AggregateRead, Anomaly, AnomalyType, DetectorSettings, EventDraft, EventType,
        FailureReason, RunId, TraceEvent, TxId, WriteSkewPolicy,
    };

    use super::{detect, DetectionRule, Detector, TraceView};

    const TABLE: &str = "accounts";

    struct TraceBuilder {
        run_id: RunId,
        tx_ids: BTreeMap<String, TxId>,
        events: Vec<TraceEvent>,
    }

    impl TraceBuilder {
        fn new() -> Self {
            Self {
                run_id: RunId::new(),
                tx_ids: BTreeMap::new(),
                events: Vec::new(),
            }
        }

        fn push(
            &mut self,
            tx: &str,
            event_type: EventType,
            shape: impl FnOnce(EventDraft) -> EventDraft,
        ) -> &mut Self {
            let tx_id = *self.tx_ids.entry(tx.to_string()).or_insert_with(TxId::new);
            let draft = shape(EventDraft::new(self.run_id, tx_id, tx, event_type));
            let sequence_order = self.events.len() as u64 + 1;
            self.events.push(draft.into_event(sequence_order, now_utc()));
            self
        }

        fn begin(&mut self, tx: &str) -> &mut Self {
            self.push(tx, EventType::Begin, |draft| draft)
        }

        fn read(&mut self, tx: &str, key: &str, value: i64) -> &mut Self {
            self.push(tx, EventType::Read, |draft| {
                draft.record(TABLE, key).values(Some(value), None)
            })
        }

        fn dirty_read(&mut self, tx: &str, key: &str, value: i64) -> &mut Self {
            self.push(tx, EventType::Read, |draft| {
                draft
                    .record(TABLE, key)
                    .values(Some(value), None)
                    .observed_uncommitted(true)
            })
        }

        fn aggregate(&mut self, tx: &str, aggregate: AggregateRead, value: i64) -> &mut Self {
            self.push(tx, EventType::Read, |draft| {
                draft.aggregate(TABLE, aggregate).values(Some(value), None)
            })
        }

        fn write(&mut self, tx: &str, key: &str, old: Option<i64>, new: i64) -> &mut Self {
            self.push(tx, EventType::Write, |draft| {
                draft.record(TABLE, key).values(old, Some(new))
            })
        }

        fn commit(&mut self, tx: &str) -> &mut Self {
            self.push(tx, EventType::Commit, |draft| draft)
        }

        fn rollback(&mut self, tx: &str, reason: FailureReason) -> &mut Self {
            self.push(tx, EventType::Rollback, |draft| draft.failure(reason))
        }

        fn build(&self) -> Vec<TraceEvent> {
            self.events.clone()
        }
    }

    fn of_type(anomalies: &[Anomaly], anomaly_type: AnomalyType) -> Vec<&Anomaly> {
        anomalies
            .iter()
            .filter(|anomaly| anomaly.anomaly_type == anomaly_type)
            .collect()
    }

    fn set<const N: usize>(names: [&str; N]) -> BTreeSet<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn lost_update_trace() -> Vec<TraceEvent> {
        TraceBuilder::new()
            .begin("T1")
            .read("T1", "A", 100)
            .begin("T2")
            .read("T2", "A", 100)
            .write("T1", "A", Some(100), 150)
            .commit("T1")
            .write("T2", "A", Some(100), 80)
            .commit("T2")
            .build()
    }

    #[test]
    fn empty_trace_yields_nothing() {
        assert!(detect(&[]).is_empty());
    }

    #[test]
    fn lost_update_names_both_writers() {
        let anomalies = detect(&lost_update_trace());
        assert_eq!(anomalies.len(), 1);
        let anomaly = &anomalies[0];
        assert_eq!(anomaly.anomaly_type, AnomalyType::LostUpdate);
        assert_eq!(anomaly.affected_transactions, set(["T1", "T2"]));
        assert_eq!(anomaly.event_sequence, [2, 4, 5, 7].into_iter().collect());
        assert!(anomaly.description.contains("T1's update was lost"));
    }

    #[test]
    fn lost_update_needs_both_writers_committed() {
        let events = TraceBuilder::new()
            .begin("T1")
            .read("T1", "A", 100)
            .begin("T2")
            .read("T2", "A", 100)
            .write("T1", "A", Some(100), 150)
            .commit("T1")
            .write("T2", "A", Some(100), 80)
            .rollback("T2", FailureReason::SerializationFailure)
            .build();
        assert!(of_type(&detect(&events), AnomalyType::LostUpdate).is_empty());
    }

    #[test]
    fn dirty_read_pairs_writer_and_reader() {
        let events = TraceBuilder::new()
            .begin("T1")
            .read("T1", "A", 100)
            .write("T1", "A", Some(100), 150)
            .begin("T2")
            .dirty_read("T2", "A", 150)
            .commit("T2")
            .rollback("T1", FailureReason::Scripted)
            .build();
        let anomalies = detect(&events);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].anomaly_type, AnomalyType::DirtyRead);
        assert_eq!(anomalies[0].affected_transactions, set(["T1", "T2"]));
        assert_eq!(anomalies[0].event_sequence, [3, 5, 7].into_iter().collect());
    }

    #[test]
    fn dirty_read_is_structural_without_hint() {
        // No observed_uncommitted flag: the value match alone identifies the source write.
        let events = TraceBuilder::new()
            .begin("T1")
            .write("T1", "A", Some(100), 150)
            .begin("T2")
            .read("T2", "A", 150)
            .commit("T2")
            .rollback("T1", FailureReason::Scripted)
            .build();
        assert_eq!(of_type(&detect(&events), AnomalyType::DirtyRead).len(), 1);
    }

    #[test]
    fn read_of_committed_write_is_not_dirty() {
        let events = TraceBuilder::new()
            .begin("T1")
            .write("T1", "A", Some(100), 150)
            .begin("T2")
            .read("T2", "A", 100)
            .commit("T2")
            .rollback("T1", FailureReason::Scripted)
            .build();
        assert!(of_type(&detect(&events), AnomalyType::DirtyRead).is_empty());

        let committed = TraceBuilder::new()
            .begin("T1")
            .write("T1", "A", Some(100), 150)
            .begin("T2")
            .dirty_read("T2", "A", 150)
            .commit("T1")
            .commit("T2")
            .build();
        assert!(detect(&committed).is_empty());
    }

    #[test]
    fn value_preserving_write_needs_uncommitted_hint() {
        let committed_read = TraceBuilder::new()
            .begin("T1")
            .read("T1", "A", 100)
            .write("T1", "A", Some(100), 100)
            .begin("T2")
            .read("T2", "A", 100)
            .commit("T2")
            .rollback("T1", FailureReason::Scripted)
            .build();
        assert!(detect(&committed_read).is_empty());

        let pending_read = TraceBuilder::new()
            .begin("T1")
            .read("T1", "A", 100)
            .write("T1", "A", Some(100), 100)
            .begin("T2")
            .dirty_read("T2", "A", 100)
            .commit("T2")
            .rollback("T1", FailureReason::Scripted)
            .build();
        assert_eq!(of_type(&detect(&pending_read), AnomalyType::DirtyRead).len(), 1);
    }

    #[test]
    fn non_repeatable_read_reports_reader_only() {
        let events = TraceBuilder::new()
            .begin("T1")
            .read("T1", "A", 100)
            .begin("T2")
            .read("T2", "A", 100)
            .write("T2", "A", Some(100), 150)
            .commit("T2")
            .read("T1", "A", 150)
            .commit("T1")
            .build();
        let anomalies = detect(&events);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].anomaly_type, AnomalyType::NonRepeatableRead);
        assert_eq!(anomalies[0].affected_transactions, set(["T1"]));
        assert_eq!(anomalies[0].event_sequence, [2, 7].into_iter().collect());
    }

    #[test]
    fn own_write_between_reads_is_not_non_repeatable() {
        let events = TraceBuilder::new()
            .begin("T1")
            .read("T1", "A", 100)
            .write("T1", "A", Some(100), 150)
            .read("T1", "A", 150)
            .commit("T1")
            .build();
        assert!(detect(&events).is_empty());
    }

    #[test]
    fn phantom_read_on_changed_count() {
        let events = TraceBuilder::new()
            .begin("T1")
            .aggregate("T1", AggregateRead::count_all(), 2)
            .begin("T2")
            .write("T2", "D", None, 0)
            .commit("T2")
            .aggregate("T1", AggregateRead::count_all(), 3)
            .commit("T1")
            .build();
        let anomalies = detect(&events);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].anomaly_type, AnomalyType::PhantomRead);
        assert_eq!(anomalies[0].affected_transactions, set(["T1"]));
        assert!(anomalies[0].description.contains("COUNT(*)"));
    }

    #[test]
    fn stable_count_is_not_a_phantom() {
        let events = TraceBuilder::new()
            .begin("T1")
            .aggregate("T1", AggregateRead::count_all(), 2)
            .begin("T2")
            .write("T2", "D", None, 0)
            .commit("T2")
            .aggregate("T1", AggregateRead::count_all(), 2)
            .commit("T1")
            .build();
        assert!(detect(&events).is_empty());
    }

    fn write_skew_trace(t1_new: i64, t2_new: i64) -> Vec<TraceEvent> {
        TraceBuilder::new()
            .begin("T1")
            .aggregate("T1", AggregateRead::sum_of(&["A", "B"]), 300)
            .begin("T2")
            .aggregate("T2", AggregateRead::sum_of(&["A", "B"]), 300)
            .write("T2", "B", Some(200), t2_new)
            .commit("T2")
            .write("T1", "A", Some(100), t1_new)
            .commit("T1")
            .build()
    }

    #[test]
    fn write_skew_pattern_ignores_totals() {
        let anomalies = detect(&write_skew_trace(90, 190));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].anomaly_type, AnomalyType::WriteSkew);
        assert_eq!(anomalies[0].affected_transactions, set(["T1", "T2"]));
        assert_eq!(anomalies[0].event_sequence, [2, 4, 5, 7].into_iter().collect());
    }

    #[test]
    fn write_skew_constraint_mode_requires_breach() {
        let strict = Detector::new(DetectorSettings {
            write_skew: WriteSkewPolicy::ConstraintBreach { min_total: 100 },
        });
        assert!(strict.detect(&write_skew_trace(90, 190)).is_empty());

        let breached = strict.detect(&write_skew_trace(-50, 40));
        assert_eq!(breached.len(), 1);
        assert_eq!(breached[0].anomaly_type, AnomalyType::WriteSkew);
    }

    #[test]
    fn overlapping_writes_are_not_write_skew() {
        let events = TraceBuilder::new()
            .begin("T1")
            .aggregate("T1", AggregateRead::sum_of(&["A", "B"]), 300)
            .begin("T2")
            .aggregate("T2", AggregateRead::sum_of(&["A", "B"]), 300)
            .write("T2", "A", Some(100), 0)
            .commit("T2")
            .write("T1", "A", Some(0), 50)
            .commit("T1")
            .build();
        assert!(of_type(&detect(&events), AnomalyType::WriteSkew).is_empty());
    }

    #[test]
    fn deadlock_victim_and_survivor() {
        let events = TraceBuilder::new()
            .begin("T1")
            .read("T1", "A", 100)
            .begin("T2")
            .read("T2", "B", 200)
            .rollback("T2", FailureReason::Deadlock)
            .read("T1", "B", 200)
            .write("T1", "A", Some(100), 150)
            .write("T1", "B", Some(200), 150)
            .commit("T1")
            .build();
        let anomalies = detect(&events);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].anomaly_type, AnomalyType::Deadlock);
        assert_eq!(anomalies[0].affected_transactions, set(["T1", "T2"]));
        assert_eq!(anomalies[0].event_sequence, [5].into_iter().collect());
        assert!(anomalies[0].description.starts_with("Deadlock: T2"));
    }

    #[test]
    fn serialization_failure_is_not_a_deadlock() {
        let events = TraceBuilder::new()
            .begin("T1")
            .rollback("T1", FailureReason::SerializationFailure)
            .build();
        assert!(detect(&events).is_empty());
    }

    #[test]
    fn unordered_input_is_sorted_first() {
        let mut events = lost_update_trace();
        events.reverse();
        assert_eq!(detect(&events), detect(&lost_update_trace()));
    }

    #[test]
    fn actor_without_terminal_event_never_counts_as_committed() {
        let mut events = lost_update_trace();
        events.pop();
        assert!(detect(&events).is_empty());
    }

    struct EveryRollback;

    impl DetectionRule for EveryRollback {
        fn anomaly_type(&self) -> AnomalyType {
            AnomalyType::Deadlock
        }

        fn detect(&self, view: &TraceView<'_>) -> Vec<Anomaly> {
            view.events()
                .iter()
                .filter(|event| event.event_type == EventType::Rollback)
                .map(|event| {
                    Anomaly::new(
                        AnomalyType::Deadlock,
                        "rollback".to_string(),
                        set([event.tx_name.as_str()]),
                        [event.sequence_order].into_iter().collect(),
                    )
                })
                .collect()
        }
    }

    #[test]
    fn custom_rules_compose() {
        let detector = Detector::with_rules(vec![Box::new(EveryRollback)]);
        assert_eq!(detector.rule_types(), vec![AnomalyType::Deadlock]);

        let events = TraceBuilder::new()
            .begin("T1")
            .rollback("T1", FailureReason::Scripted)
            .build();
        assert_eq!(detector.detect(&events).len(), 1);
        assert_eq!(Detector::default().rule_types(), AnomalyType::ALL.to_vec());
    }

    fn arbitrary_step() -> impl Strategy<Value = (usize, u8, usize, i64, bool)> {
        (0_usize..3, 0_u8..7, 0_usize..3, -5_i64..5, any::<bool>())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn detection_is_deterministic_and_order_insensitive(
            steps in proptest::collection::vec(arbitrary_step(), 0..40)
        ) {
            let actors = ["T1", "T2", "T3"];
            let keys = ["A", "B", "C"];
            let mut builder = TraceBuilder::new();
            for (actor, op, key, value, flag) in steps {
                let tx = actors[actor];
                let key = keys[key];
                match op {
                    0 => builder.begin(tx),
                    1 if flag => builder.dirty_read(tx, key, value),
                    1 => builder.read(tx, key, value),
                    2 => builder.write(tx, key, flag.then_some(value + 1), value),
                    3 => builder.aggregate(tx, AggregateRead::sum_of(&["A", "B"]), value),
                    4 => builder.aggregate(tx, AggregateRead::count_all(), value),
                    5 => builder.commit(tx),
                    _ => {
                        let reason = if flag {
                            FailureReason::Deadlock
                        } else {
                            FailureReason::Scripted
                        };
                        builder.rollback(tx, reason)
                    }
                };
            }
            let events = builder.build();
            let first = detect(&events);
            prop_assert_eq!(&first, &detect(&events));

            let mut reversed = events.clone();
            reversed.reverse();
            prop_assert_eq!(&first, &detect(&reversed));
        }
    }
}
