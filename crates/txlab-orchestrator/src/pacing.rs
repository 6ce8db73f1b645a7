use std::collections::BTreeSet;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;
use txlab_domain::Pacing;

/// Named points actors signal while running their scripts.
///
/// A checkpoint counts as reached once its owner signalled it or once the
/// owner has finished for any reason, so a failed actor never strands its peer.
#[derive(Debug, Default)]
pub(crate) struct Checkpoints {
    state: Mutex<CheckpointState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct CheckpointState {
    reached: BTreeSet<(&'static str, &'static str)>,
    finished: BTreeSet<&'static str>,
}

impl Checkpoints {
    fn reach(&self, actor: &'static str, step: &'static str) {
        self.state.lock().reached.insert((actor, step));
        self.changed.notify_all();
    }

    fn finish(&self, actor: &'static str) {
        self.state.lock().finished.insert(actor);
        self.changed.notify_all();
    }

    fn wait_for(&self, actor: &'static str, step: &'static str) {
        let mut state = self.state.lock();
        while !state.reached.contains(&(actor, step)) && !state.finished.contains(actor) {
            self.changed.wait(&mut state);
        }
    }
}

/// Marks an actor finished when dropped, including on unwind.
pub(crate) struct FinishGuard<'a> {
    checkpoints: &'a Checkpoints,
    actor: &'static str,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.checkpoints.finish(self.actor);
    }
}

/// One actor's view of the run's pacing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pacer<'a> {
    pacing: Pacing,
    checkpoints: &'a Checkpoints,
    actor: &'static str,
}

impl<'a> Pacer<'a> {
    pub(crate) fn new(pacing: Pacing, checkpoints: &'a Checkpoints, actor: &'static str) -> Self {
        Self {
            pacing,
            checkpoints,
            actor,
        }
    }

    pub(crate) fn finish_guard(&self) -> FinishGuard<'a> {
        FinishGuard {
            checkpoints: self.checkpoints,
            actor: self.actor,
        }
    }

    /// Signal that this actor passed `step`.
    pub(crate) fn reach(&self, step: &'static str) {
        debug!(actor = self.actor, step, "checkpoint reached");
        self.checkpoints.reach(self.actor, step);
    }

    /// Hold until `peer` passed `step` (rendezvous) or `delay` elapsed (timed).
    pub(crate) fn gate(&self, peer: &'static str, step: &'static str, delay: Duration) {
        match self.pacing {
            Pacing::Timed => std::thread::sleep(delay),
            Pacing::Rendezvous => {
                debug!(actor = self.actor, peer, step, "waiting for checkpoint");
                self.checkpoints.wait_for(peer, step);
            }
        }
    }

    /// Delay that only exists to bias timed runs.
    pub(crate) fn pause(&self, delay: Duration) {
        if self.pacing == Pacing::Timed {
            std::thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use txlab_domain::Pacing;

    use super::{Checkpoints, Pacer};

    #[test]
    fn gate_releases_on_reach() {
        let checkpoints = Checkpoints::default();
        let first = Pacer::new(Pacing::Rendezvous, &checkpoints, "T1");
        let second = Pacer::new(Pacing::Rendezvous, &checkpoints, "T2");
        std::thread::scope(|scope| {
            let waiter = scope.spawn(move || {
                second.gate("T1", "ready", Duration::ZERO);
                second.reach("done");
            });
            first.reach("ready");
            first.gate("T2", "done", Duration::ZERO);
            assert!(waiter.join().is_ok());
        });
    }

    #[test]
    fn finished_peer_counts_as_reached() {
        let checkpoints = Checkpoints::default();
        let first = Pacer::new(Pacing::Rendezvous, &checkpoints, "T1");
        let second = Pacer::new(Pacing::Rendezvous, &checkpoints, "T2");
        std::thread::scope(|scope| {
            let waiter = scope.spawn(move || second.gate("T1", "never", Duration::ZERO));
            drop(first.finish_guard());
            assert!(waiter.join().is_ok());
        });
    }
}
