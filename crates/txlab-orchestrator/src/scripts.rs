use std::time::Duration;

use txlab_domain::{AggregateRead, ScenarioKind};

use crate::actor::{Actor, Script, StepResult};
use crate::{ScenarioRequest, T1, T2};

/// Accounts the write-skew constraint spans.
pub(crate) const WRITE_SKEW_SCOPE: [&str; 2] = ["A", "B"];

/// Account inserted by the phantom-read writer.
pub(crate) const PHANTOM_ACCOUNT: &str = "D";

const fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Scripts for T1 and T2, in that order.
pub(crate) fn scripts_for(kind: ScenarioKind) -> [Script; 2] {
    match kind {
        ScenarioKind::LostUpdate => [lost_update_t1, lost_update_t2],
        ScenarioKind::DirtyRead => [dirty_read_t1, dirty_read_t2],
        ScenarioKind::NonRepeatableRead => [non_repeatable_read_t1, non_repeatable_read_t2],
        ScenarioKind::PhantomRead => [phantom_read_t1, phantom_read_t2],
        ScenarioKind::WriteSkew => [write_skew_t1, write_skew_t2],
        ScenarioKind::Deadlock => [deadlock_t1, deadlock_t2],
    }
}

// Both actors read A, then each overwrites it with its own operand.
fn lost_update_t1(actor: &mut Actor<'_>, request: &ScenarioRequest) -> StepResult<()> {
    actor.begin();
    let seen = actor.read("A")?;
    actor.reach("read");
    actor.gate(T2, "read", ms(100));
    actor.write("A", seen, request.operand_a)?;
    actor.note("written", Some(request.operand_a));
    actor.reach("write");
    actor.pause(ms(100));
    actor.commit()
}

fn lost_update_t2(actor: &mut Actor<'_>, request: &ScenarioRequest) -> StepResult<()> {
    actor.gate(T1, "read", ms(50));
    actor.begin();
    let seen = actor.read("A")?;
    actor.reach("read");
    actor.gate(T1, "write", ms(150));
    actor.write("A", seen, request.operand_b)?;
    actor.note("written", Some(request.operand_b));
    actor.commit()
}

// T1 writes A and rolls back only after T2 has read it.
fn dirty_read_t1(actor: &mut Actor<'_>, request: &ScenarioRequest) -> StepResult<()> {
    actor.begin();
    let seen = actor.read("A")?;
    actor.write("A", seen, request.operand_a)?;
    actor.reach("write");
    actor.gate(T2, "read", ms(200));
    actor.rollback_scripted("rolled back after the peer read the pending value")
}

fn dirty_read_t2(actor: &mut Actor<'_>, _request: &ScenarioRequest) -> StepResult<()> {
    actor.gate(T1, "write", ms(100));
    actor.begin();
    let value = actor.read("A")?;
    actor.note("read", value);
    actor.reach("read");
    actor.commit()
}

// T1 reads A twice around T2's committed update.
fn non_repeatable_read_t1(actor: &mut Actor<'_>, _request: &ScenarioRequest) -> StepResult<()> {
    actor.begin();
    let first = actor.read("A")?;
    actor.note("first_read", first);
    actor.reach("first_read");
    actor.gate(T2, "commit", ms(200));
    let second = actor.read("A")?;
    actor.note("second_read", second);
    actor.commit()
}

fn non_repeatable_read_t2(actor: &mut Actor<'_>, request: &ScenarioRequest) -> StepResult<()> {
    actor.gate(T1, "first_read", ms(100));
    actor.begin();
    let seen = actor.read("A")?;
    actor.write("A", seen, request.operand_b)?;
    actor.commit()?;
    actor.reach("commit");
    Ok(())
}

// T1 counts the table twice around T2's committed insert.
fn phantom_read_t1(actor: &mut Actor<'_>, _request: &ScenarioRequest) -> StepResult<()> {
    actor.begin();
    let first = actor.aggregate(AggregateRead::count_all())?;
    actor.note("first_count", first);
    actor.reach("first_count");
    actor.gate(T2, "commit", ms(200));
    let second = actor.aggregate(AggregateRead::count_all())?;
    actor.note("second_count", second);
    actor.commit()
}

fn phantom_read_t2(actor: &mut Actor<'_>, request: &ScenarioRequest) -> StepResult<()> {
    actor.gate(T1, "first_count", ms(100));
    actor.begin();
    actor.insert(PHANTOM_ACCOUNT, request.operand_b)?;
    actor.commit()?;
    actor.reach("commit");
    Ok(())
}

// Both actors check A + B, then each updates a different account.
fn write_skew_t1(actor: &mut Actor<'_>, request: &ScenarioRequest) -> StepResult<()> {
    actor.begin();
    let total = actor.aggregate(AggregateRead::sum_of(&WRITE_SKEW_SCOPE))?;
    actor.note("read_total", total);
    actor.reach("sum");
    actor.gate(T2, "sum", ms(50));
    let seen = actor.peek("A")?;
    actor.write("A", seen, request.operand_a)?;
    actor.pause(ms(100));
    actor.commit()
}

fn write_skew_t2(actor: &mut Actor<'_>, request: &ScenarioRequest) -> StepResult<()> {
    actor.gate(T1, "sum", ms(30));
    actor.begin();
    let total = actor.aggregate(AggregateRead::sum_of(&WRITE_SKEW_SCOPE))?;
    actor.note("read_total", total);
    actor.reach("sum");
    let seen = actor.peek("B")?;
    actor.write("B", seen, request.operand_b)?;
    actor.commit()
}

// Opposite lock order on A and B.
fn deadlock_t1(actor: &mut Actor<'_>, request: &ScenarioRequest) -> StepResult<()> {
    actor.begin();
    let a = actor.read_for_update("A")?;
    actor.reach("lock_a");
    actor.gate(T2, "lock_b", ms(100));
    let b = actor.read_for_update("B")?;
    actor.write("A", a, request.operand_a)?;
    actor.write("B", b, request.operand_a)?;
    actor.commit()
}

fn deadlock_t2(actor: &mut Actor<'_>, request: &ScenarioRequest) -> StepResult<()> {
    actor.gate(T1, "lock_a", ms(50));
    actor.begin();
    let b = actor.read_for_update("B")?;
    actor.reach("lock_b");
    actor.pause(ms(100));
    let a = actor.read_for_update("A")?;
    actor.write("A", a, request.operand_b)?;
    actor.write("B", b, request.operand_b)?;
    actor.commit()
}
