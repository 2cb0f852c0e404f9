//! Reference auto-balance policy.
//!
//! Greedy and single pass: each unblocked task goes to the member with the
//! strictly lowest load, earliest member winning ties. The chosen member's
//! load is bumped before the next task is considered.

use crate::{AssignmentEvent, MemberRecord, TaskRecord};

pub fn auto_balance(tasks: &[TaskRecord], members: &[MemberRecord]) -> Vec<AssignmentEvent> {
    if members.is_empty() {
        return Vec::new();
    }

    let mut loads: Vec<u32> = members.iter().map(|m| m.load).collect();
    let mut assignments = Vec::new();

    for task in tasks.iter().filter(|t| !t.blocked) {
        let mut best = 0;
        for (idx, &load) in loads.iter().enumerate().skip(1) {
            if load < loads[best] {
                best = idx;
            }
        }
        loads[best] = loads[best].saturating_add(1);
        assignments.push(AssignmentEvent::new(
            task.id.clone(),
            members[best].key.clone(),
        ));
    }

    assignments
}
