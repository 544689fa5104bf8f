use std::collections::VecDeque;

use super::task::TaskKind;

pub(crate) type TaskId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Waiting,
    Ready,
    Dispatched,
    Done,
}

#[derive(Debug)]
struct Entry {
    kind: TaskKind,
    deps: Vec<TaskId>,
    /// Tasks waiting on the group this entry leads.
    dependents: Vec<TaskId>,
    awaiting: usize,
    tolerant: bool,
    broken: bool,
    failed: bool,
    state: EntryState,
    /// Group this task belongs to; `None` for leaders.
    leader: Option<TaskId>,
    /// Unfinished members of the group, the leader included.
    open: usize,
    group_failed: bool,
    /// Member whose completion closed the group.
    closed_by: Option<TaskId>,
}

/// Dependency tracking for scheduled tasks.
///
/// A task becomes ready once every group it depends on has completed. A
/// group is a leader task plus the tasks added as joint to it: consumers of
/// the leader only proceed once the whole group is done, which lets a
/// restore fall back to a run without its dependents noticing.
#[derive(Debug, Default)]
pub(crate) struct RunQueue {
    entries: Vec<Entry>,
    ready: VecDeque<TaskId>,
    activation: Vec<TaskId>,
    unfinished: usize,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn leader_of(&self, id: TaskId) -> TaskId {
        self.entries[id].leader.unwrap_or(id)
    }

    fn group_done(&self, leader: TaskId) -> bool {
        self.entries[leader].open == 0
    }

    /// Registers a task depending on `deps`. With `joint`, the task joins
    /// the group of that task instead of forming its own.
    pub(crate) fn add(
        &mut self,
        kind: TaskKind,
        deps: &[TaskId],
        joint: Option<TaskId>,
        tolerant: bool,
    ) -> TaskId {
        let id = self.entries.len();
        let leader = joint.map(|j| self.leader_of(j));
        if let Some(leader) = leader {
            self.entries[leader].open += 1;
        }

        let mut awaiting = 0;
        let mut broken = false;
        let mut resolved = Vec::with_capacity(deps.len());
        for &dep in deps {
            let dep = self.leader_of(dep);
            if resolved.contains(&dep) {
                continue;
            }
            resolved.push(dep);
            if self.group_done(dep) {
                broken |= self.entries[dep].group_failed;
            } else {
                awaiting += 1;
                self.entries[dep].dependents.push(id);
            }
        }

        self.entries.push(Entry {
            kind,
            deps: resolved,
            dependents: Vec::new(),
            awaiting,
            tolerant,
            broken,
            failed: false,
            state: EntryState::Waiting,
            leader,
            open: if leader.is_some() { 0 } else { 1 },
            group_failed: false,
            closed_by: None,
        });
        self.unfinished += 1;

        if awaiting == 0 {
            self.make_ready(id);
        }
        id
    }

    fn make_ready(&mut self, id: TaskId) {
        self.entries[id].state = EntryState::Ready;
        self.ready.push_back(id);
    }

    /// Ready tasks in the order they became ready.
    pub(crate) fn take_ready(&mut self) -> Vec<TaskId> {
        let ready: Vec<_> = self.ready.drain(..).collect();
        for &id in &ready {
            self.entries[id].state = EntryState::Dispatched;
            self.activation.push(id);
        }
        ready
    }

    pub(crate) fn kind(&self, id: TaskId) -> &TaskKind {
        &self.entries[id].kind
    }

    pub(crate) fn deps(&self, id: TaskId) -> &[TaskId] {
        &self.entries[id].deps
    }

    /// Tasks that actually released `id`: for each dependency group, the
    /// member that finished last.
    pub(crate) fn released_by(&self, id: TaskId) -> Vec<TaskId> {
        self.entries[id]
            .deps
            .iter()
            .map(|&leader| self.entries[leader].closed_by.unwrap_or(leader))
            .collect()
    }

    /// A dependency failed and the task does not tolerate it.
    pub(crate) fn is_broken(&self, id: TaskId) -> bool {
        let entry = &self.entries[id];
        entry.broken && !entry.tolerant
    }

    pub(crate) fn has_failed(&self, id: TaskId) -> bool {
        self.entries[id].failed
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.unfinished == 0
    }

    /// Marks a dispatched task done, releasing dependents of its group once
    /// every member has finished.
    pub(crate) fn complete(&mut self, id: TaskId, failed: bool) {
        if self.entries[id].state == EntryState::Done {
            return;
        }
        self.entries[id].state = EntryState::Done;
        self.entries[id].failed = failed;
        self.unfinished -= 1;

        let leader = self.leader_of(id);
        let group = &mut self.entries[leader];
        group.group_failed |= failed;
        group.open -= 1;
        if group.open > 0 {
            return;
        }
        group.closed_by = Some(id);

        let group_failed = group.group_failed;
        let dependents = std::mem::take(&mut group.dependents);
        for dependent in dependents {
            let entry = &mut self.entries[dependent];
            entry.broken |= group_failed;
            entry.awaiting -= 1;
            if entry.awaiting == 0 && entry.state == EntryState::Waiting {
                self.make_ready(dependent);
            }
        }
    }

    /// Takes every task that has not finished yet, used at shutdown to
    /// account for work that will never run.
    pub(crate) fn dispatch_all(&mut self) -> Vec<TaskId> {
        self.ready.clear();
        let pending: Vec<TaskId> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e.state, EntryState::Waiting | EntryState::Ready))
            .map(|(id, _)| id)
            .collect();
        for &id in &pending {
            self.entries[id].state = EntryState::Done;
            self.entries[id].failed = true;
            self.unfinished -= 1;
        }
        pending
    }

    /// Task ids in the order they were handed out.
    pub(crate) fn replay(&self) -> &[TaskId] {
        &self.activation
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind() -> TaskKind {
        TaskKind::CompactCache
    }

    #[test]
    fn dependents_wait_for_completion() {
        let mut queue = RunQueue::new();
        let a = queue.add(kind(), &[], None, false);
        let b = queue.add(kind(), &[a], None, false);
        let c = queue.add(kind(), &[a, b], None, false);

        assert_eq!(queue.take_ready(), vec![a]);
        queue.complete(a, false);
        assert_eq!(queue.take_ready(), vec![b]);
        queue.complete(b, false);
        assert_eq!(queue.take_ready(), vec![c]);
        queue.complete(c, false);
        assert!(queue.is_finished());
        assert_eq!(queue.replay(), &[a, b, c]);
    }

    #[test]
    fn joint_member_holds_back_the_group() {
        let mut queue = RunQueue::new();
        let restore = queue.add(kind(), &[], None, false);
        let consumer = queue.add(kind(), &[restore], None, false);
        assert_eq!(queue.take_ready(), vec![restore]);

        let run = queue.add(kind(), &[], Some(restore), false);
        queue.complete(restore, false);
        assert_eq!(queue.take_ready(), vec![run]);

        queue.complete(run, false);
        assert_eq!(queue.take_ready(), vec![consumer]);
    }

    #[test]
    fn fallback_run_releases_consumer() {
        let mut queue = RunQueue::new();
        let restore = queue.add(kind(), &[], None, false);
        let consumer = queue.add(kind(), &[restore], None, false);
        queue.take_ready();
        let run = queue.add(kind(), &[], Some(restore), false);
        queue.complete(restore, false);
        queue.take_ready();
        queue.complete(run, false);
        queue.take_ready();

        assert_eq!(queue.deps(consumer), &[restore]);
        assert_eq!(queue.released_by(consumer), vec![run]);
    }

    #[test]
    fn failures_break_dependents_unless_tolerant() {
        let mut queue = RunQueue::new();
        let a = queue.add(kind(), &[], None, false);
        let strict = queue.add(kind(), &[a], None, false);
        let lenient = queue.add(kind(), &[a], None, true);
        queue.take_ready();
        queue.complete(a, true);

        let ready = queue.take_ready();
        assert_eq!(ready, vec![strict, lenient]);
        assert!(queue.is_broken(strict));
        assert!(!queue.is_broken(lenient));

        let late = queue.add(kind(), &[a], None, false);
        assert!(queue.is_broken(late));
    }

    #[test]
    fn failure_in_joint_member_breaks_consumers() {
        let mut queue = RunQueue::new();
        let restore = queue.add(kind(), &[], None, false);
        let consumer = queue.add(kind(), &[restore], None, false);
        queue.take_ready();
        let run = queue.add(kind(), &[], Some(restore), false);
        queue.complete(restore, false);
        queue.take_ready();
        queue.complete(run, true);
        assert_eq!(queue.take_ready(), vec![consumer]);
        assert!(queue.is_broken(consumer));
    }

    #[test]
    fn dispatch_all_drains_pending() {
        let mut queue = RunQueue::new();
        let a = queue.add(kind(), &[], None, false);
        let b = queue.add(kind(), &[a], None, false);
        assert_eq!(queue.dispatch_all(), vec![a, b]);
        assert!(queue.is_finished());
        assert!(queue.take_ready().is_empty());
    }
}
