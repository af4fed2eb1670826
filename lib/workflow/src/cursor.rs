//! The instance cursor: live threads and parallel frames.
//!
//! A thread is one path of advancement; the main thread starts at the entry
//! step. Forking a parallel step parks the parent thread and starts one
//! thread per child. Writes made inside a branch land in the branch's staging
//! map and reach the parent scope only when the frame joins, namespaced as
//! `<parallel step>.<child step>`.

use crate::instance::InstanceStatus;
use crate::step::{JoinMode, StepId};
use crate::wait::WaitKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub u32);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ThreadState {
    /// Runnable once `not_before` has passed.
    Ready { not_before: Option<DateTime<Utc>> },
    /// Suspended on a pending wait.
    Waiting { kind: WaitKind },
    /// Parked until the frame it forked settles.
    Forked { frame: FrameId },
}

/// Membership of a thread in a parallel frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRef {
    pub frame: FrameId,
    pub branch: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    /// The step this thread executes next, or is suspended on.
    pub step: StepId,
    /// One-based attempt number for `step`.
    pub attempt: u32,
    pub branch: Option<BranchRef>,
    pub state: ThreadState,
}

impl Thread {
    #[must_use]
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, ThreadState::Ready { not_before } if not_before.is_none_or(|t| t <= now))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// The first step of the branch.
    pub child: StepId,
    pub status: BranchStatus,
    /// Variables written by the branch, not yet visible to its parent.
    pub staging: Map<String, JsonValue>,
}

/// Bookkeeping of one parallel fork.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: FrameId,
    /// The parallel step that forked.
    pub step: StepId,
    pub join: StepId,
    pub mode: JoinMode,
    pub parent: ThreadId,
    pub branches: Vec<Branch>,
}

/// How a branch settling affected its frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Other branches are still running.
    Open,
    /// The frame joined; the parent thread now stands on the join step.
    Joined {
        frame: Frame,
        merged: JsonValue,
        cancelled: Vec<Thread>,
    },
    /// The frame failed; the parent thread is still parked on the parallel step.
    Failed { frame: Frame, cancelled: Vec<Thread> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    threads: Vec<Thread>,
    frames: Vec<Frame>,
    next_thread: u32,
    next_frame: u32,
}

impl Cursor {
    /// A cursor with a single thread at `entry`.
    #[must_use]
    pub fn start(entry: StepId) -> Self {
        let mut cursor = Self::default();
        cursor.spawn(entry, None);
        cursor
    }

    fn spawn(&mut self, step: StepId, branch: Option<BranchRef>) -> ThreadId {
        let id = ThreadId(self.next_thread);
        self.next_thread += 1;
        self.threads.push(Thread {
            id,
            step,
            attempt: 1,
            branch,
            state: ThreadState::Ready { not_before: None },
        });
        id
    }

    #[must_use]
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    #[must_use]
    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.iter().find(|t| t.id == id)
    }

    fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| t.id == id)
    }

    #[must_use]
    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.iter().find(|f| f.id == id)
    }

    fn frame_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.frames.iter_mut().find(|f| f.id == id)
    }

    /// The thread suspended on `step`, if any.
    #[must_use]
    pub fn waiting_on(&self, step: &StepId) -> Option<&Thread> {
        self.threads
            .iter()
            .find(|t| &t.step == step && matches!(t.state, ThreadState::Waiting { .. }))
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.threads.is_empty()
    }

    /// Threads that may execute a step at `now`, in creation order.
    #[must_use]
    pub fn runnable(&self, now: DateTime<Utc>) -> Vec<ThreadId> {
        self.threads
            .iter()
            .filter(|t| t.is_runnable(now))
            .map(|t| t.id)
            .collect()
    }

    /// Earliest time a ready thread may run.
    #[must_use]
    pub fn ready_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.threads
            .iter()
            .filter_map(|t| match t.state {
                ThreadState::Ready { not_before } => Some(not_before.unwrap_or(now)),
                _ => None,
            })
            .min()
    }

    /// The status implied by the live threads.
    #[must_use]
    pub fn status(&self) -> InstanceStatus {
        let mut waiting = None;
        for thread in &self.threads {
            match thread.state {
                ThreadState::Ready { .. } => return InstanceStatus::Running,
                ThreadState::Waiting {
                    kind: WaitKind::Approval,
                } => {
                    waiting.get_or_insert(InstanceStatus::WaitingApproval);
                }
                ThreadState::Waiting { .. } => waiting = Some(InstanceStatus::WaitingEvent),
                ThreadState::Forked { .. } => {}
            }
        }
        match waiting {
            Some(status) => status,
            None if self.threads.is_empty() => InstanceStatus::Succeeded,
            None => InstanceStatus::Running,
        }
    }

    /// Moves a thread to a new step with a fresh attempt count.
    pub fn move_to(&mut self, id: ThreadId, step: StepId) {
        if let Some(thread) = self.thread_mut(id) {
            thread.step = step;
            thread.attempt = 1;
            thread.state = ThreadState::Ready { not_before: None };
        }
    }

    /// Schedules the next attempt of the thread's current step.
    pub fn retry_at(&mut self, id: ThreadId, not_before: DateTime<Utc>) {
        if let Some(thread) = self.thread_mut(id) {
            thread.attempt += 1;
            thread.state = ThreadState::Ready {
                not_before: Some(not_before),
            };
        }
    }

    pub fn suspend(&mut self, id: ThreadId, kind: WaitKind) {
        if let Some(thread) = self.thread_mut(id) {
            thread.state = ThreadState::Waiting { kind };
        }
    }

    pub fn remove_thread(&mut self, id: ThreadId) -> Option<Thread> {
        let index = self.threads.iter().position(|t| t.id == id)?;
        Some(self.threads.remove(index))
    }

    /// Parks `parent` on a new frame and starts one thread per child.
    pub fn fork(
        &mut self,
        parent: ThreadId,
        step: StepId,
        children: &[StepId],
        join: StepId,
        mode: JoinMode,
    ) -> Vec<ThreadId> {
        let frame = FrameId(self.next_frame);
        self.next_frame += 1;
        self.frames.push(Frame {
            id: frame,
            step,
            join,
            mode,
            parent,
            branches: children
                .iter()
                .map(|child| Branch {
                    child: child.clone(),
                    status: BranchStatus::Running,
                    staging: Map::new(),
                })
                .collect(),
        });
        if let Some(thread) = self.thread_mut(parent) {
            thread.state = ThreadState::Forked { frame };
        }
        children
            .iter()
            .enumerate()
            .map(|(branch, child)| self.spawn(child.clone(), Some(BranchRef { frame, branch })))
            .collect()
    }

    /// Branch memberships from the outermost frame inwards.
    fn lineage(&self, id: ThreadId) -> Vec<BranchRef> {
        let mut chain = Vec::new();
        let mut current = self.thread(id).and_then(|t| t.branch);
        while let Some(branch) = current {
            chain.push(branch);
            current = self
                .frame(branch.frame)
                .and_then(|frame| self.thread(frame.parent))
                .and_then(|parent| parent.branch);
        }
        chain.reverse();
        chain
    }

    /// The variables a thread sees: the root bag overlaid with the staging of
    /// every enclosing branch.
    #[must_use]
    pub fn scope(&self, id: ThreadId, root: &JsonValue) -> JsonValue {
        let mut scope = root.as_object().cloned().unwrap_or_default();
        for branch in self.lineage(id) {
            if let Some(staging) = self
                .frame(branch.frame)
                .and_then(|frame| frame.branches.get(branch.branch))
                .map(|b| &b.staging)
            {
                scope.extend(staging.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        JsonValue::Object(scope)
    }

    /// Writes one variable into the thread's scope.
    pub fn write(&mut self, id: ThreadId, key: &str, value: JsonValue, root: &mut JsonValue) {
        let target = self.thread(id).and_then(|t| t.branch);
        match target {
            Some(branch) => {
                if let Some(b) = self
                    .frame_mut(branch.frame)
                    .and_then(|frame| frame.branches.get_mut(branch.branch))
                {
                    b.staging.insert(key.to_string(), value);
                }
            }
            None => {
                if !root.is_object() {
                    *root = JsonValue::Object(Map::new());
                }
                if let Some(map) = root.as_object_mut() {
                    map.insert(key.to_string(), value);
                }
            }
        }
    }

    /// Frames and threads nested under `frame`, including its own members.
    fn descendants(&self, frame: FrameId) -> (Vec<ThreadId>, Vec<FrameId>) {
        let mut frames = vec![frame];
        let mut threads = Vec::new();
        let mut next = 0;
        while next < frames.len() {
            let current = frames[next];
            for thread in self
                .threads
                .iter()
                .filter(|t| t.branch.is_some_and(|b| b.frame == current))
            {
                threads.push(thread.id);
                if let ThreadState::Forked { frame } = thread.state {
                    frames.push(frame);
                }
            }
            next += 1;
        }
        (threads, frames)
    }

    /// Records a branch's final status and settles its frame when possible.
    ///
    /// The branch's own thread must already be removed. Settling a frame
    /// removes every remaining thread and nested frame under it and returns
    /// the removed threads so the caller can cancel their work.
    pub fn settle_branch(
        &mut self,
        branch: BranchRef,
        status: BranchStatus,
        root: &mut JsonValue,
    ) -> FrameOutcome {
        let Some(frame) = self.frame_mut(branch.frame) else {
            return FrameOutcome::Open;
        };
        if let Some(b) = frame.branches.get_mut(branch.branch) {
            b.status = status;
        }

        let statuses: Vec<_> = frame.branches.iter().map(|b| b.status).collect();
        let all = |wanted: BranchStatus| statuses.iter().all(|s| *s == wanted);
        let joined = match (frame.mode, status) {
            (JoinMode::All, BranchStatus::Succeeded) if all(BranchStatus::Succeeded) => true,
            (JoinMode::FirstSuccess, BranchStatus::Succeeded) => true,
            (JoinMode::All, BranchStatus::Failed | BranchStatus::Cancelled) => false,
            (JoinMode::FirstSuccess, BranchStatus::Failed | BranchStatus::Cancelled)
                if all(BranchStatus::Failed) =>
            {
                false
            }
            _ => return FrameOutcome::Open,
        };

        let (threads, frames) = self.descendants(branch.frame);
        let cancelled: Vec<Thread> = threads
            .into_iter()
            .filter_map(|id| self.remove_thread(id))
            .collect();
        self.frames
            .retain(|f| f.id == branch.frame || !frames.contains(&f.id));

        let Some(index) = self.frames.iter().position(|f| f.id == branch.frame) else {
            return FrameOutcome::Open;
        };
        let mut frame = self.frames.remove(index);
        for b in &mut frame.branches {
            if b.status == BranchStatus::Running {
                b.status = BranchStatus::Cancelled;
            }
        }

        if !joined {
            return FrameOutcome::Failed { frame, cancelled };
        }

        let merged: Map<String, JsonValue> = frame
            .branches
            .iter()
            .filter(|b| b.status == BranchStatus::Succeeded)
            .map(|b| (b.child.to_string(), JsonValue::Object(b.staging.clone())))
            .collect();
        let merged = JsonValue::Object(merged);
        self.write(frame.parent, frame.step.as_str(), merged.clone(), root);
        self.move_to(frame.parent, frame.join.clone());
        FrameOutcome::Joined {
            frame,
            merged,
            cancelled,
        }
    }
}
