//! Start/finish pairing and exception nesting checks.
//!
//! Callbacks arrive on many threads at once, so open pairs live in a `DashSet`
//! and exception frames in a `DashMap` keyed by the delivering thread. Neither
//! structure is held across a callback, so no callback waits on another.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use dashmap::{DashMap, DashSet};
use thiserror::Error;

use clrscope_common::FunctionId;

use super::events::{PairKind, Pairing, StackKind, Subject};

/// Broken start/finish or enter/leave ordering
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceViolation {
    #[error("{kind} started twice for {subject} without finishing")]
    AlreadyOpen { kind: PairKind, subject: Subject },

    #[error("{kind} finished for {subject} which was never started")]
    NotOpen { kind: PairKind, subject: Subject },

    #[error(
        "{kind} leave does not match the innermost frame ({})",
        .innermost.map_or_else(|| "none".to_string(), |k| k.to_string())
    )]
    UnmatchedLeave { kind: StackKind, innermost: Option<StackKind> },
}

/// Resolved key of an open pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenSubject {
    Id(u64),
    Runtime,
    Thread(thread::ThreadId),
}

impl OpenSubject {
    fn resolve(subject: Subject) -> Self {
        match subject {
            Subject::Id(id) => OpenSubject::Id(id),
            Subject::Runtime => OpenSubject::Runtime,
            Subject::CurrentThread => OpenSubject::Thread(thread::current().id()),
        }
    }
}

impl fmt::Display for OpenSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenSubject::Id(id) => write!(f, "0x{id:x}"),
            OpenSubject::Runtime => write!(f, "runtime"),
            OpenSubject::Thread(id) => write!(f, "{id:?}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct PairingTracker {
    open: DashSet<(PairKind, OpenSubject)>,
    frames: DashMap<thread::ThreadId, Vec<(StackKind, FunctionId)>>,
    /// Attach mode: the sink may have missed the start of anything in flight
    tolerate_orphans: AtomicBool,
}

impl PairingTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tolerate_orphans(&self, tolerate: bool) {
        self.tolerate_orphans.store(tolerate, Ordering::Release);
    }

    #[must_use]
    pub fn tolerates_orphans(&self) -> bool {
        self.tolerate_orphans.load(Ordering::Acquire)
    }

    /// Record one pairing step.
    ///
    /// # Errors
    /// Returns the violation; the step is still recorded where that makes the
    /// following events checkable (a duplicate start keeps the pair open).
    pub fn observe(&self, pairing: Pairing) -> Result<(), SequenceViolation> {
        match pairing {
            Pairing::Open(kind, subject) => {
                if self.open.insert((kind, OpenSubject::resolve(subject))) {
                    Ok(())
                } else {
                    Err(SequenceViolation::AlreadyOpen { kind, subject })
                }
            }
            Pairing::Close(kind, subject) => {
                if self.open.remove(&(kind, OpenSubject::resolve(subject))).is_some()
                    || self.tolerates_orphans()
                {
                    Ok(())
                } else {
                    Err(SequenceViolation::NotOpen { kind, subject })
                }
            }
            Pairing::Enter(kind, function) => {
                self.frames.entry(thread::current().id()).or_default().push((kind, function));
                Ok(())
            }
            Pairing::Leave(kind) => self.leave(kind),
        }
    }

    fn leave(&self, kind: StackKind) -> Result<(), SequenceViolation> {
        let tid = thread::current().id();
        let (result, emptied) = match self.frames.get_mut(&tid) {
            Some(mut stack) => {
                let result = Self::pop_frame(&mut stack, kind, self.tolerates_orphans());
                (result, stack.is_empty())
            }
            None => (Self::pop_frame(&mut Vec::new(), kind, self.tolerates_orphans()), false),
        };
        // Only the delivering thread touches its own stack
        if emptied {
            self.frames.remove_if(&tid, |_, stack| stack.is_empty());
        }
        result
    }

    fn pop_frame(
        stack: &mut Vec<(StackKind, FunctionId)>,
        kind: StackKind,
        tolerate_orphans: bool,
    ) -> Result<(), SequenceViolation> {
        let innermost = stack.last().map(|(k, _)| *k);
        if innermost == Some(kind) {
            stack.pop();
            return Ok(());
        }

        // A frame entered before attach has no record at all
        let never_entered = !stack.iter().any(|(k, _)| *k == kind);
        if never_entered && tolerate_orphans {
            return Ok(());
        }
        Err(SequenceViolation::UnmatchedLeave { kind, innermost })
    }

    /// Drop the exception frames and remoting pairs of the calling thread.
    ///
    /// Returns how many frames were still open.
    pub fn forget_current_thread(&self) -> usize {
        let tid = thread::current().id();
        self.open.retain(|(_, subject)| *subject != OpenSubject::Thread(tid));
        self.frames.remove(&tid).map_or(0, |(_, stack)| stack.len())
    }

    /// Pairs started but not finished
    #[must_use]
    pub fn outstanding(&self) -> Vec<(PairKind, OpenSubject)> {
        self.open.iter().map(|entry| *entry.key()).collect()
    }

    /// Exception frames entered but not left, over all threads
    #[must_use]
    pub fn open_frames(&self) -> usize {
        self.frames.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn clear(&self) {
        self.open.clear();
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn open(kind: PairKind, id: u64) -> Pairing {
        Pairing::Open(kind, Subject::Id(id))
    }

    fn close(kind: PairKind, id: u64) -> Pairing {
        Pairing::Close(kind, Subject::Id(id))
    }

    #[test]
    fn test_interleaved_subjects() {
        let tracker = PairingTracker::new();
        tracker.observe(open(PairKind::ClassLoad, 1)).unwrap();
        tracker.observe(open(PairKind::ClassLoad, 2)).unwrap();
        tracker.observe(open(PairKind::JitCompilation, 1)).unwrap();
        assert_eq!(tracker.outstanding().len(), 3);

        tracker.observe(close(PairKind::ClassLoad, 2)).unwrap();
        tracker.observe(close(PairKind::JitCompilation, 1)).unwrap();
        tracker.observe(close(PairKind::ClassLoad, 1)).unwrap();
        assert!(tracker.outstanding().is_empty());
    }

    #[test]
    fn test_duplicate_start_is_detected() {
        let tracker = PairingTracker::new();
        tracker.observe(open(PairKind::ModuleLoad, 9)).unwrap();
        let err = tracker.observe(open(PairKind::ModuleLoad, 9)).unwrap_err();
        assert_eq!(
            err,
            SequenceViolation::AlreadyOpen { kind: PairKind::ModuleLoad, subject: Subject::Id(9) }
        );
        assert_eq!(tracker.outstanding(), vec![(PairKind::ModuleLoad, OpenSubject::Id(9))]);
    }

    #[test]
    fn test_orphan_finish() {
        let tracker = PairingTracker::new();
        assert!(matches!(
            tracker.observe(close(PairKind::AssemblyLoad, 3)),
            Err(SequenceViolation::NotOpen { .. })
        ));

        tracker.set_tolerate_orphans(true);
        tracker.observe(close(PairKind::AssemblyLoad, 3)).unwrap();
    }

    #[test]
    fn test_suspend_abort_without_start() {
        let tracker = PairingTracker::new();
        let abort = Pairing::Close(PairKind::RuntimeSuspend, Subject::Runtime);
        let err = tracker.observe(abort).unwrap_err();
        assert!(err.to_string().contains("RuntimeSuspend"));
    }

    #[test]
    fn test_exception_frames_nest() {
        let tracker = PairingTracker::new();
        tracker.observe(Pairing::Enter(StackKind::SearchFunction, FunctionId(1))).unwrap();
        tracker.observe(Pairing::Enter(StackKind::SearchFilter, FunctionId(1))).unwrap();
        assert_eq!(tracker.open_frames(), 2);

        let err = tracker.observe(Pairing::Leave(StackKind::SearchFunction)).unwrap_err();
        assert_eq!(
            err,
            SequenceViolation::UnmatchedLeave {
                kind: StackKind::SearchFunction,
                innermost: Some(StackKind::SearchFilter)
            }
        );

        tracker.observe(Pairing::Leave(StackKind::SearchFilter)).unwrap();
        tracker.observe(Pairing::Leave(StackKind::SearchFunction)).unwrap();
        assert_eq!(tracker.open_frames(), 0);
    }

    #[test]
    fn test_frames_are_per_thread() {
        let tracker = Arc::new(PairingTracker::new());
        tracker.observe(Pairing::Enter(StackKind::Catcher, FunctionId(5))).unwrap();

        let other = Arc::clone(&tracker);
        let result = std::thread::spawn(move || other.observe(Pairing::Leave(StackKind::Catcher)))
            .join()
            .unwrap();
        assert!(result.is_err());

        tracker.observe(Pairing::Leave(StackKind::Catcher)).unwrap();
    }

    #[test]
    fn test_attach_mode_tolerates_unentered_leave_only() {
        let tracker = PairingTracker::new();
        tracker.set_tolerate_orphans(true);
        tracker.observe(Pairing::Leave(StackKind::UnwindFinally)).unwrap();

        tracker.observe(Pairing::Enter(StackKind::UnwindFunction, FunctionId(2))).unwrap();
        tracker.observe(Pairing::Enter(StackKind::UnwindFinally, FunctionId(2))).unwrap();
        assert!(tracker.observe(Pairing::Leave(StackKind::UnwindFunction)).is_err());
    }

    #[test]
    fn test_balanced_frames_leave_no_thread_state() {
        let tracker = PairingTracker::new();
        tracker.observe(Pairing::Enter(StackKind::Catcher, FunctionId(5))).unwrap();
        tracker.observe(Pairing::Leave(StackKind::Catcher)).unwrap();
        assert!(tracker.frames.is_empty());

        // An unmatched leave on a thread with no frames creates no entry either
        assert!(tracker.observe(Pairing::Leave(StackKind::Catcher)).is_err());
        assert!(tracker.frames.is_empty());
    }

    #[test]
    fn test_forget_current_thread() {
        let tracker = Arc::new(PairingTracker::new());
        tracker.observe(Pairing::Enter(StackKind::SearchFunction, FunctionId(1))).unwrap();
        tracker.observe(Pairing::Enter(StackKind::SearchFilter, FunctionId(1))).unwrap();
        tracker.observe(Pairing::Open(PairKind::RemotingClient, Subject::CurrentThread)).unwrap();
        tracker.observe(open(PairKind::ClassLoad, 4)).unwrap();

        let other = Arc::clone(&tracker);
        let forgotten = std::thread::spawn(move || other.forget_current_thread()).join().unwrap();
        assert_eq!(forgotten, 0);
        assert_eq!(tracker.open_frames(), 2);

        assert_eq!(tracker.forget_current_thread(), 2);
        assert!(tracker.frames.is_empty());
        assert_eq!(tracker.outstanding(), vec![(PairKind::ClassLoad, OpenSubject::Id(4))]);
    }
}
