/// Execution state tracking for the GDB session
///
/// Folds `*running`/`*stopped` exec records and thread notifications into
/// per-thread state, and classifies the stop that answers a pause request.

use std::collections::BTreeMap;
use tokio::sync::oneshot;

use crate::commands::ThreadInfo;
use crate::types::{AsyncClass, AsyncRecord, StopReason, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadState {
    pub id: u32,
    pub name: Option<String>,
    pub running: bool,
}

/// A parsed `*stopped` record
#[derive(Debug, Clone, PartialEq)]
pub struct StopEvent {
    pub reason: Option<StopReason>,
    pub thread_id: Option<u32>,
    pub all_threads_stopped: bool,
    pub breakpoint_number: Option<String>,
    pub exit_code: Option<i64>,
    pub signal_name: Option<String>,
    pub signal_meaning: Option<String>,
    pub record: AsyncRecord,
}

impl StopEvent {
    pub fn from_record(record: &AsyncRecord) -> Self {
        let stopped_threads = record.results.get("stopped-threads");
        let all_threads_stopped = match stopped_threads {
            Some(Value::String(s)) => s == "all",
            Some(_) => false,
            // All-stop GDBs often omit the field
            None => true,
        };

        StopEvent {
            reason: record.get_str("reason").and_then(StopReason::parse),
            thread_id: record.get_str("thread-id").and_then(|s| s.parse().ok()),
            all_threads_stopped,
            breakpoint_number: record.get_str("bkptno").map(str::to_string),
            // GDB prints exit codes in octal
            exit_code: record
                .get_str("exit-code")
                .and_then(|s| i64::from_str_radix(s, 8).ok()),
            signal_name: record.get_str("signal-name").map(str::to_string),
            signal_meaning: record.get_str("signal-meaning").map(str::to_string),
            record: record.clone(),
        }
    }

    fn stopped_thread_ids(&self) -> Vec<u32> {
        match self.record.results.get("stopped-threads") {
            Some(Value::List(ids)) => ids
                .iter()
                .filter_map(Value::as_string)
                .filter_map(|s| s.parse().ok())
                .collect(),
            _ => self.thread_id.into_iter().collect(),
        }
    }
}

/// How the stop that followed a pause request came about
#[derive(Debug, Clone, PartialEq)]
pub enum PauseOutcome {
    /// The stop was the interrupt itself
    Paused,
    /// A real stop won the race; the target must stay stopped
    RealStop(StopEvent),
    /// The inferior went away before stopping
    Exited,
}

/// What the event pump should do with a `*stopped` record
#[derive(Debug, Clone, PartialEq)]
pub enum StopDisposition {
    Report(StopEvent),
    /// Caused by an internal pause; never shown to the client
    Suppress,
}

struct PauseWaiter {
    thread_id: Option<u32>,
    sender: oneshot::Sender<PauseOutcome>,
}

/// Per-thread execution state
pub struct ExecutionTracker {
    threads: BTreeMap<u32, ThreadState>,
    non_stop: bool,
    pause_waiter: Option<PauseWaiter>,
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            non_stop: false,
            pause_waiter: None,
        }
    }

    pub fn set_non_stop(&mut self, non_stop: bool) {
        self.non_stop = non_stop;
    }

    /// Running means at least one known thread and none of them stopped
    pub fn is_running(&self) -> bool {
        !self.threads.is_empty() && self.threads.values().all(|t| t.running)
    }

    pub fn is_thread_running(&self, thread_id: u32) -> bool {
        self.threads.get(&thread_id).map(|t| t.running).unwrap_or(false)
    }

    pub fn threads(&self) -> Vec<ThreadState> {
        self.threads.values().cloned().collect()
    }

    pub fn thread_created(&mut self, thread_id: u32) {
        self.threads.entry(thread_id).or_insert(ThreadState {
            id: thread_id,
            name: None,
            running: true,
        });
    }

    pub fn thread_exited(&mut self, thread_id: u32) {
        self.threads.remove(&thread_id);
    }

    /// Replace the thread list with a fresh `-thread-info` answer
    pub fn update_from_thread_info(&mut self, info: &ThreadInfo) {
        self.threads = info
            .threads
            .iter()
            .map(|t| {
                (
                    t.id,
                    ThreadState {
                        id: t.id,
                        name: t.name.clone(),
                        running: t.running,
                    },
                )
            })
            .collect();
    }

    /// Handle a `*running` record
    pub fn handle_running(&mut self, record: &AsyncRecord) {
        let thread = record.get_str("thread-id").and_then(|s| s.parse::<u32>().ok());
        match thread {
            Some(id) if self.non_stop => {
                if let Some(state) = self.threads.get_mut(&id) {
                    state.running = true;
                }
            }
            _ => self.threads.values_mut().for_each(|t| t.running = true),
        }
    }

    /// Handle a `*stopped` record and decide whether the client sees it
    pub fn handle_stopped(&mut self, record: &AsyncRecord) -> StopDisposition {
        let event = StopEvent::from_record(record);

        if event.all_threads_stopped || !self.non_stop {
            self.threads.values_mut().for_each(|t| t.running = false);
        } else {
            for id in event.stopped_thread_ids() {
                if let Some(state) = self.threads.get_mut(&id) {
                    state.running = false;
                }
            }
        }

        if event.reason.as_ref().map_or(false, StopReason::is_exit) {
            self.threads.clear();
            self.resolve_pause(PauseOutcome::Exited);
            return StopDisposition::Report(event);
        }

        let Some(waiter) = self.pause_waiter.take() else {
            return StopDisposition::Report(event);
        };

        let from_pause = matches!(event.reason, None | Some(StopReason::SignalReceived))
            && (!self.non_stop || waiter.thread_id.is_none() || waiter.thread_id == event.thread_id);

        if from_pause {
            log::debug!("Stop caused by internal pause, not reported");
            let _ = waiter.sender.send(PauseOutcome::Paused);
            StopDisposition::Suppress
        } else {
            log::debug!("Real stop ({:?}) raced internal pause", event.reason);
            let _ = waiter.sender.send(PauseOutcome::RealStop(event.clone()));
            StopDisposition::Report(event)
        }
    }

    /// Fold a notify record into the thread list
    pub fn handle_notify(&mut self, record: &AsyncRecord) {
        let thread = || record.get_str("id").and_then(|s| s.parse::<u32>().ok());
        match record.class {
            AsyncClass::ThreadCreated => {
                if let Some(id) = thread() {
                    self.thread_created(id);
                }
            }
            AsyncClass::ThreadExited => {
                if let Some(id) = thread() {
                    self.thread_exited(id);
                }
            }
            AsyncClass::ThreadGroupExited => {
                self.threads.clear();
                self.resolve_pause(PauseOutcome::Exited);
            }
            _ => {}
        }
    }

    /// Arm the waiter for the stop a pause is about to cause. Must happen
    /// before the interrupt is sent.
    pub fn arm_pause(&mut self, thread_id: Option<u32>) -> oneshot::Receiver<PauseOutcome> {
        let (sender, receiver) = oneshot::channel();
        if self.pause_waiter.replace(PauseWaiter { thread_id, sender }).is_some() {
            log::warn!("Replacing an outstanding pause waiter");
        }
        receiver
    }

    /// Drop the waiter after the interrupt could not be sent
    pub fn disarm_pause(&mut self) {
        self.pause_waiter = None;
    }

    fn resolve_pause(&mut self, outcome: PauseOutcome) {
        if let Some(waiter) = self.pause_waiter.take() {
            let _ = waiter.sender.send(outcome);
        }
    }

    /// Forget everything after the inferior is gone
    pub fn clear(&mut self) {
        self.threads.clear();
        self.resolve_pause(PauseOutcome::Exited);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_gdb_output;
    use crate::types::GdbOutput;

    fn record(line: &str) -> AsyncRecord {
        match parse_gdb_output(line).unwrap() {
            GdbOutput::Async(record) => record,
            other => panic!("not an async record: {:?}", other),
        }
    }

    fn tracker_with_threads(non_stop: bool, ids: &[u32]) -> ExecutionTracker {
        let mut tracker = ExecutionTracker::new();
        tracker.set_non_stop(non_stop);
        for id in ids {
            tracker.thread_created(*id);
        }
        tracker
    }

    #[test]
    fn test_empty_thread_list_is_not_running() {
        let mut tracker = ExecutionTracker::new();
        assert!(!tracker.is_running());
        tracker.handle_running(&record(r#"*running,thread-id="all""#));
        assert!(!tracker.is_running());
    }

    #[test]
    fn test_all_stop_running_and_stopped() {
        let mut tracker = tracker_with_threads(false, &[1, 2]);
        tracker.handle_stopped(&record(r#"*stopped,reason="end-stepping-range",thread-id="1""#));
        assert!(!tracker.is_running());

        tracker.handle_running(&record(r#"*running,thread-id="1""#));
        assert!(tracker.is_running());
        assert!(tracker.is_thread_running(2));
    }

    #[test]
    fn test_non_stop_tracks_threads_individually() {
        let mut tracker = tracker_with_threads(true, &[1, 2]);
        tracker.handle_stopped(&record(
            r#"*stopped,reason="breakpoint-hit",thread-id="2",stopped-threads=["2"]"#,
        ));
        assert!(tracker.is_thread_running(1));
        assert!(!tracker.is_thread_running(2));
        assert!(!tracker.is_running());

        tracker.handle_running(&record(r#"*running,thread-id="2""#));
        assert!(tracker.is_running());
    }

    #[test]
    fn test_pause_stop_is_suppressed() {
        let mut tracker = tracker_with_threads(false, &[1]);
        let mut waiter = tracker.arm_pause(None);

        let disposition = tracker.handle_stopped(&record(
            r#"*stopped,reason="signal-received",signal-name="SIGINT",thread-id="1",stopped-threads="all""#,
        ));
        assert_eq!(disposition, StopDisposition::Suppress);
        assert_eq!(waiter.try_recv().unwrap(), PauseOutcome::Paused);
    }

    #[test]
    fn test_real_stop_wins_over_pause() {
        let mut tracker = tracker_with_threads(false, &[1]);
        let mut waiter = tracker.arm_pause(None);

        let disposition = tracker.handle_stopped(&record(
            r#"*stopped,reason="breakpoint-hit",bkptno="3",thread-id="1",stopped-threads="all""#,
        ));
        let StopDisposition::Report(event) = disposition else {
            panic!("real stop must be reported");
        };
        assert_eq!(event.breakpoint_number.as_deref(), Some("3"));
        assert!(matches!(waiter.try_recv().unwrap(), PauseOutcome::RealStop(_)));

        // Later stops go straight to the client
        let disposition = tracker.handle_stopped(&record(r#"*stopped,reason="signal-received""#));
        assert!(matches!(disposition, StopDisposition::Report(_)));
    }

    #[test]
    fn test_non_stop_pause_matches_thread() {
        let mut tracker = tracker_with_threads(true, &[1, 2]);
        let mut waiter = tracker.arm_pause(Some(2));

        let disposition = tracker.handle_stopped(&record(
            r#"*stopped,reason="signal-received",thread-id="1",stopped-threads=["1"]"#,
        ));
        assert!(matches!(disposition, StopDisposition::Report(_)));
        assert!(matches!(waiter.try_recv().unwrap(), PauseOutcome::RealStop(_)));
    }

    #[test]
    fn test_exit_resolves_waiter_and_clears_threads() {
        let mut tracker = tracker_with_threads(false, &[1]);
        let mut waiter = tracker.arm_pause(None);

        let disposition = tracker.handle_stopped(&record(r#"*stopped,reason="exited",exit-code="012""#));
        let StopDisposition::Report(event) = disposition else {
            panic!("exit must be reported");
        };
        assert_eq!(event.exit_code, Some(10));
        assert!(tracker.threads().is_empty());
        assert_eq!(waiter.try_recv().unwrap(), PauseOutcome::Exited);
    }

    #[test]
    fn test_thread_notifications() {
        let mut tracker = ExecutionTracker::new();
        tracker.handle_notify(&record(r#"=thread-created,id="1",group-id="i1""#));
        tracker.handle_notify(&record(r#"=thread-created,id="2",group-id="i1""#));
        assert_eq!(tracker.threads().len(), 2);
        tracker.handle_notify(&record(r#"=thread-exited,id="1",group-id="i1""#));
        assert_eq!(tracker.threads().iter().map(|t| t.id).collect::<Vec<_>>(), vec![2]);
        tracker.handle_notify(&record(r#"=thread-group-exited,id="i1",exit-code="0""#));
        assert!(tracker.threads().is_empty());
    }
}
