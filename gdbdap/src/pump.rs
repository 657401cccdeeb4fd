/// Turns GDB's out-of-band records into DAP events
///
/// Runs as its own task next to the request worker. Exec records feed the
/// execution tracker, which decides whether a stop reaches the client.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use gdbadapter::events::{ExecutionTracker, StopDisposition, StopEvent};
use gdbadapter::{AsyncClass, AsyncRecord, GdbEvents, StopReason, StreamRecord};

use crate::transport::EventSink;

/// State shared by the request worker and the event pump
pub struct SessionState {
    tracker: Mutex<ExecutionTracker>,
    resumes: AtomicU64,
    exit_reported: AtomicBool,
    function_breakpoints: Mutex<HashSet<String>>,
    console_capture: Mutex<Option<Vec<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            tracker: Mutex::new(ExecutionTracker::new()),
            resumes: AtomicU64::new(0),
            exit_reported: AtomicBool::new(false),
            function_breakpoints: Mutex::new(HashSet::new()),
            console_capture: Mutex::new(None),
        }
    }

    pub fn tracker(&self) -> &Mutex<ExecutionTracker> {
        &self.tracker
    }

    pub fn tracker_guard(&self) -> MutexGuard<'_, ExecutionTracker> {
        lock(&self.tracker)
    }

    /// Bumped on every `*running`; frame and variable handles die with it
    pub fn resume_count(&self) -> u64 {
        self.resumes.load(Ordering::SeqCst)
    }

    pub fn set_function_breakpoints(&self, numbers: HashSet<String>) {
        *lock(&self.function_breakpoints) = numbers;
    }

    fn is_function_breakpoint(&self, number: &str) -> bool {
        lock(&self.function_breakpoints).contains(number)
    }

    /// Start collecting console output for a raw command
    pub fn start_capture(&self) {
        *lock(&self.console_capture) = Some(Vec::new());
    }

    pub fn finish_capture(&self) -> Vec<String> {
        lock(&self.console_capture).take().unwrap_or_default()
    }

    /// True only for the first exit notification of a run
    fn claim_exit(&self) -> bool {
        !self.exit_reported.swap(true, Ordering::SeqCst)
    }

    /// A new inferior is about to run
    pub fn rearm_exit(&self) {
        self.exit_reported.store(false, Ordering::SeqCst);
    }
}

/// DAP `stopped` reason and optional description for a GDB stop
pub fn stopped_reason(event: &StopEvent, is_function_breakpoint: bool) -> (&'static str, Option<String>) {
    match &event.reason {
        Some(StopReason::BreakpointHit) if is_function_breakpoint => ("function breakpoint", None),
        Some(StopReason::BreakpointHit)
        | Some(StopReason::WatchpointTrigger)
        | Some(StopReason::ReadWatchpointTrigger)
        | Some(StopReason::AccessWatchpointTrigger) => ("breakpoint", None),
        Some(StopReason::EndSteppingRange)
        | Some(StopReason::FunctionFinished)
        | Some(StopReason::LocationReached)
        | Some(StopReason::WatchpointScope) => ("step", None),
        Some(StopReason::SignalReceived) => match event.signal_name.as_deref() {
            Some("SIGINT") | Some("SIGTRAP") | Some("0") | None => ("pause", None),
            Some("SIGSEGV") | Some("SIGBUS") | Some("SIGFPE") | Some("SIGILL") | Some("SIGABRT") => {
                ("exception", event.signal_meaning.clone().or_else(|| event.signal_name.clone()))
            }
            Some(other) => ("signal", Some(event.signal_meaning.clone().unwrap_or_else(|| other.to_string()))),
        },
        Some(other) => ("signal", Some(other.to_string())),
        None => ("pause", None),
    }
}

fn stopped_body(event: &StopEvent, state: &SessionState) -> Value {
    let is_function = event
        .breakpoint_number
        .as_deref()
        .map_or(false, |n| state.is_function_breakpoint(n));
    let (reason, description) = stopped_reason(event, is_function);

    let mut body = json!({
        "reason": reason,
        "allThreadsStopped": event.all_threads_stopped,
    });
    if let Some(thread) = event.thread_id {
        body["threadId"] = json!(thread);
    }
    if let Some(description) = description {
        body["description"] = json!(description.clone());
        body["text"] = json!(description);
    }
    if let Some(number) = event.breakpoint_number.as_deref().and_then(|n| n.parse::<i64>().ok()) {
        body["hitBreakpointIds"] = json!([number]);
    }
    body
}

fn report_exit(state: &SessionState, sink: &EventSink, exit_code: Option<i64>) {
    if state.claim_exit() {
        sink.event("exited", Some(json!({ "exitCode": exit_code.unwrap_or(0) })));
        sink.event("terminated", None);
    }
}

fn handle_exec(record: AsyncRecord, state: &SessionState, sink: &EventSink) {
    match record.class {
        AsyncClass::Running => {
            state.tracker_guard().handle_running(&record);
            state.resumes.fetch_add(1, Ordering::SeqCst);

            let thread = record.get_str("thread-id").unwrap_or("all");
            let thread_id = thread
                .parse::<u32>()
                .ok()
                .or_else(|| state.tracker_guard().threads().first().map(|t| t.id))
                .unwrap_or(1);
            sink.event(
                "continued",
                Some(json!({ "threadId": thread_id, "allThreadsContinued": thread == "all" })),
            );
        }
        AsyncClass::Stopped => {
            let disposition = state.tracker_guard().handle_stopped(&record);
            match disposition {
                StopDisposition::Suppress => {}
                StopDisposition::Report(event) if event.reason.as_ref().map_or(false, StopReason::is_exit) => {
                    report_exit(state, sink, event.exit_code);
                }
                StopDisposition::Report(event) => sink.event("stopped", Some(stopped_body(&event, state))),
            }
        }
        other => log::debug!("Ignoring exec record {:?}", other),
    }
}

fn handle_notify(record: AsyncRecord, state: &SessionState, sink: &EventSink) {
    state.tracker_guard().handle_notify(&record);
    let thread_id = || record.get_str("id").and_then(|s| s.parse::<u32>().ok());

    match record.class {
        AsyncClass::ThreadCreated => {
            if let Some(id) = thread_id() {
                sink.event("thread", Some(json!({ "reason": "started", "threadId": id })));
            }
        }
        AsyncClass::ThreadExited => {
            if let Some(id) = thread_id() {
                sink.event("thread", Some(json!({ "reason": "exited", "threadId": id })));
            }
        }
        AsyncClass::ThreadGroupExited => {
            let exit_code = record.get_str("exit-code").and_then(|s| i64::from_str_radix(s, 8).ok());
            report_exit(state, sink, exit_code);
        }
        _ => log::trace!("Notify record {:?}", record.class),
    }
}

fn handle_console(record: StreamRecord, state: &SessionState, sink: &EventSink) {
    if let Some(captured) = lock(&state.console_capture).as_mut() {
        captured.push(record.content.clone());
    }
    sink.output(record.category(), &record.content);
}

/// The running pump task
pub struct EventPump {
    task: JoinHandle<()>,
    flush_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

impl EventPump {
    /// Drain GDB's event channels until they close
    pub fn spawn(mut events: GdbEvents, state: Arc<SessionState>, sink: EventSink) -> Self {
        let (flush_tx, mut flush_rx) = mpsc::unbounded_channel::<oneshot::Sender<()>>();
        let task = tokio::spawn(async move {
            log::debug!("Event pump started");
            loop {
                // Flushes are only answered once the record channels are empty
                tokio::select! {
                    biased;
                    Some(record) = events.console.recv() => handle_console(record, &state, &sink),
                    Some(record) = events.exec.recv() => handle_exec(record, &state, &sink),
                    Some(record) = events.notify.recv() => handle_notify(record, &state, &sink),
                    Some(record) = events.status.recv() => {
                        log::debug!("GDB status: {:?} {:?}", record.class, record.results)
                    }
                    Some(done) = flush_rx.recv() => {
                        let _ = done.send(());
                    }
                    else => break,
                }
            }
            log::debug!("Event pump finished");
        });
        Self { task, flush_tx }
    }

    /// Wait until every record GDB printed so far has been handled
    pub async fn flush(&self) {
        let (done, handled) = oneshot::channel();
        if self.flush_tx.send(done).is_ok() {
            let _ = handled.await;
        }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdbadapter::{parse_gdb_output, GdbOutput};

    fn stop(line: &str) -> StopEvent {
        match parse_gdb_output(line).unwrap() {
            GdbOutput::Async(record) => StopEvent::from_record(&record),
            other => panic!("not an async record: {:?}", other),
        }
    }

    #[test]
    fn test_stopped_reasons() {
        let cases = [
            (r#"*stopped,reason="breakpoint-hit",bkptno="1""#, "breakpoint"),
            (r#"*stopped,reason="end-stepping-range""#, "step"),
            (r#"*stopped,reason="function-finished""#, "step"),
            (r#"*stopped,reason="signal-received",signal-name="SIGINT""#, "pause"),
            (r#"*stopped,reason="signal-received",signal-name="SIGSEGV",signal-meaning="Segmentation fault""#, "exception"),
            (r#"*stopped,reason="signal-received",signal-name="SIGUSR1""#, "signal"),
            (r#"*stopped,thread-id="1""#, "pause"),
        ];
        for (line, expected) in cases {
            assert_eq!(stopped_reason(&stop(line), false).0, expected, "{}", line);
        }
        assert_eq!(
            stopped_reason(&stop(r#"*stopped,reason="breakpoint-hit",bkptno="2""#), true).0,
            "function breakpoint"
        );
    }

    #[test]
    fn test_stopped_body_fields() {
        let state = SessionState::new();
        let body = stopped_body(
            &stop(r#"*stopped,reason="signal-received",signal-name="SIGSEGV",signal-meaning="Segmentation fault",thread-id="3",stopped-threads="all""#),
            &state,
        );
        assert_eq!(body["reason"], "exception");
        assert_eq!(body["threadId"], 3);
        assert_eq!(body["allThreadsStopped"], true);
        assert_eq!(body["description"], "Segmentation fault");
    }

    #[test]
    fn test_exit_is_claimed_once() {
        let state = SessionState::new();
        assert!(state.claim_exit());
        assert!(!state.claim_exit());
        state.rearm_exit();
        assert!(state.claim_exit());
    }

    #[test]
    fn test_console_capture() {
        let state = SessionState::new();
        assert!(state.finish_capture().is_empty());
        state.start_capture();
        lock(&state.console_capture).as_mut().unwrap().push("x\n".to_string());
        assert_eq!(state.finish_capture(), vec!["x\n".to_string()]);
    }
}
