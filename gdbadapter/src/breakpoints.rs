/// Breakpoint reconciliation
///
/// Brings GDB's breakpoint table in line with the breakpoints a client
/// declared for one source file (or for functions): rows that still match are
/// kept, stale rows are deleted, missing ones are inserted.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::backend::GdbBackend;
use crate::commands::{Breakpoint, BreakpointInsertOptions};
use crate::events::{ExecutionTracker, PauseOutcome};
use crate::parser::escape_c_string;
use crate::{GdbError, Result};

/// Where a desired breakpoint lives
#[derive(Debug, Clone, PartialEq)]
pub enum BreakpointLocation {
    Source { path: String, line: u32 },
    Function { name: String },
}

impl BreakpointLocation {
    /// The `original-location` GDB reports for a breakpoint inserted here
    pub fn original_location(&self, explicit_locations: bool) -> String {
        match (self, explicit_locations) {
            (BreakpointLocation::Source { path, line }, true) => format!("-source {} -line {}", path, line),
            (BreakpointLocation::Source { path, line }, false) => format!("{}:{}", path, line),
            (BreakpointLocation::Function { name }, true) => format!("-function {}", name),
            (BreakpointLocation::Function { name }, false) => name.clone(),
        }
    }

    /// Location argument for `-break-insert`
    pub fn insert_argument(&self, explicit_locations: bool) -> String {
        match (self, explicit_locations) {
            (BreakpointLocation::Source { path, line }, true) => {
                format!("--source {} --line {}", escape_c_string(path), line)
            }
            (BreakpointLocation::Source { path, line }, false) => escape_c_string(&format!("{}:{}", path, line)),
            (BreakpointLocation::Function { name }, true) => format!("--function {}", name),
            (BreakpointLocation::Function { name }, false) => name.clone(),
        }
    }
}

/// A breakpoint as the client declared it
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredBreakpoint {
    pub location: BreakpointLocation,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
}

impl DesiredBreakpoint {
    pub fn source(path: &str, line: u32) -> Self {
        Self {
            location: BreakpointLocation::Source {
                path: path.to_string(),
                line,
            },
            condition: None,
            hit_condition: None,
            log_message: None,
        }
    }

    pub fn function(name: &str) -> Self {
        Self {
            location: BreakpointLocation::Function { name: name.to_string() },
            condition: None,
            hit_condition: None,
            log_message: None,
        }
    }
}

/// Translated hit condition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitCondition {
    pub temporary: bool,
    pub ignore_count: u32,
}

/// `"> N"` keeps firing after N hits, a plain `N` fires once on the Nth hit
pub fn parse_hit_condition(text: &str) -> Result<HitCondition> {
    let invalid = || GdbError::InvalidInput(format!("Unable to decode expression: {}", text));
    let trimmed = text.trim();

    match trimmed.strip_prefix('>') {
        Some(rest) => Ok(HitCondition {
            temporary: false,
            ignore_count: rest.trim().parse().map_err(|_| invalid())?,
        }),
        None => {
            let count: u32 = trimmed.parse().map_err(|_| invalid())?;
            Ok(HitCondition {
                temporary: true,
                ignore_count: count.saturating_sub(1),
            })
        }
    }
}

fn same_condition(a: Option<&str>, b: Option<&str>) -> bool {
    a.unwrap_or_default().trim() == b.unwrap_or_default().trim()
}

/// Whether an existing table row already implements a desired breakpoint
pub fn breakpoint_matches(desired: &DesiredBreakpoint, actual: &Breakpoint, explicit_locations: bool) -> bool {
    if desired.hit_condition.is_some() {
        return false;
    }
    if desired.log_message.is_some() != actual.is_dprintf() {
        return false;
    }
    actual.original_location.as_deref() == Some(desired.location.original_location(explicit_locations).as_str())
        && same_condition(desired.condition.as_deref(), actual.cond.as_deref())
}

/// Pairing of desired breakpoints with existing rows
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// One entry per desired breakpoint, in order
    pub resolved: Vec<(DesiredBreakpoint, Option<Breakpoint>)>,
    /// Numbers of rows no desired breakpoint matches
    pub deletes: Vec<String>,
}

pub fn reconcile(desired: &[DesiredBreakpoint], actual: &[Breakpoint], explicit_locations: bool) -> Reconciliation {
    let resolved = desired
        .iter()
        .map(|d| {
            let found = actual.iter().find(|a| breakpoint_matches(d, a, explicit_locations));
            (d.clone(), found.cloned())
        })
        .collect();

    let deletes = actual
        .iter()
        .filter(|a| !desired.iter().any(|d| breakpoint_matches(d, a, explicit_locations)))
        .map(|a| a.number.clone())
        .collect();

    Reconciliation { resolved, deletes }
}

/// Result for one desired breakpoint
#[derive(Debug, Clone, PartialEq)]
pub struct BreakpointResult {
    pub desired: DesiredBreakpoint,
    pub actual: Option<Breakpoint>,
    pub error: Option<String>,
}

impl BreakpointResult {
    pub fn verified(&self) -> bool {
        self.actual.is_some()
    }
}

/// Which slice of the breakpoint table a request owns
#[derive(Debug, Clone, PartialEq)]
pub enum BreakpointScope {
    Source(String),
    Functions,
}

/// Applies client breakpoint requests to GDB
#[derive(Debug, Default)]
pub struct BreakpointManager {
    function_breakpoints: HashSet<String>,
    hardware: bool,
}

const TABLE_TYPES: [&str; 3] = ["breakpoint", "hw breakpoint", "dprintf"];

impl BreakpointManager {
    pub fn new(hardware: bool) -> Self {
        Self {
            function_breakpoints: HashSet::new(),
            hardware,
        }
    }

    pub fn set_hardware(&mut self, hardware: bool) {
        self.hardware = hardware;
    }

    fn owned_by(&self, scope: &BreakpointScope, bp: &Breakpoint) -> bool {
        if bp.is_location_row() || !bp.bp_type.as_deref().map_or(false, |t| TABLE_TYPES.contains(&t)) {
            return false;
        }
        let is_function = self.function_breakpoints.contains(&bp.number);
        match scope {
            BreakpointScope::Functions => is_function,
            BreakpointScope::Source(path) => !is_function && bp.fullname.as_deref() == Some(path.as_str()),
        }
    }

    /// Replace the breakpoints of `scope` with `desired`.
    ///
    /// Deletes always go out before inserts. An insert failure only marks
    /// its own breakpoint unverified.
    pub async fn set_breakpoints(
        &mut self,
        backend: &GdbBackend,
        scope: &BreakpointScope,
        desired: &[DesiredBreakpoint],
    ) -> Result<Vec<BreakpointResult>> {
        let explicit_locations = backend.gdb_version_at_least("8.0");
        let actual: Vec<Breakpoint> = backend
            .break_list()
            .await?
            .into_iter()
            .filter(|bp| self.owned_by(scope, bp))
            .collect();

        let plan = reconcile(desired, &actual, explicit_locations);
        log::debug!(
            "Breakpoints for {:?}: {} kept, {} deleted",
            scope,
            plan.resolved.iter().filter(|(_, a)| a.is_some()).count(),
            plan.deletes.len()
        );

        backend.break_delete(&plan.deletes).await?;
        for number in &plan.deletes {
            self.function_breakpoints.remove(number);
        }

        let mut results = Vec::with_capacity(plan.resolved.len());
        for (desired, existing) in plan.resolved {
            if existing.is_some() {
                results.push(BreakpointResult {
                    desired,
                    actual: existing,
                    error: None,
                });
                continue;
            }

            let result = match self.insert(backend, &desired, explicit_locations).await {
                Ok(bp) => BreakpointResult {
                    desired,
                    actual: Some(bp),
                    error: None,
                },
                Err(e) => {
                    log::warn!("Failed to insert breakpoint: {}", e);
                    BreakpointResult {
                        desired,
                        actual: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.push(result);
        }

        if *scope == BreakpointScope::Functions {
            self.function_breakpoints = results
                .iter()
                .filter_map(|r| r.actual.as_ref().map(|bp| bp.number.clone()))
                .collect();
        }
        Ok(results)
    }

    async fn insert(
        &self,
        backend: &GdbBackend,
        desired: &DesiredBreakpoint,
        explicit_locations: bool,
    ) -> Result<Breakpoint> {
        let mut options = BreakpointInsertOptions {
            hardware: self.hardware,
            condition: desired.condition.clone(),
            log_message: desired.log_message.clone(),
            ..Default::default()
        };
        if let Some(text) = &desired.hit_condition {
            let hit = parse_hit_condition(text)?;
            options.temporary = hit.temporary;
            options.ignore_count = Some(hit.ignore_count);
        }
        backend
            .break_insert(&desired.location.insert_argument(explicit_locations), &options)
            .await
    }

    /// Forget function breakpoint bookkeeping, e.g. when the program changes
    pub fn clear(&mut self) {
        self.function_breakpoints.clear();
    }
}

/// A target stopped by [`pause_if_needed`]
#[derive(Debug)]
pub struct PausedTarget {
    pub thread_id: Option<u32>,
    pub outcome: PauseOutcome,
}

fn lock(tracker: &Mutex<ExecutionTracker>) -> std::sync::MutexGuard<'_, ExecutionTracker> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Stop a running target so that commands can be issued. Returns `None`
/// when the target was already stopped.
///
/// The stop is observed by the event pump, which must be running on
/// another task.
pub async fn pause_if_needed(backend: &GdbBackend, tracker: &Mutex<ExecutionTracker>) -> Result<Option<PausedTarget>> {
    if !lock(tracker).is_running() {
        return Ok(None);
    }

    let thread_id = if backend.is_non_stop() {
        let info = backend.thread_info().await?;
        info.current_thread_id
            .or_else(|| info.threads.iter().find(|t| t.running).map(|t| t.id))
    } else {
        None
    };

    let waiter = lock(tracker).arm_pause(thread_id);
    if let Err(e) = backend.pause(thread_id).await {
        lock(tracker).disarm_pause();
        return Err(e);
    }

    let outcome = waiter.await.unwrap_or(PauseOutcome::Exited);
    log::debug!("Target paused: {:?}", outcome);
    Ok(Some(PausedTarget { thread_id, outcome }))
}

/// Resume what [`pause_if_needed`] stopped, unless a real stop intervened
pub async fn continue_if_needed(backend: &GdbBackend, paused: Option<PausedTarget>) -> Result<()> {
    match paused {
        Some(PausedTarget {
            thread_id,
            outcome: PauseOutcome::Paused,
        }) => {
            let thread = if backend.is_non_stop() { thread_id } else { None };
            backend.exec_continue(thread).await
        }
        _ => Ok(()),
    }
}
