/// One debug session: DAP requests in, GDB/MI commands out
///
/// Requests are handled one at a time. Anything GDB reports on its own
/// (stops, thread changes, console output) goes through the event pump.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

use gdbadapter::breakpoints::{
    continue_if_needed, pause_if_needed, BreakpointLocation, BreakpointManager, BreakpointResult, BreakpointScope,
    DesiredBreakpoint,
};
use gdbadapter::disassembly::{disassemble_window, FunctionLabelCache};
use gdbadapter::memory::{base64_to_hex, calculate_memory_offset, hex_to_base64};
use gdbadapter::varobj::{
    is_array_type, list_children, VarObject, VarObjectManager, VarScopeKey, VarScopeKind, VarUpdate,
};
use gdbadapter::{GdbBackend, GdbEvents};

use crate::config::SessionArguments;
use crate::handles::Handles;
use crate::protocol::{
    Breakpoint, Capabilities, DapRequest, DapResponse, DisassembleArguments, DisassembledInstruction,
    EvaluateArguments, ExecuteCommandArguments, ReadMemoryArguments, Scope, ScopesArguments,
    SetBreakpointsArguments, SetFunctionBreakpointsArguments, SetVariableArguments, Source, StackFrame,
    StackTraceArguments, Thread, ThreadArguments, Variable, VariablesArguments, WriteMemoryArguments,
};
use crate::pump::{EventPump, SessionState};
use crate::target::{run_user_command, select_target, TargetStrategy};
use crate::transport::EventSink;
use crate::{DapError, Result};

/// Deepest stack `-stack-info-depth` is asked to count
const MAX_STACK_DEPTH: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
struct FrameRef {
    thread_id: u32,
    level: u32,
}

/// What a `variablesReference` points at
#[derive(Debug, Clone)]
enum VarContainer {
    Locals(FrameRef),
    Registers(FrameRef),
    Object {
        frame: FrameRef,
        key: VarScopeKey,
        varname: String,
        kind: VarScopeKind,
    },
}

fn parse<T: DeserializeOwned>(arguments: Value) -> Result<T> {
    Ok(serde_json::from_value(arguments)?)
}

fn source_for(file: Option<&str>, fullname: Option<&str>) -> Option<Source> {
    let path = fullname.or(file)?;
    Some(Source {
        name: file
            .map(str::to_string)
            .or_else(|| std::path::Path::new(path).file_name().map(|n| n.to_string_lossy().into_owned())),
        path: Some(path.to_string()),
    })
}

fn dap_breakpoint(result: &BreakpointResult) -> Breakpoint {
    let actual = result.actual.as_ref();
    let desired_line = match &result.desired.location {
        BreakpointLocation::Source { line, .. } => Some(*line),
        BreakpointLocation::Function { .. } => None,
    };
    Breakpoint {
        id: actual.and_then(|bp| bp.number.parse().ok()),
        verified: result.verified(),
        message: result.error.clone(),
        source: actual.and_then(|bp| source_for(bp.file.as_deref(), bp.fullname.as_deref())),
        line: actual.and_then(|bp| bp.line).or(desired_line),
    }
}

pub struct DebugSession {
    backend: GdbBackend,
    events: Option<GdbEvents>,
    state: Arc<SessionState>,
    sink: EventSink,
    pump: Option<EventPump>,
    target: Option<Box<dyn TargetStrategy>>,
    breakpoints: BreakpointManager,
    varobjs: VarObjectManager,
    labels: FunctionLabelCache,
    register_names: Option<Vec<String>>,
    frames: Handles<FrameRef>,
    variables: Handles<VarContainer>,
    seen_resumes: u64,
}

impl DebugSession {
    /// A session that spawns GDB on `launch`/`attach`
    pub fn new(sink: EventSink) -> Self {
        let (backend, events) = GdbBackend::new();
        Self::with_backend(backend, events, sink)
    }

    /// A session over an already connected backend
    pub fn with_backend(backend: GdbBackend, events: GdbEvents, sink: EventSink) -> Self {
        Self {
            backend,
            events: Some(events),
            state: Arc::new(SessionState::new()),
            sink,
            pump: None,
            target: None,
            breakpoints: BreakpointManager::default(),
            varobjs: VarObjectManager::new(),
            labels: FunctionLabelCache::new(),
            register_names: None,
            frames: Handles::new(),
            variables: Handles::new(),
            seen_resumes: 0,
        }
    }

    /// Handle one request and queue its response. Returns false once the
    /// client disconnected.
    pub async fn dispatch(&mut self, request: DapRequest) -> bool {
        log::debug!("DAP request {} ({})", request.command, request.seq);
        self.sync_handles();

        match self.handle(&request).await {
            Ok(body) => self.sink.respond(DapResponse::success(&request, body)),
            Err(e) => {
                log::warn!("{} failed: {}", request.command, e);
                self.sink.respond(DapResponse::error(&request, e.to_string()));
            }
        }
        request.command != "disconnect"
    }

    /// Stop GDB and the event pump
    pub async fn shutdown(&mut self) {
        self.backend.shutdown().await;
        if let Some(pump) = self.pump.take() {
            pump.stop();
        }
    }

    /// Frame and variable handles only live until the target resumes
    fn sync_handles(&mut self) {
        let resumes = self.state.resume_count();
        if resumes != self.seen_resumes {
            self.seen_resumes = resumes;
            self.frames.reset();
            self.variables.reset();
        }
    }

    async fn handle(&mut self, request: &DapRequest) -> Result<Option<Value>> {
        let arguments = request.arguments.clone();
        match request.command.as_str() {
            "initialize" => Ok(Some(serde_json::to_value(Capabilities::default())?)),
            "launch" => self.launch(arguments, false).await,
            "attach" => self.launch(arguments, true).await,
            "configurationDone" => self.configuration_done().await,
            "setBreakpoints" => self.set_breakpoints(parse(arguments)?).await,
            "setFunctionBreakpoints" => self.set_function_breakpoints(parse(arguments)?).await,
            "setExceptionBreakpoints" => Ok(None),
            "threads" => self.threads().await,
            "stackTrace" => self.stack_trace(parse(arguments)?).await,
            "scopes" => self.scopes(parse(arguments)?),
            "variables" => self.variables(parse(arguments)?).await,
            "setVariable" => self.set_variable(parse(arguments)?).await,
            "evaluate" => self.evaluate(parse(arguments)?).await,
            "continue" => self.resume(parse(arguments)?).await,
            "next" | "stepIn" | "stepOut" => self.step(&request.command, parse(arguments)?).await,
            "pause" => self.pause(parse(arguments)?).await,
            "disassemble" => self.disassemble(parse(arguments)?).await,
            "readMemory" => self.read_memory(parse(arguments)?).await,
            "writeMemory" => self.write_memory(parse(arguments)?).await,
            "disconnect" => self.disconnect().await,
            "cdt-gdb-tests/executeCommand" => self.execute_command(parse(arguments)?).await,
            other => Err(DapError::Request(format!("Unrecognized request: {}", other))),
        }
    }

    async fn launch(&mut self, arguments: Value, attach: bool) -> Result<Option<Value>> {
        let args = SessionArguments::from_value(arguments)?;

        if !self.backend.is_running() {
            self.backend.spawn(&args.gdb_config()).await?;
        }
        if let Some(events) = self.events.take() {
            self.pump = Some(EventPump::spawn(events, self.state.clone(), self.sink.clone()));
        }
        self.backend.wait_ready().await?;
        self.backend.negotiate_modes(args.gdb_async, args.gdb_non_stop).await;
        log::info!(
            "GDB {} (async={}, non-stop={})",
            self.backend.version().unwrap_or("of unknown version"),
            self.backend.is_async(),
            self.backend.is_non_stop()
        );
        {
            let mut tracker = self.state.tracker_guard();
            tracker.clear();
            tracker.set_non_stop(self.backend.is_non_stop());
        }
        if args.gdb_non_stop && !self.backend.non_stop_supported() {
            self.sink.output("console", "Non-stop mode is not supported, continuing in all-stop mode\n");
        }

        for command in &args.init_commands {
            run_user_command(&self.backend, command).await?;
        }

        self.breakpoints.clear();
        self.breakpoints.set_hardware(args.hardware_breakpoint);
        self.varobjs.clear();
        self.labels.clear();
        self.register_names = None;

        let mut target = select_target(&args, attach)?;
        log::info!("Connecting: {}", target.describe());
        target.connect(&self.backend, &self.sink).await?;
        self.target = Some(target);
        self.state.rearm_exit();

        self.sink.event("initialized", None);
        Ok(None)
    }

    async fn configuration_done(&mut self) -> Result<Option<Value>> {
        let target = self
            .target
            .as_mut()
            .ok_or_else(|| DapError::Request("No program was launched or attached".to_string()))?;
        target.start(&self.backend).await?;
        Ok(None)
    }

    /// Apply breakpoints with the target briefly paused if it is running
    async fn apply_breakpoints(
        &mut self,
        scope: BreakpointScope,
        desired: &[DesiredBreakpoint],
    ) -> Result<Vec<BreakpointResult>> {
        let paused = pause_if_needed(&self.backend, self.state.tracker()).await?;
        let applied = self.breakpoints.set_breakpoints(&self.backend, &scope, desired).await;
        let resumed = continue_if_needed(&self.backend, paused).await;
        let results = applied?;
        resumed?;

        if scope == BreakpointScope::Functions {
            let numbers: HashSet<String> = results
                .iter()
                .filter_map(|r| r.actual.as_ref().map(|bp| bp.number.clone()))
                .collect();
            self.state.set_function_breakpoints(numbers);
        }
        Ok(results)
    }

    async fn set_breakpoints(&mut self, args: SetBreakpointsArguments) -> Result<Option<Value>> {
        let path = args
            .source
            .path
            .clone()
            .ok_or_else(|| DapError::Request("Breakpoints need a source path".to_string()))?;
        let desired: Vec<DesiredBreakpoint> = args
            .breakpoints
            .iter()
            .map(|bp| DesiredBreakpoint {
                condition: bp.condition.clone(),
                hit_condition: bp.hit_condition.clone(),
                log_message: bp.log_message.clone(),
                ..DesiredBreakpoint::source(&path, bp.line)
            })
            .collect();

        let results = self.apply_breakpoints(BreakpointScope::Source(path), &desired).await?;
        let breakpoints: Vec<Breakpoint> = results.iter().map(dap_breakpoint).collect();
        Ok(Some(json!({ "breakpoints": breakpoints })))
    }

    async fn set_function_breakpoints(&mut self, args: SetFunctionBreakpointsArguments) -> Result<Option<Value>> {
        let desired: Vec<DesiredBreakpoint> = args
            .breakpoints
            .iter()
            .map(|bp| DesiredBreakpoint {
                condition: bp.condition.clone(),
                hit_condition: bp.hit_condition.clone(),
                ..DesiredBreakpoint::function(&bp.name)
            })
            .collect();

        let results = self.apply_breakpoints(BreakpointScope::Functions, &desired).await?;
        let breakpoints: Vec<Breakpoint> = results.iter().map(dap_breakpoint).collect();
        Ok(Some(json!({ "breakpoints": breakpoints })))
    }

    async fn threads(&mut self) -> Result<Option<Value>> {
        let info = self.backend.thread_info().await?;
        self.state.tracker_guard().update_from_thread_info(&info);

        let threads: Vec<Thread> = info
            .threads
            .into_iter()
            .map(|t| Thread {
                id: t.id,
                name: t
                    .name
                    .or(t.target_id)
                    .unwrap_or_else(|| format!("Thread {}", t.id)),
            })
            .collect();
        Ok(Some(json!({ "threads": threads })))
    }

    async fn stack_trace(&mut self, args: StackTraceArguments) -> Result<Option<Value>> {
        let depth = self.backend.stack_info_depth(args.thread_id, MAX_STACK_DEPTH).await?;
        let low = args.start_frame.unwrap_or(0);
        let high = match args.levels {
            Some(levels) if levels > 0 => depth.min(low.saturating_add(levels)),
            _ => depth,
        };
        if low >= high {
            return Ok(Some(json!({ "stackFrames": [], "totalFrames": depth })));
        }

        let frames = self.backend.stack_list_frames(args.thread_id, low, high - 1).await?;
        let stack_frames: Vec<StackFrame> = frames
            .into_iter()
            .map(|frame| StackFrame {
                id: self.frames.create(FrameRef {
                    thread_id: args.thread_id,
                    level: frame.level,
                }),
                name: frame.func.clone().unwrap_or_else(|| "??".to_string()),
                source: source_for(frame.file.as_deref(), frame.fullname.as_deref()),
                line: frame.line.unwrap_or(0),
                column: 0,
                instruction_pointer_reference: Some(frame.addr),
            })
            .collect();
        Ok(Some(json!({ "stackFrames": stack_frames, "totalFrames": depth })))
    }

    fn frame(&self, frame_id: i64) -> Result<FrameRef> {
        self.frames
            .get(frame_id)
            .copied()
            .ok_or_else(|| DapError::Request(format!("Unknown frame id {}", frame_id)))
    }

    fn scopes(&mut self, args: ScopesArguments) -> Result<Option<Value>> {
        let frame = self.frame(args.frame_id)?;
        let scopes = vec![
            Scope {
                name: "Local".to_string(),
                variables_reference: self.variables.create(VarContainer::Locals(frame)),
                expensive: false,
            },
            Scope {
                name: "Registers".to_string(),
                variables_reference: self.variables.create(VarContainer::Registers(frame)),
                expensive: true,
            },
        ];
        Ok(Some(json!({ "scopes": scopes })))
    }

    /// Varobj scope of a frame at the current stack depth
    async fn scope_key(&mut self, frame: FrameRef) -> Result<VarScopeKey> {
        let depth = self.backend.stack_info_depth(frame.thread_id, MAX_STACK_DEPTH).await?;
        self.varobjs
            .invalidate_stale(&self.backend, frame.level, frame.thread_id, depth)
            .await?;
        Ok(VarScopeKey::new(frame.level, frame.thread_id, depth))
    }

    fn to_variable(&mut self, name: String, value: String, frame: FrameRef, key: VarScopeKey, varobj: &VarObject) -> Variable {
        let variables_reference = if varobj.numchild > 0 {
            self.variables.create(VarContainer::Object {
                frame,
                key,
                varname: varobj.varname.clone(),
                kind: varobj.kind,
            })
        } else {
            0
        };
        Variable {
            name,
            value,
            var_type: Some(varobj.var_type.clone()).filter(|t| !t.is_empty()),
            variables_reference,
            evaluate_name: None,
        }
    }

    /// Arrays show their address rather than GDB's `[4]`
    async fn display_value(&self, frame: FrameRef, expression: Option<&str>, varobj: &VarObject) -> String {
        let Some(expression) = expression.filter(|_| is_array_type(&varobj.var_type)) else {
            return varobj.value.clone();
        };
        self.backend
            .data_evaluate_expression(Some(frame.thread_id), Some(frame.level), &format!("&({})", expression))
            .await
            .unwrap_or_else(|_| varobj.value.clone())
    }

    async fn variables(&mut self, args: VariablesArguments) -> Result<Option<Value>> {
        let container = self
            .variables
            .get(args.variables_reference)
            .cloned()
            .ok_or_else(|| DapError::Request(format!("Unknown variables reference {}", args.variables_reference)))?;

        let variables = match container {
            VarContainer::Locals(frame) => self.local_variables(frame).await?,
            VarContainer::Registers(frame) => self.register_variables(frame).await?,
            VarContainer::Object {
                frame,
                key,
                varname,
                kind,
            } => self.child_variables(frame, key, &varname, kind).await?,
        };
        Ok(Some(json!({ "variables": variables })))
    }

    async fn local_variables(&mut self, frame: FrameRef) -> Result<Vec<Variable>> {
        let key = self.scope_key(frame).await?;
        let locals = self.backend.stack_list_variables(frame.thread_id, frame.level).await?;

        let mut variables = Vec::with_capacity(locals.len());
        for local in locals {
            let varobj = match self
                .varobjs
                .get_or_create(&self.backend, key, frame.level, &local.name, VarScopeKind::Local)
                .await
            {
                Ok(varobj) => varobj,
                Err(e) => {
                    log::debug!("No varobj for {}: {}", local.name, e);
                    variables.push(Variable {
                        name: local.name.clone(),
                        value: local.value.clone().unwrap_or_else(|| e.to_string()),
                        var_type: local.var_type.clone(),
                        variables_reference: 0,
                        evaluate_name: Some(local.name),
                    });
                    continue;
                }
            };

            let value = self.display_value(frame, Some(local.name.as_str()), &varobj).await;
            let mut variable = self.to_variable(local.name.clone(), value, frame, key, &varobj);
            variable.evaluate_name = Some(local.name);
            variables.push(variable);
        }
        Ok(variables)
    }

    async fn register_names(&mut self) -> Result<Vec<String>> {
        if let Some(names) = &self.register_names {
            return Ok(names.clone());
        }
        let names = self.backend.data_list_register_names().await?;
        self.register_names = Some(names.clone());
        Ok(names)
    }

    async fn register_variables(&mut self, frame: FrameRef) -> Result<Vec<Variable>> {
        let names = self.register_names().await?;
        let values = self.backend.data_list_register_values(frame.thread_id, frame.level).await?;
        let key = self.scope_key(frame).await?;

        let mut variables = Vec::with_capacity(values.len());
        for (number, _) in values {
            let Some(name) = names.get(number as usize).filter(|n| !n.is_empty()) else {
                continue;
            };
            let expression = format!("${}", name);
            match self
                .varobjs
                .get_or_create(&self.backend, key, frame.level, &expression, VarScopeKind::Registers)
                .await
            {
                Ok(varobj) => {
                    let mut variable = self.to_variable(name.clone(), varobj.value.clone(), frame, key, &varobj);
                    variable.evaluate_name = Some(expression);
                    variables.push(variable);
                }
                Err(e) => log::debug!("Skipping register {}: {}", name, e),
            }
        }
        Ok(variables)
    }

    async fn child_variables(
        &mut self,
        frame: FrameRef,
        key: VarScopeKey,
        varname: &str,
        kind: VarScopeKind,
    ) -> Result<Vec<Variable>> {
        let children = list_children(&self.backend, varname).await?;
        let mut variables = Vec::with_capacity(children.len());
        for child in children {
            let varobj = self.varobjs.add_child(key, &child, kind);
            let path = self.backend.var_info_path_expression(&child.name).await.ok();
            let value = self.display_value(frame, path.as_deref(), &varobj).await;
            let mut variable = self.to_variable(child.exp.clone(), value, frame, key, &varobj);
            variable.evaluate_name = path;
            variables.push(variable);
        }
        Ok(variables)
    }

    async fn set_variable(&mut self, args: SetVariableArguments) -> Result<Option<Value>> {
        let container = self
            .variables
            .get(args.variables_reference)
            .cloned()
            .ok_or_else(|| DapError::Request(format!("Unknown variables reference {}", args.variables_reference)))?;

        let (frame, key, varname) = match container {
            VarContainer::Locals(frame) => {
                let key = self.scope_key(frame).await?;
                let varobj = self
                    .varobjs
                    .get_or_create(&self.backend, key, frame.level, &args.name, VarScopeKind::Local)
                    .await?;
                (frame, key, varobj.varname)
            }
            VarContainer::Registers(frame) => {
                let key = self.scope_key(frame).await?;
                let expression = format!("${}", args.name);
                let varobj = self
                    .varobjs
                    .get_or_create(&self.backend, key, frame.level, &expression, VarScopeKind::Registers)
                    .await?;
                (frame, key, varobj.varname)
            }
            VarContainer::Object {
                frame, key, varname, ..
            } => {
                let child = self
                    .varobjs
                    .get_child(&key, &varname, &args.name)
                    .ok_or_else(|| DapError::Request(format!("Unknown variable {}", args.name)))?;
                (frame, key, child.varname.clone())
            }
        };

        let assigned = self.backend.var_assign(&varname, &args.value).await?;
        let body = match self.varobjs.update(&self.backend, key, &varname).await? {
            VarUpdate::Current(varobj) => {
                let variable = self.to_variable(args.name.clone(), varobj.value.clone(), frame, key, &varobj);
                json!({
                    "value": variable.value,
                    "type": variable.var_type,
                    "variablesReference": variable.variables_reference,
                })
            }
            VarUpdate::OutOfScope => json!({ "value": assigned, "variablesReference": 0 }),
        };
        Ok(Some(body))
    }

    async fn evaluate(&mut self, args: EvaluateArguments) -> Result<Option<Value>> {
        // `>command` in the debug console runs a GDB CLI command
        if args.context.as_deref() == Some("repl") {
            if let Some(command) = args.expression.strip_prefix('>') {
                self.backend.interpreter_exec_console(command.trim()).await?;
                if let Some(pump) = &self.pump {
                    pump.flush().await;
                }
                return Ok(Some(json!({ "result": "", "variablesReference": 0 })));
            }
        }

        let frame = match args.frame_id {
            Some(id) => Some(self.frame(id)?),
            None => None,
        };
        let Some(frame) = frame else {
            let value = self.backend.data_evaluate_expression(None, None, &args.expression).await?;
            return Ok(Some(json!({ "result": value, "variablesReference": 0 })));
        };

        let key = self.scope_key(frame).await?;
        let varobj = self
            .varobjs
            .get_or_create(&self.backend, key, frame.level, &args.expression, VarScopeKind::Local)
            .await?;
        let value = self.display_value(frame, Some(args.expression.as_str()), &varobj).await;
        let variable = self.to_variable(args.expression.clone(), value, frame, key, &varobj);
        Ok(Some(json!({
            "result": variable.value,
            "type": variable.var_type,
            "variablesReference": variable.variables_reference,
        })))
    }

    /// Thread argument for commands that act on every thread in all-stop mode
    fn thread_scope(&self, thread_id: u32) -> Option<u32> {
        self.backend.is_non_stop().then_some(thread_id)
    }

    async fn resume(&mut self, args: ThreadArguments) -> Result<Option<Value>> {
        self.backend.exec_continue(self.thread_scope(args.thread_id)).await?;
        Ok(Some(json!({ "allThreadsContinued": !self.backend.is_non_stop() })))
    }

    async fn step(&mut self, command: &str, args: ThreadArguments) -> Result<Option<Value>> {
        let thread = Some(args.thread_id);
        match (command, args.instruction_granularity()) {
            ("next", true) => self.backend.exec_next_instruction(thread).await?,
            ("next", false) => self.backend.exec_next(thread).await?,
            ("stepIn", true) => self.backend.exec_step_instruction(thread).await?,
            ("stepIn", false) => self.backend.exec_step(thread).await?,
            _ => self.backend.exec_finish(thread).await?,
        }
        Ok(None)
    }

    async fn pause(&mut self, args: ThreadArguments) -> Result<Option<Value>> {
        let thread = self.thread_scope(args.thread_id);
        if thread.map_or(false, |id| !self.state.tracker_guard().is_thread_running(id)) {
            return Ok(None);
        }
        self.backend.pause(thread).await?;
        Ok(None)
    }

    async fn disassemble(&mut self, args: DisassembleArguments) -> Result<Option<Value>> {
        let reference = calculate_memory_offset(&args.memory_reference, args.offset)?;
        let instructions: Vec<DisassembledInstruction> = disassemble_window(
            &self.backend,
            &mut self.labels,
            &reference,
            args.instruction_offset,
            args.instruction_count,
        )
        .await?
        .into_iter()
        .map(DisassembledInstruction::from)
        .collect();
        Ok(Some(json!({ "instructions": instructions })))
    }

    async fn read_memory(&mut self, args: ReadMemoryArguments) -> Result<Option<Value>> {
        if args.count == 0 {
            return Ok(Some(json!({ "address": args.memory_reference, "data": "" })));
        }
        let blocks = self
            .backend
            .data_read_memory_bytes(&args.memory_reference, args.count, args.offset)
            .await?;
        let Some(block) = blocks.first() else {
            return Ok(Some(json!({ "address": args.memory_reference, "unreadableBytes": args.count })));
        };

        let read = (block.contents.len() / 2) as u64;
        Ok(Some(json!({
            "address": block.begin,
            "data": hex_to_base64(&block.contents)?,
            "unreadableBytes": args.count.saturating_sub(read),
        })))
    }

    async fn write_memory(&mut self, args: WriteMemoryArguments) -> Result<Option<Value>> {
        let address = calculate_memory_offset(&args.memory_reference, args.offset)?;
        let hex = base64_to_hex(&args.data)?;
        if !hex.is_empty() {
            self.backend.data_write_memory_bytes(&address, &hex).await?;
        }
        Ok(Some(json!({ "bytesWritten": hex.len() / 2 })))
    }

    /// Raw command passthrough used by test harnesses
    async fn execute_command(&mut self, args: ExecuteCommandArguments) -> Result<Option<Value>> {
        self.state.start_capture();
        let result = if args.command.starts_with('-') {
            self.backend.send_command(&args.command).await
        } else {
            self.backend.interpreter_exec_console(&args.command).await
        };
        if let Some(pump) = &self.pump {
            pump.flush().await;
        }
        let console = self.state.finish_capture();
        let result = result?;
        Ok(Some(json!({
            "console": console,
            "result": serde_json::to_value(&result.results)?,
        })))
    }

    async fn disconnect(&mut self) -> Result<Option<Value>> {
        if let Some(mut target) = self.target.take() {
            if let Err(e) = target.disconnect(&self.backend).await {
                log::warn!("Disconnecting from {} failed: {}", target.describe(), e);
            }
        }
        Ok(None)
    }
}
