/// Typed GDB/MI command builders
///
/// Each method formats one MI command, sends it through the backend and
/// turns the result record into a typed value.

use crate::backend::GdbBackend;
use crate::parser::escape_c_string;
use crate::types::{GdbResult, Tuple, Value};
use crate::{GdbError, Result};

fn get_string(tuple: &Tuple, key: &str) -> Option<String> {
    tuple.get(key).and_then(Value::as_string).map(str::to_string)
}

fn get_number<T: std::str::FromStr>(tuple: &Tuple, key: &str) -> Option<T> {
    tuple.get(key).and_then(Value::as_string).and_then(|s| s.parse().ok())
}

fn require_string(tuple: &Tuple, key: &str) -> Result<String> {
    get_string(tuple, key).ok_or_else(|| GdbError::MissingField(key.to_string()))
}

fn require_tuple<'a>(result: &'a GdbResult, key: &str) -> Result<&'a Tuple> {
    result
        .get(key)
        .and_then(Value::as_tuple)
        .ok_or_else(|| GdbError::MissingField(key.to_string()))
}

fn tuples(value: Option<&Value>) -> impl Iterator<Item = &Tuple> {
    value
        .and_then(Value::as_list)
        .into_iter()
        .flatten()
        .filter_map(Value::as_tuple)
}

/// `--thread N --frame M` global options
fn context_args(thread_id: Option<u32>, frame_level: Option<u32>) -> String {
    let mut args = String::new();
    if let Some(thread) = thread_id {
        args.push_str(&format!(" --thread {}", thread));
    }
    if let Some(frame) = frame_level {
        args.push_str(&format!(" --frame {}", frame));
    }
    args
}

/// Represents a breakpoint table row
#[derive(Debug, Clone, PartialEq)]
pub struct Breakpoint {
    /// Kept as text: child locations are numbered `1.1`, `1.2`, ...
    pub number: String,
    pub bp_type: Option<String>,
    pub enabled: bool,
    pub addr: Option<String>,
    pub func: Option<String>,
    pub file: Option<String>,
    pub fullname: Option<String>,
    pub line: Option<u32>,
    pub cond: Option<String>,
    pub original_location: Option<String>,
    pub times: u32,
}

impl Breakpoint {
    pub fn from_tuple(tuple: &Tuple) -> Result<Self> {
        let number = require_string(tuple, "number")?;

        // MI3 nests the per-location rows of a <MULTIPLE> breakpoint
        let first_location = tuples(tuple.get("locations")).next();
        let fullname = get_string(tuple, "fullname")
            .or_else(|| first_location.and_then(|loc| get_string(loc, "fullname")));
        let line = get_number(tuple, "line").or_else(|| first_location.and_then(|loc| get_number(loc, "line")));

        Ok(Breakpoint {
            number,
            bp_type: get_string(tuple, "type"),
            enabled: tuple.get("enabled").and_then(Value::as_string).map(|s| s == "y").unwrap_or(false),
            addr: get_string(tuple, "addr"),
            func: get_string(tuple, "func"),
            file: get_string(tuple, "file"),
            fullname,
            line,
            cond: get_string(tuple, "cond"),
            original_location: get_string(tuple, "original-location"),
            times: get_number(tuple, "times").unwrap_or(0),
        })
    }

    /// A `<MULTIPLE>` location row rather than a breakpoint of its own
    pub fn is_location_row(&self) -> bool {
        self.number.contains('.')
    }

    pub fn is_dprintf(&self) -> bool {
        self.bp_type.as_deref() == Some("dprintf")
    }
}

/// Merge MI2 `N.M` location rows into breakpoint `N`.
///
/// The parent of a `<MULTIPLE>` breakpoint carries no source position in
/// MI2; it is taken from its first location.
pub fn fold_location_rows(rows: Vec<Breakpoint>) -> Vec<Breakpoint> {
    let mut folded: Vec<Breakpoint> = Vec::with_capacity(rows.len());
    for row in rows {
        if !row.is_location_row() {
            folded.push(row);
            continue;
        }
        let parent_number = row.number.split('.').next().unwrap_or_default();
        let Some(parent) = folded.iter_mut().rev().find(|bp| bp.number == parent_number) else {
            log::warn!("Breakpoint location {} has no parent row", row.number);
            continue;
        };
        if parent.fullname.is_none() {
            parent.fullname = row.fullname;
            parent.file = parent.file.take().or(row.file);
            parent.line = parent.line.or(row.line);
            parent.func = parent.func.take().or(row.func);
        }
    }
    folded
}

/// Options for `-break-insert` / `-dprintf-insert`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BreakpointInsertOptions {
    pub temporary: bool,
    pub hardware: bool,
    pub condition: Option<String>,
    pub ignore_count: Option<u32>,
    /// Turns the insert into a `dprintf` with this format string
    pub log_message: Option<String>,
}

/// Represents a stack frame
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrame {
    pub level: u32,
    pub addr: String,
    pub func: Option<String>,
    pub file: Option<String>,
    pub fullname: Option<String>,
    pub line: Option<u32>,
}

impl StackFrame {
    pub fn from_tuple(tuple: &Tuple) -> Result<Self> {
        let level = get_number(tuple, "level").ok_or_else(|| GdbError::MissingField("level".to_string()))?;
        let addr = require_string(tuple, "addr")?;

        Ok(StackFrame {
            level,
            addr,
            func: get_string(tuple, "func"),
            file: get_string(tuple, "file"),
            fullname: get_string(tuple, "fullname"),
            line: get_number(tuple, "line"),
        })
    }
}

/// Represents a variable from `-stack-list-variables`
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub value: Option<String>,
    pub var_type: Option<String>,
    pub is_arg: bool,
}

impl Variable {
    pub fn from_tuple(tuple: &Tuple) -> Result<Self> {
        Ok(Variable {
            name: require_string(tuple, "name")?,
            value: get_string(tuple, "value"),
            var_type: get_string(tuple, "type"),
            is_arg: get_string(tuple, "arg").as_deref() == Some("1"),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadRecord {
    pub id: u32,
    pub target_id: Option<String>,
    pub name: Option<String>,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ThreadInfo {
    pub threads: Vec<ThreadRecord>,
    pub current_thread_id: Option<u32>,
}

/// Result of `-var-create`
#[derive(Debug, Clone, PartialEq)]
pub struct VarCreateResult {
    pub name: String,
    pub numchild: u32,
    pub value: String,
    pub var_type: String,
}

/// One entry of a `-var-update` changelist
#[derive(Debug, Clone, PartialEq)]
pub struct VarChange {
    pub name: String,
    pub value: Option<String>,
    /// `true`, `false` or `invalid`
    pub in_scope: String,
    pub type_changed: bool,
}

/// One child from `-var-list-children`
#[derive(Debug, Clone, PartialEq)]
pub struct VarChild {
    pub name: String,
    pub exp: String,
    pub numchild: u32,
    pub value: Option<String>,
    pub var_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryBlock {
    pub begin: String,
    pub offset: String,
    pub end: String,
    /// Hex digits, two per byte
    pub contents: String,
}

/// One disassembled instruction from `-data-disassemble`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AsmInstruction {
    pub address: String,
    pub func_name: Option<String>,
    pub offset: Option<u64>,
    pub opcodes: Option<String>,
    pub inst: String,
    pub file: Option<String>,
    pub fullname: Option<String>,
    pub line: Option<u32>,
}

impl AsmInstruction {
    fn from_tuple(tuple: &Tuple, source: Option<&Tuple>) -> Result<Self> {
        Ok(AsmInstruction {
            address: require_string(tuple, "address")?,
            func_name: get_string(tuple, "func-name"),
            offset: get_number(tuple, "offset"),
            opcodes: get_string(tuple, "opcodes"),
            inst: get_string(tuple, "inst").unwrap_or_default(),
            file: source.and_then(|s| get_string(s, "file")),
            fullname: source.and_then(|s| get_string(s, "fullname")),
            line: source.and_then(|s| get_number(s, "line")),
        })
    }
}

impl GdbBackend {
    /// Load executable file
    pub async fn file_exec_and_symbols(&self, path: &str) -> Result<()> {
        self.send_command(&format!("-file-exec-and-symbols {}", escape_c_string(path)))
            .await?;
        Ok(())
    }

    pub async fn exec_arguments(&self, arguments: &str) -> Result<()> {
        self.send_command(&format!("-exec-arguments {}", arguments)).await?;
        Ok(())
    }

    pub async fn environment_cd(&self, dir: &str) -> Result<()> {
        self.send_command(&format!("-environment-cd {}", escape_c_string(dir)))
            .await?;
        Ok(())
    }

    pub async fn gdb_set(&self, variable: &str, value: &str) -> Result<()> {
        self.send_command(&format!("-gdb-set {} {}", variable, value)).await?;
        Ok(())
    }

    /// Run a CLI command; its output arrives on the console stream
    pub async fn interpreter_exec_console(&self, command: &str) -> Result<GdbResult> {
        self.send_command(&format!("-interpreter-exec console {}", escape_c_string(command)))
            .await
    }

    pub async fn target_select(&self, target_type: &str, params: &str) -> Result<()> {
        self.send_command(&format!("-target-select {} {}", target_type, params))
            .await?;
        Ok(())
    }

    pub async fn target_attach(&self, pid: u32) -> Result<()> {
        self.send_command(&format!("-target-attach {}", pid)).await?;
        Ok(())
    }

    pub async fn target_detach(&self) -> Result<()> {
        self.send_command("-target-detach").await?;
        Ok(())
    }

    /// Set a breakpoint (or a dprintf when `log_message` is set)
    pub async fn break_insert(&self, location: &str, options: &BreakpointInsertOptions) -> Result<Breakpoint> {
        let mut cmd = String::from(if options.log_message.is_some() {
            "-dprintf-insert"
        } else {
            "-break-insert"
        });
        if options.temporary {
            cmd.push_str(" -t");
        }
        if options.hardware && options.log_message.is_none() {
            cmd.push_str(" -h");
        }
        cmd.push_str(" -f");
        if let Some(condition) = options.condition.as_deref().filter(|c| !c.trim().is_empty()) {
            cmd.push_str(&format!(" -c {}", escape_c_string(condition)));
        }
        if let Some(ignore) = options.ignore_count.filter(|n| *n > 0) {
            cmd.push_str(&format!(" -i {}", ignore));
        }
        cmd.push(' ');
        cmd.push_str(location);
        if let Some(message) = &options.log_message {
            cmd.push(' ');
            cmd.push_str(&escape_c_string(&format!("{}\n", message)));
        }

        let result = self.send_command(&cmd).await?;
        Breakpoint::from_tuple(require_tuple(&result, "bkpt")?)
    }

    /// Delete breakpoints
    pub async fn break_delete(&self, numbers: &[String]) -> Result<()> {
        if numbers.is_empty() {
            return Ok(());
        }
        self.send_command(&format!("-break-delete {}", numbers.join(" ")))
            .await?;
        Ok(())
    }

    /// List all breakpoints
    pub async fn break_list(&self) -> Result<Vec<Breakpoint>> {
        let result = self.send_command("-break-list").await?;
        let table = require_tuple(&result, "BreakpointTable")?;

        let rows = tuples(table.get("body"))
            .map(Breakpoint::from_tuple)
            .collect::<Result<Vec<_>>>()?;
        Ok(fold_location_rows(rows))
    }

    /// Start execution
    pub async fn exec_run(&self) -> Result<()> {
        self.send_command("-exec-run").await?;
        Ok(())
    }

    /// Continue execution, one thread in non-stop mode
    pub async fn exec_continue(&self, thread_id: Option<u32>) -> Result<()> {
        self.send_command(&format!("-exec-continue{}", context_args(thread_id, None)))
            .await?;
        Ok(())
    }

    pub async fn exec_next(&self, thread_id: Option<u32>) -> Result<()> {
        self.send_command(&format!("-exec-next{}", context_args(thread_id, None)))
            .await?;
        Ok(())
    }

    pub async fn exec_step(&self, thread_id: Option<u32>) -> Result<()> {
        self.send_command(&format!("-exec-step{}", context_args(thread_id, None)))
            .await?;
        Ok(())
    }

    pub async fn exec_next_instruction(&self, thread_id: Option<u32>) -> Result<()> {
        self.send_command(&format!("-exec-next-instruction{}", context_args(thread_id, None)))
            .await?;
        Ok(())
    }

    pub async fn exec_step_instruction(&self, thread_id: Option<u32>) -> Result<()> {
        self.send_command(&format!("-exec-step-instruction{}", context_args(thread_id, None)))
            .await?;
        Ok(())
    }

    /// Step out of current function
    pub async fn exec_finish(&self, thread_id: Option<u32>) -> Result<()> {
        self.send_command(&format!("-exec-finish{}", context_args(thread_id, None)))
            .await?;
        Ok(())
    }

    pub async fn thread_info(&self) -> Result<ThreadInfo> {
        let result = self.send_command("-thread-info").await?;
        let mut threads = Vec::new();
        for thread in tuples(result.get("threads")) {
            let Some(id) = get_number(thread, "id") else {
                continue;
            };
            threads.push(ThreadRecord {
                id,
                target_id: get_string(thread, "target-id"),
                name: get_string(thread, "name").or_else(|| get_string(thread, "details")),
                running: get_string(thread, "state").as_deref() == Some("running"),
            });
        }
        Ok(ThreadInfo {
            threads,
            current_thread_id: result.get_str("current-thread-id").and_then(|s| s.parse().ok()),
        })
    }

    /// Get stack frames
    pub async fn stack_list_frames(&self, thread_id: u32, low_frame: u32, high_frame: u32) -> Result<Vec<StackFrame>> {
        let cmd = format!(
            "-stack-list-frames{} {} {}",
            context_args(Some(thread_id), None),
            low_frame,
            high_frame
        );
        let result = self.send_command(&cmd).await?;
        tuples(result.get("stack")).map(StackFrame::from_tuple).collect()
    }

    pub async fn stack_info_depth(&self, thread_id: u32, max_depth: u32) -> Result<u32> {
        let result = self
            .send_command(&format!("-stack-info-depth{} {}", context_args(Some(thread_id), None), max_depth))
            .await?;
        result
            .get_str("depth")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| GdbError::MissingField("depth".to_string()))
    }

    /// List local variables and arguments of a frame
    pub async fn stack_list_variables(&self, thread_id: u32, frame_level: u32) -> Result<Vec<Variable>> {
        let cmd = format!(
            "-stack-list-variables{} --simple-values",
            context_args(Some(thread_id), Some(frame_level))
        );
        let result = self.send_command(&cmd).await?;
        tuples(result.get("variables")).map(Variable::from_tuple).collect()
    }

    pub async fn var_create(&self, thread_id: u32, frame_level: u32, expression: &str) -> Result<VarCreateResult> {
        let cmd = format!(
            "-var-create{} - * {}",
            context_args(Some(thread_id), Some(frame_level)),
            escape_c_string(expression)
        );
        let result = self.send_command(&cmd).await?;
        Ok(VarCreateResult {
            name: result
                .get_str("name")
                .map(str::to_string)
                .ok_or_else(|| GdbError::MissingField("name".to_string()))?,
            numchild: result.get_str("numchild").and_then(|s| s.parse().ok()).unwrap_or(0),
            value: result.get_str("value").unwrap_or_default().to_string(),
            var_type: result.get_str("type").unwrap_or_default().to_string(),
        })
    }

    pub async fn var_update(&self, name: &str) -> Result<Vec<VarChange>> {
        let result = self.send_command(&format!("-var-update --all-values {}", name)).await?;
        Ok(tuples(result.get("changelist"))
            .filter_map(|change| {
                Some(VarChange {
                    name: get_string(change, "name")?,
                    value: get_string(change, "value"),
                    in_scope: get_string(change, "in_scope").unwrap_or_else(|| "true".to_string()),
                    type_changed: get_string(change, "type_changed").as_deref() == Some("true"),
                })
            })
            .collect())
    }

    pub async fn var_delete(&self, name: &str) -> Result<()> {
        self.send_command(&format!("-var-delete {}", name)).await?;
        Ok(())
    }

    pub async fn var_list_children(&self, name: &str) -> Result<Vec<VarChild>> {
        let result = self
            .send_command(&format!("-var-list-children --simple-values {}", name))
            .await?;
        tuples(result.get("children"))
            .map(|child| {
                Ok(VarChild {
                    name: require_string(child, "name")?,
                    exp: get_string(child, "exp").unwrap_or_default(),
                    numchild: get_number(child, "numchild").unwrap_or(0),
                    value: get_string(child, "value"),
                    var_type: get_string(child, "type"),
                })
            })
            .collect()
    }

    pub async fn var_assign(&self, name: &str, expression: &str) -> Result<String> {
        let result = self
            .send_command(&format!("-var-assign {} {}", name, escape_c_string(expression)))
            .await?;
        Ok(result.get_str("value").unwrap_or_default().to_string())
    }

    pub async fn var_info_path_expression(&self, name: &str) -> Result<String> {
        let result = self
            .send_command(&format!("-var-info-path-expression {}", name))
            .await?;
        result
            .get_str("path_expr")
            .map(str::to_string)
            .ok_or_else(|| GdbError::MissingField("path_expr".to_string()))
    }

    /// Evaluate expression
    pub async fn data_evaluate_expression(
        &self,
        thread_id: Option<u32>,
        frame_level: Option<u32>,
        expression: &str,
    ) -> Result<String> {
        let cmd = format!(
            "-data-evaluate-expression{} {}",
            context_args(thread_id, frame_level),
            escape_c_string(expression)
        );
        let result = self.send_command(&cmd).await?;
        result
            .get_str("value")
            .map(str::to_string)
            .ok_or_else(|| GdbError::MissingField("value".to_string()))
    }

    /// Read `count` bytes at `address + offset`
    pub async fn data_read_memory_bytes(&self, address: &str, count: u64, offset: i64) -> Result<Vec<MemoryBlock>> {
        let cmd = format!(
            "-data-read-memory-bytes -o {} {} {}",
            offset,
            escape_c_string(address),
            count
        );
        let result = self.send_command(&cmd).await?;
        tuples(result.get("memory"))
            .map(|block| {
                Ok(MemoryBlock {
                    begin: require_string(block, "begin")?,
                    offset: get_string(block, "offset").unwrap_or_else(|| "0x0".to_string()),
                    end: require_string(block, "end")?,
                    contents: require_string(block, "contents")?,
                })
            })
            .collect()
    }

    pub async fn data_write_memory_bytes(&self, address: &str, hex: &str) -> Result<()> {
        self.send_command(&format!("-data-write-memory-bytes {} {}", escape_c_string(address), hex))
            .await?;
        Ok(())
    }

    /// Disassemble `[start, end)` with source and raw opcodes (mode 5)
    pub async fn data_disassemble(&self, start: &str, end: &str) -> Result<Vec<AsmInstruction>> {
        let cmd = format!(
            "-data-disassemble -s {} -e {} -- 5",
            escape_c_string(start),
            escape_c_string(end)
        );
        let result = self.send_command(&cmd).await?;

        let mut instructions = Vec::new();
        for entry in tuples(result.get("asm_insns")) {
            match entry.get("line_asm_insn") {
                Some(lines) => {
                    for line in tuples(Some(lines)) {
                        instructions.push(AsmInstruction::from_tuple(line, Some(entry))?);
                    }
                }
                None => instructions.push(AsmInstruction::from_tuple(entry, None)?),
            }
        }
        Ok(instructions)
    }

    pub async fn data_list_register_names(&self) -> Result<Vec<String>> {
        let result = self.send_command("-data-list-register-names").await?;
        Ok(result
            .get("register-names")
            .and_then(Value::as_list)
            .map(|names| {
                names
                    .iter()
                    .map(|name| name.as_string().unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// `(register number, value)` pairs in natural format
    pub async fn data_list_register_values(&self, thread_id: u32, frame_level: u32) -> Result<Vec<(u32, String)>> {
        let cmd = format!(
            "-data-list-register-values{} N",
            context_args(Some(thread_id), Some(frame_level))
        );
        let result = self.send_command(&cmd).await?;
        Ok(tuples(result.get("register-values"))
            .filter_map(|reg| Some((get_number(reg, "number")?, get_string(reg, "value")?)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_results;

    #[test]
    fn test_mi2_locations_fold_into_parent() {
        let results = parse_results(
            r#"body=[bkpt={number="1",type="breakpoint",disp="keep",enabled="y",addr="<MULTIPLE>",times="0",original-location="-source /src/a.h -line 7"},{number="1.1",enabled="y",addr="0x1139",func="f",file="a.h",fullname="/src/a.h",line="7"},{number="1.2",enabled="y",addr="0x1239",func="g",file="a.h",fullname="/src/a.h",line="7"},bkpt={number="2",type="breakpoint",disp="keep",enabled="y",addr="0x2000",func="main",file="b.c",fullname="/src/b.c",line="3",times="0"}]"#,
        )
        .unwrap();
        let rows = tuples(results.get("body"))
            .map(Breakpoint::from_tuple)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        let folded = fold_location_rows(rows);
        assert_eq!(folded.len(), 2);
        assert_eq!(folded[0].number, "1");
        assert_eq!(folded[0].fullname.as_deref(), Some("/src/a.h"));
        assert_eq!(folded[0].line, Some(7));
        assert_eq!(folded[0].func.as_deref(), Some("f"));
        assert_eq!(folded[1].fullname.as_deref(), Some("/src/b.c"));
    }

    #[test]
    fn test_breakpoint_from_mi3_multiple() {
        let results = parse_results(
            r#"bkpt={number="2",type="breakpoint",disp="keep",enabled="y",addr="<MULTIPLE>",cond="x > 1",times="0",original-location="-source /src/a.c -line 5",locations=[{number="2.1",enabled="y",addr="0x1",func="f",file="a.c",fullname="/src/a.c",line="5"}]}"#,
        )
        .unwrap();
        let bp = Breakpoint::from_tuple(results.get("bkpt").unwrap().as_tuple().unwrap()).unwrap();

        assert_eq!(bp.number, "2");
        assert!(bp.enabled);
        assert!(!bp.is_location_row());
        assert_eq!(bp.fullname.as_deref(), Some("/src/a.c"));
        assert_eq!(bp.line, Some(5));
        assert_eq!(bp.cond.as_deref(), Some("x > 1"));
        assert_eq!(bp.original_location.as_deref(), Some("-source /src/a.c -line 5"));
    }

    #[test]
    fn test_stack_frame_requires_level() {
        let results = parse_results(r#"frame={addr="0x1",func="main"}"#).unwrap();
        let err = StackFrame::from_tuple(results.get("frame").unwrap().as_tuple().unwrap()).unwrap_err();
        assert!(matches!(err, GdbError::MissingField(field) if field == "level"));
    }

    #[test]
    fn test_context_args() {
        assert_eq!(context_args(None, None), "");
        assert_eq!(context_args(Some(2), Some(0)), " --thread 2 --frame 0");
    }
}
