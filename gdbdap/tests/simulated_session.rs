/// Whole DAP sessions against a scripted GDB

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gdbadapter::{GdbBackend, GdbEvents};
use gdbdap::protocol::DapRequest;
use gdbdap::transport::spawn_writer;
use gdbdap::{DapReader, DapWriter, DebugSession};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

type CommandLog = Arc<Mutex<Vec<String>>>;

async fn simulated_gdb<F>(respond: F) -> (GdbBackend, GdbEvents, CommandLog)
where
    F: Fn(&str) -> Vec<String> + Send + 'static,
{
    let (mut backend, events) = GdbBackend::new();
    backend.set_version_output("GNU gdb (GDB) 10.1\nCopyright (C) 2020 Free Software Foundation, Inc.");

    let (stdin_ours, stdin_gdb) = duplex(1 << 16);
    let (mut stdout_gdb, stdout_ours) = duplex(1 << 16);
    backend.connect_streams(stdin_ours, stdout_ours).await;

    let log: CommandLog = Arc::new(Mutex::new(Vec::new()));
    let seen = log.clone();
    tokio::spawn(async move {
        if stdout_gdb.write_all(b"(gdb) \n").await.is_err() {
            return;
        }
        let mut lines = BufReader::new(stdin_gdb).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let split = line.find(|c: char| !c.is_ascii_digit()).unwrap_or(line.len());
            let (token, command) = line.split_at(split);
            seen.lock().unwrap().push(command.to_string());

            let mut out = String::new();
            for reply in respond(command) {
                if reply.starts_with('^') {
                    out.push_str(token);
                }
                out.push_str(&reply);
                out.push('\n');
            }
            out.push_str("(gdb) \n");
            if stdout_gdb.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    (backend, events, log)
}

fn gdb_replies(command: &str) -> Vec<String> {
    let lines: &[&str] = match command {
        "-break-list" => &[r#"^done,BreakpointTable={nr_rows="0",nr_cols="6",hdr=[],body=[]}"#],
        "-break-insert -f --source \"/src/a.c\" --line 7" => &[
            r#"^done,bkpt={number="1",type="breakpoint",disp="keep",enabled="y",addr="0x0000000000001139",func="main",file="a.c",fullname="/src/a.c",line="7",thread-groups=["i1"],times="0",original-location="-source /src/a.c -line 7"}"#,
        ],
        "-exec-run" => &[
            "=thread-group-started,id=\"i1\",pid=\"4242\"",
            "=thread-created,id=\"1\",group-id=\"i1\"",
            "^running",
            "*running,thread-id=\"all\"",
            r#"*stopped,reason="breakpoint-hit",disp="keep",bkptno="1",frame={addr="0x0000000000001139",func="main",args=[],file="a.c",fullname="/src/a.c",line="7"},thread-id="1",stopped-threads="all""#,
        ],
        "-interpreter-exec console \"info line\"" => &[
            r#"~"Line 7 of \"a.c\" starts at address 0x1139.\n""#,
            "^done",
        ],
        _ => &["^done"],
    };
    lines.iter().map(|l| l.to_string()).collect()
}

struct Client {
    session: DebugSession,
    reader: DapReader<BufReader<DuplexStream>>,
    seq: i64,
}

impl Client {
    async fn new() -> (Self, CommandLog) {
        Self::with_gdb(gdb_replies).await
    }

    async fn with_gdb<F>(respond: F) -> (Self, CommandLog)
    where
        F: Fn(&str) -> Vec<String> + Send + 'static,
    {
        let (backend, events, log) = simulated_gdb(respond).await;
        let (ours, theirs) = duplex(1 << 16);
        let (sink, _writer) = spawn_writer(DapWriter::new(ours));
        let client = Self {
            session: DebugSession::with_backend(backend, events, sink),
            reader: DapReader::new(BufReader::new(theirs)),
            seq: 0,
        };
        (client, log)
    }

    /// Send a request and collect everything written up to its response
    async fn request(&mut self, command: &str, arguments: Value) -> (Value, Vec<Value>) {
        self.seq += 1;
        let request: DapRequest = serde_json::from_value(json!({
            "seq": self.seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        }))
        .unwrap();
        assert!(self.session.dispatch(request).await);

        let mut events = Vec::new();
        loop {
            let message = self.next_message().await;
            if message["type"] == "response" && message["request_seq"] == self.seq {
                return (message, events);
            }
            events.push(message);
        }
    }

    async fn next_message(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_message())
            .await
            .expect("DAP message in time")
            .unwrap()
            .unwrap()
    }

    /// Wait for a given event
    async fn event(&mut self, name: &str) -> Value {
        loop {
            let message = self.next_message().await;
            if message["type"] == "event" && message["event"] == name {
                return message;
            }
        }
    }
}

fn count(log: &CommandLog, prefix: &str) -> usize {
    log.lock().unwrap().iter().filter(|c| c.starts_with(prefix)).count()
}

#[tokio::test]
async fn test_launch_and_set_one_breakpoint() {
    let (mut client, log) = Client::new().await;

    let (response, _) = client.request("initialize", json!({ "adapterID": "gdb" })).await;
    assert_eq!(response["success"], true);
    assert_eq!(response["body"]["supportsConfigurationDoneRequest"], true);

    let (response, events) = client.request("launch", json!({ "program": "/tmp/prog" })).await;
    assert_eq!(response["success"], true, "{}", response);
    assert!(events.iter().any(|e| e["event"] == "initialized"));

    let (response, _) = client
        .request(
            "setBreakpoints",
            json!({ "source": { "path": "/src/a.c" }, "breakpoints": [{ "line": 7 }] }),
        )
        .await;
    assert_eq!(response["success"], true, "{}", response);
    let breakpoints = response["body"]["breakpoints"].as_array().unwrap();
    assert_eq!(breakpoints.len(), 1);
    assert_eq!(breakpoints[0]["verified"], true);
    assert_eq!(breakpoints[0]["id"], 1);
    assert_eq!(breakpoints[0]["line"], 7);
    assert_eq!(count(&log, "-break-insert"), 1);

    let commands = log.lock().unwrap().clone();
    assert_eq!(
        &commands[..3],
        &["-gdb-set non-stop off", "-gdb-set mi-async on", "-file-exec-and-symbols \"/tmp/prog\""]
    );
}

#[tokio::test]
async fn test_run_reports_breakpoint_stop() {
    let (mut client, log) = Client::new().await;
    client.request("launch", json!({ "program": "/tmp/prog" })).await;
    client
        .request(
            "setBreakpoints",
            json!({ "source": { "path": "/src/a.c" }, "breakpoints": [{ "line": 7 }] }),
        )
        .await;

    let (response, events) = client.request("configurationDone", Value::Null).await;
    assert_eq!(response["success"], true);
    assert_eq!(count(&log, "-exec-run"), 1);

    // The pump may get there before or after the response
    let stopped = match events.into_iter().find(|e| e["event"] == "stopped") {
        Some(stopped) => stopped,
        None => client.event("stopped").await,
    };
    assert_eq!(stopped["body"]["reason"], "breakpoint");
    assert_eq!(stopped["body"]["threadId"], 1);
    assert_eq!(stopped["body"]["hitBreakpointIds"], json!([1]));
}

#[tokio::test]
async fn test_execute_command_returns_console_output() {
    let (mut client, _log) = Client::new().await;
    client.request("launch", json!({ "program": "/tmp/prog" })).await;

    let (response, _) = client
        .request("cdt-gdb-tests/executeCommand", json!({ "command": "info line" }))
        .await;
    assert_eq!(response["success"], true, "{}", response);
    assert_eq!(
        response["body"]["console"],
        json!(["Line 7 of \"a.c\" starts at address 0x1139.\n"])
    );
}

#[tokio::test]
async fn test_bad_memory_payload_is_rejected() {
    let (mut client, log) = Client::new().await;
    client.request("launch", json!({ "program": "/tmp/prog" })).await;

    let (response, _) = client
        .request("writeMemory", json!({ "memoryReference": "0x1000", "data": "AQ=" }))
        .await;
    assert_eq!(response["success"], false);
    assert!(response["message"].as_str().unwrap().contains("ill-formed base64"));
    assert_eq!(count(&log, "-data-write-memory-bytes"), 0);
}

#[tokio::test]
async fn test_unknown_variables_reference() {
    let (mut client, _log) = Client::new().await;
    let (response, _) = client.request("variables", json!({ "variablesReference": 77 })).await;
    assert_eq!(response["success"], false);
    assert_eq!(response["message"], "Unknown variables reference 77");
}

#[tokio::test]
async fn test_exit_is_reported_once() {
    let (mut client, _log) = Client::with_gdb(|command: &str| match command {
        "-exec-run" => vec![
            "^running".to_string(),
            "*running,thread-id=\"all\"".to_string(),
            "=thread-group-exited,id=\"i1\",exit-code=\"03\"".to_string(),
            "*stopped,reason=\"exited\",exit-code=\"03\"".to_string(),
        ],
        other => gdb_replies(other),
    })
    .await;
    client.request("launch", json!({ "program": "/tmp/prog" })).await;
    let (_, mut seen) = client.request("configurationDone", Value::Null).await;

    // The passthrough drains the pump before it answers
    let (_, later) = client
        .request("cdt-gdb-tests/executeCommand", json!({ "command": "info line" }))
        .await;
    seen.extend(later);

    let exited: Vec<&Value> = seen.iter().filter(|e| e["event"] == "exited").collect();
    assert_eq!(exited.len(), 1);
    assert_eq!(exited[0]["body"]["exitCode"], 3);
    assert_eq!(seen.iter().filter(|e| e["event"] == "terminated").count(), 1);
}

/// A stopped program with `struct point p` (C++ access specifiers around its
/// fields) and `char buf[16]`. `-exec-next` changes `p.x` from 1 to 2.
fn inspection_replies(stepped: Arc<AtomicBool>) -> impl Fn(&str) -> Vec<String> + Send + 'static {
    move |command: &str| {
        let x = if stepped.load(Ordering::SeqCst) { "2" } else { "1" };
        let lines: Vec<String> = match command {
            "-exec-next" => {
                stepped.store(true, Ordering::SeqCst);
                vec![
                    "^running".to_string(),
                    "*running,thread-id=\"all\"".to_string(),
                    r#"*stopped,reason="end-stepping-range",frame={addr="0x113d",func="main",file="a.c",fullname="/src/a.c",line="8"},thread-id="1",stopped-threads="all""#.to_string(),
                ]
            }
            "-stack-info-depth --thread 1 100" => vec![r#"^done,depth="1""#.to_string()],
            "-stack-list-frames --thread 1 0 0" => vec![
                r#"^done,stack=[frame={level="0",addr="0x1139",func="main",file="a.c",fullname="/src/a.c",line="7"}]"#.to_string(),
            ],
            "-stack-list-variables --thread 1 --frame 0 --simple-values" => vec![
                r#"^done,variables=[{name="p",type="struct point"},{name="buf",type="char [16]"}]"#.to_string(),
            ],
            "-var-create --thread 1 --frame 0 - * \"p\"" => vec![
                r#"^done,name="var1",numchild="1",value="{...}",type="struct point",has_more="0""#.to_string(),
            ],
            "-var-create --thread 1 --frame 0 - * \"buf\"" => vec![
                r#"^done,name="var2",numchild="16",value="[16]",type="char [16]",has_more="0""#.to_string(),
            ],
            "-var-list-children --simple-values var1" => vec![
                r#"^done,numchild="1",children=[child={name="var1.public",exp="public",numchild="2"}],has_more="0""#.to_string(),
            ],
            "-var-list-children --simple-values var1.public" => vec![format!(
                r#"^done,numchild="2",children=[child={{name="var1.public.x",exp="x",numchild="0",value="{}",type="int"}},child={{name="var1.public.tag",exp="tag",numchild="4",type="char [4]"}}],has_more="0""#,
                x
            )],
            "-var-info-path-expression var1.public.x" => vec![r#"^done,path_expr="p.x""#.to_string()],
            "-var-info-path-expression var1.public.tag" => vec![r#"^done,path_expr="p.tag""#.to_string()],
            "-data-evaluate-expression --thread 1 --frame 0 \"&(buf)\"" => {
                vec![r#"^done,value="(char (*)[16]) 0x7ffe0010""#.to_string()]
            }
            "-data-evaluate-expression --thread 1 --frame 0 \"&(p.tag)\"" => {
                vec![r#"^done,value="(char (*)[4]) 0x7ffe0020""#.to_string()]
            }
            "-var-assign var1.public.x \"7\"" => vec![r#"^done,value="7""#.to_string()],
            "-var-update --all-values var1.public.x" => vec![
                r#"^done,changelist=[{name="var1.public.x",value="7",in_scope="true",type_changed="false",has_more="0"}]"#.to_string(),
            ],
            "-data-read-memory-bytes -o 0 \"0x1000\" 4" => vec![
                r#"^done,memory=[{begin="0x1000",offset="0x0",end="0x1004",contents="01020304"}]"#.to_string(),
            ],
            other => gdb_replies(other),
        };
        lines
    }
}

fn by_name<'a>(variables: &'a Value, name: &str) -> &'a Value {
    variables["body"]["variables"]
        .as_array()
        .unwrap()
        .iter()
        .find(|v| v["name"] == name)
        .unwrap_or_else(|| panic!("no variable {} in {}", name, variables))
}

impl Client {
    /// Wait for the next stop, which may already be among `events`
    async fn stopped(&mut self, events: Vec<Value>) -> Value {
        match events.into_iter().find(|e| e["event"] == "stopped") {
            Some(stopped) => stopped,
            None => self.event("stopped").await,
        }
    }

    /// Top frame's locals reference
    async fn locals_reference(&mut self) -> Value {
        let (trace, _) = self.request("stackTrace", json!({ "threadId": 1 })).await;
        assert_eq!(trace["success"], true, "{}", trace);
        let frame_id = trace["body"]["stackFrames"][0]["id"].clone();
        let (scopes, _) = self.request("scopes", json!({ "frameId": frame_id })).await;
        assert_eq!(scopes["body"]["scopes"][0]["name"], "Local");
        scopes["body"]["scopes"][0]["variablesReference"].clone()
    }
}

#[tokio::test]
async fn test_variables_follow_the_program() {
    let stepped = Arc::new(AtomicBool::new(false));
    let (mut client, _log) = Client::with_gdb(inspection_replies(stepped)).await;
    client.request("launch", json!({ "program": "/tmp/prog" })).await;
    let (_, events) = client.request("configurationDone", Value::Null).await;
    client.stopped(events).await;

    let locals = client.locals_reference().await;
    let (response, _) = client.request("variables", json!({ "variablesReference": locals })).await;
    assert_eq!(response["success"], true, "{}", response);
    assert_eq!(by_name(&response, "buf")["value"], "(char (*)[16]) 0x7ffe0010");
    let point = by_name(&response, "p")["variablesReference"].clone();
    assert_ne!(point, 0);

    // `public` is skipped, its fields show up directly
    let (fields, _) = client.request("variables", json!({ "variablesReference": point })).await;
    assert_eq!(fields["body"]["variables"].as_array().unwrap().len(), 2);
    assert_eq!(by_name(&fields, "x")["value"], "1");
    assert_eq!(by_name(&fields, "x")["evaluateName"], "p.x");
    assert_eq!(by_name(&fields, "tag")["value"], "(char (*)[4]) 0x7ffe0020");

    let (_, events) = client.request("next", json!({ "threadId": 1 })).await;
    let stopped = client.stopped(events).await;
    assert_eq!(stopped["body"]["reason"], "step");

    let locals = client.locals_reference().await;
    let (response, _) = client.request("variables", json!({ "variablesReference": locals })).await;
    let point = by_name(&response, "p")["variablesReference"].clone();
    let (fields, _) = client.request("variables", json!({ "variablesReference": point })).await;
    assert_eq!(by_name(&fields, "x")["value"], "2");

    let (assigned, _) = client
        .request(
            "setVariable",
            json!({ "variablesReference": point, "name": "x", "value": "7" }),
        )
        .await;
    assert_eq!(assigned["success"], true, "{}", assigned);
    assert_eq!(assigned["body"]["value"], "7");
    assert_eq!(assigned["body"]["type"], "int");
}

#[tokio::test]
async fn test_evaluate_array_and_read_memory() {
    let stepped = Arc::new(AtomicBool::new(false));
    let (mut client, _log) = Client::with_gdb(inspection_replies(stepped)).await;
    client.request("launch", json!({ "program": "/tmp/prog" })).await;
    let (_, events) = client.request("configurationDone", Value::Null).await;
    client.stopped(events).await;

    let (trace, _) = client.request("stackTrace", json!({ "threadId": 1 })).await;
    let frame_id = trace["body"]["stackFrames"][0]["id"].clone();
    let (evaluated, _) = client
        .request("evaluate", json!({ "expression": "buf", "frameId": frame_id, "context": "watch" }))
        .await;
    assert_eq!(evaluated["success"], true, "{}", evaluated);
    assert_eq!(evaluated["body"]["result"], "(char (*)[16]) 0x7ffe0010");
    assert_eq!(evaluated["body"]["type"], "char [16]");

    let (memory, _) = client
        .request("readMemory", json!({ "memoryReference": "0x1000", "count": 4 }))
        .await;
    assert_eq!(memory["success"], true, "{}", memory);
    assert_eq!(memory["body"]["address"], "0x1000");
    assert_eq!(memory["body"]["data"], "AQIDBA==");
    assert_eq!(memory["body"]["unreadableBytes"], 0);
}

#[tokio::test]
async fn test_oversized_disassembly_is_refused() {
    let (mut client, log) = Client::new().await;
    client.request("launch", json!({ "program": "/tmp/prog" })).await;

    let (response, _) = client
        .request(
            "disassemble",
            json!({ "memoryReference": "0x2000", "instructionCount": i64::MAX }),
        )
        .await;
    assert_eq!(response["success"], false);
    assert!(response["message"].as_str().unwrap().contains("Cannot disassemble"));
    assert_eq!(count(&log, "-data-disassemble"), 0);

    // The session keeps serving requests
    let (response, _) = client.request("threads", Value::Null).await;
    assert_eq!(response["success"], true, "{}", response);
}
