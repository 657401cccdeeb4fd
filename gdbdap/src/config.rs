/// Launch and attach arguments
///
/// Both requests share one argument shape; `attach` additionally reads
/// `processId`, and either may carry a remote `target`.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use gdbadapter::process::GdbConfig;

use crate::{DapError, Result};

/// Clients send some numeric fields as strings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(u64),
    Text(String),
}

impl NumberOrString {
    pub fn as_text(&self) -> String {
        match self {
            NumberOrString::Number(n) => n.to_string(),
            NumberOrString::Text(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetArguments {
    /// `remote` or `extended-remote`
    #[serde(rename = "type")]
    pub target_type: Option<String>,
    pub host: Option<String>,
    pub port: Option<NumberOrString>,
    /// Overrides `host:port` as the `-target-select` parameters
    pub parameters: Vec<String>,
    /// Server program to start before connecting, e.g. `gdbserver`
    pub server: Option<String>,
    pub server_parameters: Vec<String>,
    pub server_port_reg_exp: Option<String>,
    /// Milliseconds to wait after the server reported readiness
    pub server_startup_delay: u64,
    pub cwd: Option<String>,
    pub connect_commands: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionArguments {
    pub gdb: String,
    pub gdb_arguments: Vec<String>,
    pub program: Option<String>,
    pub arguments: Option<String>,
    pub cwd: Option<String>,
    /// A `null` value removes the variable
    pub environment: HashMap<String, Option<String>>,
    pub gdb_async: bool,
    pub gdb_non_stop: bool,
    pub hardware_breakpoint: bool,
    pub init_commands: Vec<String>,
    pub process_id: Option<NumberOrString>,
    pub target: Option<TargetArguments>,
}

impl Default for SessionArguments {
    fn default() -> Self {
        Self {
            gdb: "gdb".to_string(),
            gdb_arguments: Vec::new(),
            program: None,
            arguments: None,
            cwd: None,
            environment: HashMap::new(),
            gdb_async: true,
            gdb_non_stop: false,
            hardware_breakpoint: false,
            init_commands: Vec::new(),
            process_id: None,
            target: None,
        }
    }
}

impl SessionArguments {
    pub fn from_value(arguments: serde_json::Value) -> Result<Self> {
        if arguments.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(arguments)?)
    }

    pub fn gdb_config(&self) -> GdbConfig {
        GdbConfig {
            gdb_path: self.gdb.clone(),
            gdb_arguments: self.gdb_arguments.clone(),
            cwd: self.cwd.as_ref().map(PathBuf::from),
            environment: self.environment.clone(),
        }
    }

    pub fn process_id(&self) -> Result<u32> {
        let raw = self
            .process_id
            .as_ref()
            .ok_or_else(|| DapError::Request("Missing processId to attach to".to_string()))?;
        raw.as_text()
            .trim()
            .parse()
            .map_err(|_| DapError::Request(format!("Invalid processId: {}", raw.as_text())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let args = SessionArguments::from_value(json!({ "program": "/tmp/a.out" })).unwrap();
        assert_eq!(args.gdb, "gdb");
        assert!(args.gdb_async);
        assert!(!args.gdb_non_stop);
        assert_eq!(args.program.as_deref(), Some("/tmp/a.out"));
        assert!(args.target.is_none());
    }

    #[test]
    fn test_environment_null_unsets() {
        let args = SessionArguments::from_value(json!({
            "environment": { "FOO": "bar", "HOME": null }
        }))
        .unwrap();
        let config = args.gdb_config();
        assert_eq!(config.environment.get("FOO"), Some(&Some("bar".to_string())));
        assert_eq!(config.environment.get("HOME"), Some(&None));
    }

    #[test]
    fn test_process_id_as_string_or_number() {
        let args = SessionArguments::from_value(json!({ "processId": "4242" })).unwrap();
        assert_eq!(args.process_id().unwrap(), 4242);
        let args = SessionArguments::from_value(json!({ "processId": 17 })).unwrap();
        assert_eq!(args.process_id().unwrap(), 17);
        let args = SessionArguments::from_value(json!({ "processId": "abc" })).unwrap();
        assert!(args.process_id().is_err());
    }

    #[test]
    fn test_remote_target() {
        let args = SessionArguments::from_value(json!({
            "target": {
                "type": "extended-remote",
                "host": "localhost",
                "port": 2331,
                "server": "gdbserver",
                "serverParameters": [":0", "/tmp/a.out"],
                "connectCommands": ["monitor reset"]
            }
        }))
        .unwrap();
        let target = args.target.unwrap();
        assert_eq!(target.target_type.as_deref(), Some("extended-remote"));
        assert_eq!(target.port, Some(NumberOrString::Number(2331)));
        assert_eq!(target.server_parameters, vec![":0", "/tmp/a.out"]);
        assert_eq!(target.server_startup_delay, 0);
    }
}
