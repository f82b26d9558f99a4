/// Volatility 3 integration
///
/// Runs `vol` plugins against a memory image with the JSON renderer and
/// normalizes the rows into typed records: process list, injected-code
/// candidates (malfind), sockets, loaded modules and handles.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::VolatilityError;

/// Plugins run when the caller names none
pub const DEFAULT_PLUGINS: &[&str] = &["pslist", "malfind", "netscan"];

/// Byte sequences typical of position-independent shellcode prologues
const SHELLCODE_HEX: &[&str] = &["fc e8", "90 90 90", "eb fe", "31 c0", "31 db", "31 c9"];

/// Imports a loader stub resolves before doing anything else
const SHELLCODE_APIS: &[&str] = &[
    "getprocaddress", "loadlibrary", "virtualalloc", "createthread", "ntcreatethread", "winexec",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VolatilityPlugin {
    PsList,
    Malfind,
    NetScan,
    DllList,
    Handles,
}

impl VolatilityPlugin {
    fn short_name(&self) -> &'static str {
        match self {
            VolatilityPlugin::PsList => "pslist",
            VolatilityPlugin::Malfind => "malfind",
            VolatilityPlugin::NetScan => "netscan",
            VolatilityPlugin::DllList => "dlllist",
            VolatilityPlugin::Handles => "handles",
        }
    }

    /// Resolve `pslist`, `windows.pslist` or `linux.pslist` into the plugin
    /// and the fully qualified name passed to `vol`. Bare names default to
    /// the Windows namespace.
    pub fn resolve(name: &str) -> Result<(Self, String), VolatilityError> {
        let unknown = || VolatilityError::UnknownPlugin(name.to_string());
        let (namespace, short) = match name.split_once('.') {
            Some((namespace, short)) => (namespace, short),
            None => ("windows", name),
        };

        let plugin = match short {
            "pslist" => VolatilityPlugin::PsList,
            "malfind" => VolatilityPlugin::Malfind,
            "netscan" => VolatilityPlugin::NetScan,
            "dlllist" => VolatilityPlugin::DllList,
            "handles" => VolatilityPlugin::Handles,
            _ => return Err(unknown()),
        };

        match namespace {
            "windows" => {}
            "linux" if matches!(plugin, VolatilityPlugin::PsList | VolatilityPlugin::Malfind) => {}
            _ => return Err(unknown()),
        }
        Ok((plugin, format!("{}.{}", namespace, plugin.short_name())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolProcess {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub create_time: Option<String>,
    pub exit_time: Option<String>,
    pub session_id: Option<u32>,
    pub wow64: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolNetConnection {
    pub protocol: String,
    pub local_address: String,
    pub local_port: u16,
    pub remote_address: String,
    pub remote_port: u16,
    pub state: String,
    pub pid: u32,
    pub owner: String,
}

/// Executable private memory that may hold injected code
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MalfindHit {
    pub pid: u32,
    pub process_name: String,
    pub start: u64,
    pub size: u64,
    pub protection: String,
    pub vad_tag: String,
    pub disassembly: Vec<String>,
    pub hex_dump: Vec<String>,
    pub likely_shellcode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadedModule {
    pub pid: u32,
    pub name: String,
    pub path: String,
    pub base_address: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolHandle {
    pub pid: u32,
    pub handle: u64,
    pub object_type: String,
    pub granted_access: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolatilityAnalysis {
    pub volatility_version: String,
    pub plugins_run: Vec<String>,
    pub processes: Vec<VolProcess>,
    pub network_connections: Vec<VolNetConnection>,
    pub malfind_hits: Vec<MalfindHit>,
    pub modules: Vec<LoadedModule>,
    pub handles: Vec<VolHandle>,
    pub analysis_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolatilityStatus {
    pub available: bool,
    pub version: String,
    pub plugins: Vec<String>,
}

/// Plugin names accepted by [`VolatilityRunner::analyze`]
pub fn supported_plugins() -> Vec<String> {
    [
        "windows.pslist",
        "windows.malfind",
        "windows.netscan",
        "windows.dlllist",
        "windows.handles",
        "linux.pslist",
        "linux.malfind",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Drives the `vol` CLI
#[derive(Debug, Clone)]
pub struct VolatilityRunner {
    binary: String,
    /// Arguments placed before every invocation, e.g. `-m volatility3` for `python3`
    base_args: Vec<String>,
    timeout: Duration,
}

impl VolatilityRunner {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            base_args: Vec::new(),
            timeout,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.base_args = args;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.base_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Check the installation. The help banner carries the framework version.
    pub async fn status(&self) -> VolatilityStatus {
        let output = match self.command().arg("-h").output().await {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                debug!("vol -h exited with {:?}", output.status.code());
                return self.unavailable();
            }
            Err(e) => {
                debug!("Cannot run {}: {}", self.binary, e);
                return self.unavailable();
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("Volatility"))
            .unwrap_or("unknown")
            .to_string();

        VolatilityStatus {
            available: true,
            version,
            plugins: supported_plugins(),
        }
    }

    fn unavailable(&self) -> VolatilityStatus {
        VolatilityStatus {
            available: false,
            version: String::new(),
            plugins: Vec::new(),
        }
    }

    async fn run_plugin(&self, dump_path: &Path, plugin: &str) -> Result<Value, VolatilityError> {
        let mut cmd = self.command();
        cmd.args(["-q", "-r", "json", "-f"]).arg(dump_path).arg(plugin);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => {
                return Err(VolatilityError::Timeout {
                    plugin: plugin.to_string(),
                    timeout_secs: self.timeout.as_secs(),
                })
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VolatilityError::NotInstalled {
                    binary: self.binary.clone(),
                })
            }
            Ok(result) => result?,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VolatilityError::PluginFailed {
                plugin: plugin.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| VolatilityError::InvalidOutput {
            plugin: plugin.to_string(),
            reason: e.to_string(),
        })
    }

    /// Run `plugins` (or [`DEFAULT_PLUGINS`] when empty) against one image.
    /// Names are validated before anything runs; the first failing plugin
    /// aborts the analysis.
    pub async fn analyze(
        &self,
        dump_path: &Path,
        plugins: &[String],
    ) -> Result<VolatilityAnalysis, VolatilityError> {
        let requested: Vec<&str> = if plugins.is_empty() {
            DEFAULT_PLUGINS.to_vec()
        } else {
            plugins.iter().map(String::as_str).collect()
        };
        let resolved = requested
            .iter()
            .map(|name| VolatilityPlugin::resolve(name))
            .collect::<Result<Vec<_>, _>>()?;

        let status = self.status().await;
        if !status.available {
            return Err(VolatilityError::NotInstalled {
                binary: self.binary.clone(),
            });
        }

        let started = Instant::now();
        let mut analysis = VolatilityAnalysis {
            volatility_version: status.version,
            ..Default::default()
        };

        for (plugin, qualified) in resolved {
            debug!("Running {} on {}", qualified, dump_path.display());
            let output = self.run_plugin(dump_path, &qualified).await?;
            match plugin {
                VolatilityPlugin::PsList => analysis.processes = parse_pslist(&output),
                VolatilityPlugin::Malfind => analysis.malfind_hits = parse_malfind(&output),
                VolatilityPlugin::NetScan => analysis.network_connections = parse_netscan(&output),
                VolatilityPlugin::DllList => analysis.modules = parse_dlllist(&output),
                VolatilityPlugin::Handles => analysis.handles = parse_handles(&output),
            }
            analysis.plugins_run.push(qualified);
        }

        analysis.analysis_time_ms = started.elapsed().as_millis() as u64;
        let shellcode = analysis.malfind_hits.iter().filter(|h| h.likely_shellcode).count();
        if shellcode > 0 {
            warn!("{} malfind hits look like shellcode in {}", shellcode, dump_path.display());
        }
        info!(
            "Volatility analysis of {} finished in {}ms ({} processes, {} malfind hits)",
            dump_path.display(),
            analysis.analysis_time_ms,
            analysis.processes.len(),
            analysis.malfind_hits.len()
        );
        Ok(analysis)
    }
}

/// Flatten the JSON renderer's tree; nested rows live under `__children`
fn rows(value: &Value) -> Vec<&Value> {
    let mut out = Vec::new();
    let mut stack: Vec<&Value> = match value {
        Value::Array(items) => items.iter().rev().collect(),
        Value::Object(_) => vec![value],
        _ => Vec::new(),
    };
    while let Some(row) = stack.pop() {
        if let Some(children) = row.get("__children").and_then(Value::as_array) {
            stack.extend(children.iter().rev());
        }
        if row.is_object() {
            out.push(row);
        }
    }
    out
}

fn u64_field(row: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| row.get(*k).and_then(Value::as_u64))
}

fn str_field(row: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| row.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

/// Hexdump and Disasm come as one multi-line string or as a list of lines
fn text_lines(row: &Value, key: &str) -> Vec<String> {
    match row.get(key) {
        Some(Value::String(text)) => text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_pslist(output: &Value) -> Vec<VolProcess> {
    rows(output)
        .into_iter()
        .filter_map(|row| {
            Some(VolProcess {
                pid: u64_field(row, &["PID"])? as u32,
                ppid: u64_field(row, &["PPID"]).unwrap_or(0) as u32,
                name: str_field(row, &["ImageFileName", "COMM"])?,
                create_time: str_field(row, &["CreateTime"]),
                exit_time: str_field(row, &["ExitTime"]),
                session_id: u64_field(row, &["SessionId"]).map(|v| v as u32),
                wow64: row.get("Wow64").and_then(Value::as_bool).unwrap_or(false),
            })
        })
        .collect()
}

fn looks_like_shellcode(disassembly: &[String], hex_dump: &[String]) -> bool {
    let hex = hex_dump.iter().any(|line| {
        let line = line.to_lowercase();
        SHELLCODE_HEX.iter().any(|pattern| line.contains(pattern))
    });
    let apis = disassembly.iter().any(|line| {
        let line = line.to_lowercase();
        SHELLCODE_APIS.iter().any(|api| line.contains(api))
    });
    // An MZ header in private executable memory is a reflectively loaded image
    let pe = hex_dump
        .first()
        .map_or(false, |line| line.to_lowercase().trim_start().starts_with("4d 5a"));
    hex || apis || pe
}

fn parse_malfind(output: &Value) -> Vec<MalfindHit> {
    rows(output)
        .into_iter()
        .filter_map(|row| {
            let start = u64_field(row, &["Start VPN", "Start"]).unwrap_or(0);
            let size = match u64_field(row, &["End VPN", "End"]) {
                Some(end) if end >= start => end - start + 1,
                _ => 0,
            };
            let disassembly = text_lines(row, "Disasm");
            let hex_dump = text_lines(row, "Hexdump");
            Some(MalfindHit {
                pid: u64_field(row, &["PID"])? as u32,
                process_name: str_field(row, &["Process"])?,
                start,
                size,
                protection: str_field(row, &["Protection"]).unwrap_or_default(),
                vad_tag: str_field(row, &["Tag"]).unwrap_or_default(),
                likely_shellcode: looks_like_shellcode(&disassembly, &hex_dump),
                disassembly,
                hex_dump,
            })
        })
        .collect()
}

fn parse_netscan(output: &Value) -> Vec<VolNetConnection> {
    rows(output)
        .into_iter()
        .filter_map(|row| {
            Some(VolNetConnection {
                protocol: str_field(row, &["Proto"])?,
                local_address: str_field(row, &["LocalAddr"]).unwrap_or_default(),
                local_port: u64_field(row, &["LocalPort"]).unwrap_or(0) as u16,
                remote_address: str_field(row, &["ForeignAddr"]).unwrap_or_default(),
                remote_port: u64_field(row, &["ForeignPort"]).unwrap_or(0) as u16,
                state: str_field(row, &["State"]).unwrap_or_default(),
                pid: u64_field(row, &["PID"]).unwrap_or(0) as u32,
                owner: str_field(row, &["Owner"]).unwrap_or_default(),
            })
        })
        .collect()
}

fn parse_dlllist(output: &Value) -> Vec<LoadedModule> {
    rows(output)
        .into_iter()
        .filter_map(|row| {
            Some(LoadedModule {
                pid: u64_field(row, &["PID"]).unwrap_or(0) as u32,
                name: str_field(row, &["Name"])?,
                path: str_field(row, &["Path"]).unwrap_or_default(),
                base_address: u64_field(row, &["Base"]).unwrap_or(0),
                size: u64_field(row, &["Size"]).unwrap_or(0),
            })
        })
        .collect()
}

fn parse_handles(output: &Value) -> Vec<VolHandle> {
    rows(output)
        .into_iter()
        .filter_map(|row| {
            let granted_access = match row.get("GrantedAccess") {
                Some(Value::Number(n)) => n.as_u64().map(|v| format!("{:#x}", v)).unwrap_or_default(),
                Some(Value::String(s)) => s.clone(),
                _ => String::new(),
            };
            Some(VolHandle {
                pid: u64_field(row, &["PID"])? as u32,
                handle: u64_field(row, &["HandleValue"]).unwrap_or(0),
                object_type: str_field(row, &["Type"]).unwrap_or_default(),
                granted_access,
                name: str_field(row, &["Name"]).filter(|n| !n.is_empty()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn pslist_output() -> Value {
        json!([
            {
                "PID": 4, "PPID": 0, "ImageFileName": "System", "CreateTime": "2024-06-12T18:40:01",
                "ExitTime": null, "SessionId": null, "Wow64": false,
                "__children": [
                    {
                        "PID": 2412, "PPID": 4, "ImageFileName": "invoice.exe",
                        "CreateTime": "2024-06-12T18:44:55", "ExitTime": null,
                        "SessionId": 1, "Wow64": true, "__children": []
                    }
                ]
            }
        ])
    }

    fn malfind_output() -> Value {
        json!([
            {
                "PID": 2412, "Process": "invoice.exe", "Start VPN": 0x1f0000u64, "End VPN": 0x1f0fffu64,
                "Tag": "VadS", "Protection": "PAGE_EXECUTE_READWRITE",
                "Hexdump": "fc e8 82 00 00 00 60 89 e5 31 c0 64 8b 50 30 8b\n52 0c 8b 52 14 8b 72 28",
                "Disasm": "0x1f0000:\tcld\n0x1f0001:\tcall\t0x1f0088",
                "__children": []
            },
            {
                "PID": 880, "Process": "svchost.exe", "Start VPN": 0x2a0000u64, "End VPN": 0x2a0fffu64,
                "Tag": "VadS", "Protection": "PAGE_EXECUTE_READWRITE",
                "Hexdump": ["48 89 5c 24 08 57 48 83 ec 20"],
                "Disasm": ["0x2a0000:\tmov\tqword ptr [rsp + 8], rbx"],
                "__children": []
            }
        ])
    }

    #[test]
    fn test_resolve_plugin_names() {
        assert_eq!(
            VolatilityPlugin::resolve("pslist").unwrap(),
            (VolatilityPlugin::PsList, "windows.pslist".to_string())
        );
        assert_eq!(
            VolatilityPlugin::resolve("linux.malfind").unwrap(),
            (VolatilityPlugin::Malfind, "linux.malfind".to_string())
        );
        assert!(VolatilityPlugin::resolve("linux.netscan").is_err());
        assert!(VolatilityPlugin::resolve("windows.pslist; rm -rf /").is_err());
        assert!(VolatilityPlugin::resolve("timeliner").is_err());
    }

    #[test]
    fn test_parse_pslist_flattens_children() {
        let processes = parse_pslist(&pslist_output());
        assert_eq!(processes.len(), 2);
        assert_eq!(processes[0].name, "System");
        assert_eq!(processes[0].session_id, None);
        assert_eq!(processes[1].pid, 2412);
        assert_eq!(processes[1].ppid, 4);
        assert!(processes[1].wow64);
    }

    #[test]
    fn test_parse_malfind_flags_shellcode() {
        let hits = parse_malfind(&malfind_output());
        assert_eq!(hits.len(), 2);

        assert_eq!(hits[0].start, 0x1f0000);
        assert_eq!(hits[0].size, 0x1000);
        assert_eq!(hits[0].hex_dump.len(), 2);
        assert_eq!(hits[0].disassembly[1], "0x1f0001:\tcall\t0x1f0088");
        assert!(hits[0].likely_shellcode);

        assert_eq!(hits[1].process_name, "svchost.exe");
        assert!(!hits[1].likely_shellcode);
    }

    #[test]
    fn test_reflective_pe_counts_as_shellcode() {
        let hex = vec!["4d 5a 90 00 03 00 00 00 04 00 00 00 ff ff 00 00".to_string()];
        assert!(looks_like_shellcode(&[], &hex));
        let api = vec!["call qword ptr [rip + 0x20] ; VirtualAlloc".to_string()];
        assert!(looks_like_shellcode(&api, &[]));
    }

    #[test]
    fn test_parse_netscan_dlllist_handles() {
        let connections = parse_netscan(&json!([
            {
                "Offset": 0xe0001u64, "Proto": "TCPv4", "LocalAddr": "10.0.2.15", "LocalPort": 49712,
                "ForeignAddr": "93.184.216.34", "ForeignPort": 443, "State": "ESTABLISHED",
                "PID": 2412, "Owner": "invoice.exe", "Created": null, "__children": []
            }
        ]));
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].remote_port, 443);
        assert_eq!(connections[0].owner, "invoice.exe");

        let modules = parse_dlllist(&json!([
            {
                "PID": 2412, "Process": "invoice.exe", "Base": 0x7ffb12340000u64, "Size": 0x1f000,
                "Name": "wininet.dll", "Path": "C:\\Windows\\System32\\wininet.dll", "__children": []
            }
        ]));
        assert_eq!(modules[0].name, "wininet.dll");
        assert_eq!(modules[0].base_address, 0x7ffb12340000);

        let handles = parse_handles(&json!([
            {
                "PID": 2412, "Process": "invoice.exe", "HandleValue": 0x1a4, "Type": "Mutant",
                "GrantedAccess": 0x1f0001, "Name": "Global\\xyz-mutex", "__children": []
            },
            { "PID": 2412, "HandleValue": 0x1a8, "Type": "Event", "GrantedAccess": 0x1f0003, "Name": "" }
        ]));
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].granted_access, "0x1f0001");
        assert_eq!(handles[0].name.as_deref(), Some("Global\\xyz-mutex"));
        assert_eq!(handles[1].name, None);
    }

    /// A stand-in `vol` that answers `-h` and serves canned renderer output
    fn fake_vol(pslist: &Value) -> NamedTempFile {
        let script = format!(
            "case \"$1\" in\n\
             -h) echo 'Volatility 3 Framework 2.7.0'; echo 'usage: vol [-h] ...'; exit 0 ;;\n\
             esac\n\
             case \"$6\" in\n\
             windows.pslist) cat <<'JSON'\n{}\nJSON\n;;\n\
             *) echo \"plugin $6 unsatisfied: no suitable layer\" >&2; exit 1 ;;\n\
             esac\n",
            pslist
        );
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(script.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn runner(script: &NamedTempFile) -> VolatilityRunner {
        VolatilityRunner::new("sh", Duration::from_secs(10))
            .with_args(vec![script.path().display().to_string()])
    }

    #[tokio::test]
    async fn test_status_reads_banner() {
        let script = fake_vol(&pslist_output());
        let status = runner(&script).status().await;
        assert!(status.available);
        assert_eq!(status.version, "Volatility 3 Framework 2.7.0");
        assert!(status.plugins.contains(&"windows.malfind".to_string()));
    }

    #[tokio::test]
    async fn test_analyze_runs_requested_plugins() {
        let script = fake_vol(&pslist_output());
        let dump = NamedTempFile::new().unwrap();

        let analysis = runner(&script)
            .analyze(dump.path(), &["pslist".to_string()])
            .await
            .unwrap();
        assert_eq!(analysis.plugins_run, vec!["windows.pslist".to_string()]);
        assert_eq!(analysis.processes.len(), 2);
        assert!(analysis.malfind_hits.is_empty());

        let err = runner(&script)
            .analyze(dump.path(), &["malfind".to_string()])
            .await
            .unwrap_err();
        match err {
            VolatilityError::PluginFailed { plugin, stderr } => {
                assert_eq!(plugin, "windows.malfind");
                assert!(stderr.contains("no suitable layer"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_installation() {
        let runner = VolatilityRunner::new("/nonexistent/bin/vol", Duration::from_secs(5));
        let status = runner.status().await;
        assert!(!status.available);
        assert!(status.plugins.is_empty());

        let dump = NamedTempFile::new().unwrap();
        let err = runner.analyze(dump.path(), &[]).await.unwrap_err();
        assert!(matches!(err, VolatilityError::NotInstalled { .. }));

        let err = runner
            .analyze(dump.path(), &["windows.bogus".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, VolatilityError::UnknownPlugin(ref name) if name == "windows.bogus"));
    }
}
