/// Real-time monitoring of sandbox execution
///
/// Consumes parsed syscall and packet records as they arrive and builds:
/// - Severity-annotated behavior events for activity of interest
/// - File operations, process tree and network connections
/// - A per-syscall invocation count covering every traced call
///
/// Events keep the order in which their stream delivered them. Nothing is
/// collapsed except in the syscall-count aggregate.

use std::collections::{BTreeMap, HashMap, HashSet};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::anti_evasion::detect_evasion_attempt;
use super::trace::{PacketRecord, SyscallRecord, TraceRecord};
use super::{
    BehaviorEvent, ConnectionSource, ConnectionType, EventKind, FileOperation,
    FileOperationType, NetworkConnection, ProcessInfo,
};

/// Credential stores whose access is reported as credential dumping
const SENSITIVE_PATHS: &[&str] = &[
    "/etc/shadow",
    "/etc/passwd",
    "/etc/gshadow",
    "/etc/sudoers",
    "/.ssh/",
    "/.aws/credentials",
    "/.gnupg/",
    "/Login Data",
];

/// Locations that execute content on login, boot or schedule
const AUTOSTART_PATHS: &[&str] = &[
    ".bashrc",
    ".profile",
    ".bash_profile",
    "crontab",
    "/etc/cron",
    "/var/spool/cron",
    "/etc/init",
    "/etc/systemd",
    ".config/autostart",
    "/etc/rc.local",
];

const WRITE_FLAGS: &[&str] = &["O_WRONLY", "O_RDWR", "O_CREAT", "O_APPEND", "O_TRUNC"];

/// Everything the monitor collected for one run
#[derive(Debug, Clone, Default)]
pub struct MonitorOutput {
    pub events: Vec<BehaviorEvent>,
    pub file_operations: Vec<FileOperation>,
    pub network_connections: Vec<NetworkConnection>,
    pub processes: Vec<ProcessInfo>,
    pub syscall_summary: BTreeMap<String, u64>,
    /// Records observed across all streams
    pub records_seen: u64,
}

#[derive(Default)]
pub struct BehaviorMonitor {
    output: MonitorOutput,
    seen_connections: HashSet<(String, String, u16)>,
    process_index: HashMap<u32, usize>,
}

impl BehaviorMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume records until the streams close or `stop` fires. Records
    /// already queued when `stop` fires are still processed.
    pub async fn run(
        mut self,
        mut records: mpsc::UnboundedReceiver<TraceRecord>,
        mut stop: watch::Receiver<bool>,
    ) -> MonitorOutput {
        loop {
            tokio::select! {
                biased;
                record = records.recv() => match record {
                    Some(record) => self.observe(&record),
                    None => break,
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        while let Ok(record) = records.try_recv() {
                            self.observe(&record);
                        }
                        break;
                    }
                }
            }
        }

        let output = self.finish();
        info!(
            "Monitoring completed: {} events, {} file ops, {} connections, {} processes",
            output.events.len(),
            output.file_operations.len(),
            output.network_connections.len(),
            output.processes.len()
        );
        output
    }

    pub fn finish(self) -> MonitorOutput {
        self.output
    }

    pub fn observe(&mut self, record: &TraceRecord) {
        self.output.records_seen += 1;

        if let Some(reason) = detect_evasion_attempt(record) {
            if let TraceRecord::Syscall(rec) = record {
                self.push_event(rec, EventKind::EvasionAttempt, reason);
            }
        }

        match record {
            TraceRecord::Syscall(rec) => self.observe_syscall(rec),
            TraceRecord::Packet(pkt) => self.observe_packet(pkt),
            TraceRecord::Exit { pid, code, signal, .. } => {
                debug!(pid, ?code, ?signal, "Traced process exited");
            }
        }
    }

    fn push_event(&mut self, rec: &SyscallRecord, kind: EventKind, context: impl Into<String>) {
        self.output.events.push(BehaviorEvent::new(
            rec.timestamp,
            kind,
            rec.name.clone(),
            rec.pid,
            context,
        ));
    }

    fn push_file_op(
        &mut self,
        rec: &SyscallRecord,
        operation: FileOperationType,
        path: String,
        target_path: Option<String>,
    ) {
        self.output.file_operations.push(FileOperation {
            operation,
            path,
            target_path,
            pid: rec.pid,
            timestamp: rec.timestamp,
            success: rec.result.is_none() || rec.succeeded(),
        });
    }

    fn observe_syscall(&mut self, rec: &SyscallRecord) {
        *self
            .output
            .syscall_summary
            .entry(rec.name.clone())
            .or_insert(0) += 1;

        match rec.name.as_str() {
            "fork" | "vfork" | "clone" | "clone3" => {
                let child = rec.return_value().filter(|v| *v > 0);
                let context = match child {
                    Some(child) => format!("child pid {}", child),
                    None => rec.args.clone(),
                };
                self.push_event(rec, EventKind::ProcessCreation, context);
                if let Some(child) = child {
                    self.record_child(rec, child as u32);
                }
            }
            "execve" | "execveat" => {
                let args = rec.quoted_args();
                let image = args.first().cloned().unwrap_or_default();
                let command_line = if args.len() > 1 {
                    args[1..].join(" ")
                } else {
                    image.clone()
                };
                self.push_event(rec, EventKind::ProcessExecution, command_line.clone());
                if rec.result.is_none() || rec.succeeded() {
                    self.record_exec(rec, &image, command_line);
                }
            }
            "socket" => {
                self.push_event(rec, EventKind::SocketCreation, rec.args.clone());
            }
            "connect" => {
                self.push_event(rec, EventKind::NetworkConnect, rec.args.clone());
                if let Some((addr, port)) = Self::parse_sockaddr(&rec.args) {
                    let protocol = if port == 53 { "udp" } else { "tcp" };
                    self.record_connection(NetworkConnection {
                        protocol: protocol.to_string(),
                        destination: addr,
                        port,
                        connection_type: ConnectionType::from_port(protocol, port),
                        source: ConnectionSource::Syscall,
                        pid: Some(rec.pid),
                        timestamp: rec.timestamp,
                    });
                }
            }
            "open" | "openat" | "openat2" | "creat" => {
                let Some(path) = Self::extract_file_path(rec) else {
                    return;
                };
                let writes = rec.name == "creat" || WRITE_FLAGS.iter().any(|f| rec.args.contains(f));
                let operation = if rec.name == "creat" || rec.args.contains("O_CREAT") {
                    FileOperationType::Create
                } else {
                    FileOperationType::Open
                };

                if Self::is_sensitive(&path) {
                    self.push_event(rec, EventKind::SensitiveFileAccess, path.clone());
                }
                if writes && Self::is_autostart(&path) {
                    self.push_event(rec, EventKind::AutostartWrite, path.clone());
                }
                self.push_file_op(rec, operation, path, None);
            }
            "unlink" | "unlinkat" => {
                if let Some(path) = Self::extract_file_path(rec) {
                    self.push_event(rec, EventKind::FileDeletion, path.clone());
                    self.push_file_op(rec, FileOperationType::Delete, path, None);
                }
            }
            "rename" | "renameat" | "renameat2" => {
                if let Some((src, dst)) = Self::extract_rename_paths(rec) {
                    if Self::is_autostart(&dst) {
                        self.push_event(rec, EventKind::AutostartWrite, dst.clone());
                    }
                    self.push_file_op(rec, FileOperationType::Rename, src, Some(dst));
                }
            }
            "chmod" | "fchmodat" => {
                let path = Self::extract_file_path(rec).unwrap_or_default();
                self.push_event(rec, EventKind::PermissionChange, rec.args.clone());
                if !path.is_empty() {
                    self.push_file_op(rec, FileOperationType::Chmod, path, None);
                }
            }
            "fchmod" => {
                self.push_event(rec, EventKind::PermissionChange, rec.args.clone());
            }
            "setuid" | "setgid" | "setreuid" | "setregid" | "setresuid" | "setresgid" => {
                self.push_event(rec, EventKind::PrivilegeChange, rec.args.clone());
            }
            "mprotect" | "pkey_mprotect" if rec.args.contains("PROT_EXEC") => {
                self.push_event(rec, EventKind::MemoryProtectionChange, rec.args.clone());
            }
            // Loader maps of shared objects are file-backed; only anonymous
            // executable mappings are interesting
            "mmap" if rec.args.contains("PROT_EXEC") && rec.args.contains("MAP_ANONYMOUS") => {
                self.push_event(rec, EventKind::MemoryProtectionChange, rec.args.clone());
            }
            "ptrace" => {
                self.push_event(rec, EventKind::ProcessTrace, rec.args.clone());
            }
            _ => {}
        }
    }

    fn observe_packet(&mut self, pkt: &PacketRecord) {
        self.record_connection(NetworkConnection {
            protocol: pkt.protocol.clone(),
            destination: pkt.destination.clone(),
            port: pkt.port,
            connection_type: ConnectionType::from_port(&pkt.protocol, pkt.port),
            source: ConnectionSource::PacketCapture,
            pid: None,
            timestamp: pkt.timestamp,
        });
    }

    fn record_connection(&mut self, conn: NetworkConnection) {
        let key = (conn.protocol.clone(), conn.destination.clone(), conn.port);
        if self.seen_connections.insert(key) {
            self.output.network_connections.push(conn);
        }
    }

    fn record_child(&mut self, rec: &SyscallRecord, child: u32) {
        if self.process_index.contains_key(&child) {
            return;
        }
        // A forked child runs the parent's image until it execs
        let (name, command_line) = self
            .process_index
            .get(&rec.pid)
            .map(|idx| {
                let parent = &self.output.processes[*idx];
                (parent.name.clone(), parent.command_line.clone())
            })
            .unwrap_or_default();

        self.process_index.insert(child, self.output.processes.len());
        self.output.processes.push(ProcessInfo {
            pid: child,
            parent_pid: Some(rec.pid),
            name,
            command_line,
            started_at: rec.timestamp,
        });
    }

    fn record_exec(&mut self, rec: &SyscallRecord, image: &str, command_line: String) {
        let name = image.rsplit(['/', '\\']).next().unwrap_or(image).to_string();
        match self.process_index.get(&rec.pid).copied() {
            Some(idx) => {
                let process = &mut self.output.processes[idx];
                process.name = name;
                process.command_line = command_line;
            }
            None => {
                self.process_index.insert(rec.pid, self.output.processes.len());
                self.output.processes.push(ProcessInfo {
                    pid: rec.pid,
                    parent_pid: None,
                    name,
                    command_line,
                    started_at: rec.timestamp,
                });
            }
        }
    }

    fn is_sensitive(path: &str) -> bool {
        SENSITIVE_PATHS.iter().any(|p| path.contains(p))
    }

    fn is_autostart(path: &str) -> bool {
        AUTOSTART_PATHS.iter().any(|p| path.contains(p))
    }

    /// Helper: Extract file path from strace arguments
    fn extract_file_path(rec: &SyscallRecord) -> Option<String> {
        rec.first_path()
    }

    /// Helper: Extract source and destination paths from rename operation
    fn extract_rename_paths(rec: &SyscallRecord) -> Option<(String, String)> {
        let mut paths = rec.quoted_args().into_iter();
        Some((paths.next()?, paths.next()?))
    }

    /// Helper: Parse the IPv4/IPv6 address and port of a connect() sockaddr
    fn parse_sockaddr(args: &str) -> Option<(String, u16)> {
        let port_start = args.find("_port=htons(")? + "_port=htons(".len();
        let port: u16 = args[port_start..]
            .split(')')
            .next()?
            .parse()
            .ok()?;

        let addr = if let Some(idx) = args.find("inet_addr(\"") {
            let rest = &args[idx + "inet_addr(\"".len()..];
            rest.split('"').next()?.to_string()
        } else if let Some(idx) = args.find("inet_pton(AF_INET6, \"") {
            let rest = &args[idx + "inet_pton(AF_INET6, \"".len()..];
            rest.split('"').next()?.to_string()
        } else {
            return None;
        };

        Some((addr, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::trace::parse_strace_line;
    use crate::sandbox::Severity;

    fn feed(monitor: &mut BehaviorMonitor, lines: &[&str]) {
        for line in lines {
            if let Some(record) = parse_strace_line(line) {
                monitor.observe(&record);
            }
        }
    }

    #[test]
    fn test_parse_sockaddr() {
        let args = r#"3, {sa_family=AF_INET, sin_port=htons(4444), sin_addr=inet_addr("10.0.0.5")}, 16"#;
        assert_eq!(
            BehaviorMonitor::parse_sockaddr(args),
            Some(("10.0.0.5".to_string(), 4444))
        );
        let args6 = r#"3, {sa_family=AF_INET6, sin6_port=htons(443), sin6_flowinfo=htonl(0), inet_pton(AF_INET6, "::1", &sin6_addr), sin6_scope_id=0}, 28"#;
        assert_eq!(
            BehaviorMonitor::parse_sockaddr(args6),
            Some(("::1".to_string(), 443))
        );
        assert_eq!(
            BehaviorMonitor::parse_sockaddr(r#"3, {sa_family=AF_UNIX, sun_path="/run/nscd/socket"}, 110"#),
            None
        );
    }

    #[test]
    fn test_classifies_events_of_interest() {
        let mut monitor = BehaviorMonitor::new();
        feed(
            &mut monitor,
            &[
                r#"100 1700000000.000001 execve("/sandbox/input/sample", ["/sandbox/input/sample"], 0x7ffd /* 5 vars */) = 0"#,
                r#"100 1700000000.000002 openat(AT_FDCWD, "/etc/shadow", O_RDONLY) = -1 EACCES (Permission denied)"#,
                r#"100 1700000000.000003 socket(AF_INET, SOCK_STREAM, IPPROTO_TCP) = 3"#,
                r#"100 1700000000.000004 connect(3, {sa_family=AF_INET, sin_port=htons(443), sin_addr=inet_addr("93.184.216.34")}, 16) = -1 ENETUNREACH (Network is unreachable)"#,
                r#"100 1700000000.000005 mprotect(0x7f0000000000, 4096, PROT_READ|PROT_WRITE|PROT_EXEC) = 0"#,
                r#"100 1700000000.000006 ptrace(PTRACE_ATTACH, 1) = -1 EPERM (Operation not permitted)"#,
                r#"100 1700000000.000007 read(3, "", 4096) = 0"#,
            ],
        );
        let out = monitor.finish();

        let kinds: Vec<EventKind> = out.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::ProcessExecution,
                EventKind::SensitiveFileAccess,
                EventKind::SocketCreation,
                EventKind::NetworkConnect,
                EventKind::MemoryProtectionChange,
                EventKind::ProcessTrace,
            ]
        );
        assert_eq!(out.events[1].severity, Severity::Critical);
        assert_eq!(out.syscall_summary.get("read"), Some(&1));
        assert_eq!(out.syscall_summary.values().sum::<u64>(), 7);
        assert_eq!(out.network_connections.len(), 1);
        assert_eq!(out.network_connections[0].connection_type, ConnectionType::Https);
        assert_eq!(out.processes[0].name, "sample");
    }

    #[test]
    fn test_process_tree_from_clone_and_exec() {
        let mut monitor = BehaviorMonitor::new();
        feed(
            &mut monitor,
            &[
                r#"200 1700000000.1 execve("/usr/bin/bash", ["bash", "-c", "id"], 0x7ffd /* 5 vars */) = 0"#,
                "200 1700000000.2 clone(child_stack=NULL, flags=CLONE_CHILD_CLEARTID|SIGCHLD) = 201",
                r#"201 1700000000.3 execve("/usr/bin/id", ["id"], 0x55d0 /* 5 vars */) = 0"#,
                "201 1700000000.4 +++ exited with 0 +++",
            ],
        );
        let out = monitor.finish();
        assert_eq!(out.processes.len(), 2);
        assert_eq!(out.processes[1].pid, 201);
        assert_eq!(out.processes[1].parent_pid, Some(200));
        assert_eq!(out.processes[1].name, "id");
        assert_eq!(out.processes[0].command_line, "bash -c id");
    }

    #[test]
    fn test_file_operations_and_autostart() {
        let mut monitor = BehaviorMonitor::new();
        feed(
            &mut monitor,
            &[
                r#"300 1700000000.1 openat(AT_FDCWD, "/tmp/home/sandbox/.bashrc", O_WRONLY|O_APPEND) = 4"#,
                r#"300 1700000000.2 openat(AT_FDCWD, "/tmp/home/sandbox/.profile", O_RDONLY) = 5"#,
                r#"300 1700000000.3 unlinkat(AT_FDCWD, "/tmp/dropper", 0) = 0"#,
                r#"300 1700000000.4 rename("/tmp/a", "/tmp/b") = 0"#,
                r#"300 1700000000.5 chmod("/tmp/b", 0755) = 0"#,
            ],
        );
        let out = monitor.finish();
        let autostart = out
            .events
            .iter()
            .filter(|e| e.kind == EventKind::AutostartWrite)
            .count();
        assert_eq!(autostart, 1);
        let ops: Vec<FileOperationType> = out.file_operations.iter().map(|f| f.operation).collect();
        assert_eq!(
            ops,
            vec![
                FileOperationType::Open,
                FileOperationType::Open,
                FileOperationType::Delete,
                FileOperationType::Rename,
                FileOperationType::Chmod,
            ]
        );
        assert_eq!(out.file_operations[3].target_path.as_deref(), Some("/tmp/b"));
    }

    #[test]
    fn test_loader_mmap_ignored() {
        let mut monitor = BehaviorMonitor::new();
        feed(
            &mut monitor,
            &[
                "1 1700000000.1 mmap(NULL, 2037344, PROT_READ|PROT_EXEC, MAP_PRIVATE|MAP_DENYWRITE, 3, 0) = 0x7f1e2a000000",
                "1 1700000000.2 mmap(NULL, 4096, PROT_READ|PROT_WRITE|PROT_EXEC, MAP_PRIVATE|MAP_ANONYMOUS, -1, 0) = 0x7f1e2b000000",
            ],
        );
        let out = monitor.finish();
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].kind, EventKind::MemoryProtectionChange);
    }

    #[test]
    fn test_packet_connections_deduplicated() {
        let mut monitor = BehaviorMonitor::new();
        for line in [
            "1700000000.1 IP 172.17.0.2.40000 > 8.8.8.8.53: UDP, length 30",
            "1700000000.2 IP 172.17.0.2.40001 > 8.8.8.8.53: UDP, length 30",
            "1700000000.3 IP 172.17.0.2.40002 > 1.2.3.4.80: tcp 0",
        ] {
            let pkt = crate::sandbox::trace::parse_tcpdump_line(line).unwrap();
            monitor.observe(&TraceRecord::Packet(pkt));
        }
        let out = monitor.finish();
        assert_eq!(out.network_connections.len(), 2);
        assert_eq!(out.network_connections[0].connection_type, ConnectionType::Dns);
        assert_eq!(out.network_connections[1].connection_type, ConnectionType::Http);
        assert!(out.events.is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_queue_on_stop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        for line in [
            "5 1700000000.1 socket(AF_INET, SOCK_DGRAM, IPPROTO_IP) = 3",
            "5 1700000000.2 fork() = 6",
        ] {
            tx.send(parse_strace_line(line).unwrap()).unwrap();
        }
        stop_tx.send(true).unwrap();

        let out = BehaviorMonitor::new().run(rx, stop_rx).await;
        assert_eq!(out.events.len(), 2);
        assert_eq!(out.processes.len(), 1);
        drop(tx);
    }
}
