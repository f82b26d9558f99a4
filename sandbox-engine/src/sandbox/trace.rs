/// Trace record parsing and fan-out
///
/// The container emits two line-oriented streams: the `strace -f -ttt` log of
/// the sample's process tree and, when network capture is on, `tcpdump -l -n
/// -tt -q` output. Each line is parsed into a [`TraceRecord`] and delivered,
/// in stream order, to every subscriber registered on a [`TraceHub`].

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::container::LineStream;

lazy_static! {
    // "1234 1700000000.123456 openat(AT_FDCWD, "/etc/passwd", O_RDONLY) = 3"
    static ref SYSCALL_LINE: Regex = Regex::new(
        r"^(?:(\d+)\s+)?(?:(\d+\.\d+|\d{2}:\d{2}:\d{2}\.\d+)\s+)?([a-z_][a-z0-9_]*)\((.*)\)\s+=\s+(.+)$"
    ).unwrap();
    // "1234 1700000000.123456 connect(3, {...}, 16 <unfinished ...>"
    static ref UNFINISHED_LINE: Regex = Regex::new(
        r"^(?:(\d+)\s+)?(?:(\d+\.\d+|\d{2}:\d{2}:\d{2}\.\d+)\s+)?([a-z_][a-z0-9_]*)\((.*?)\s*<unfinished \.\.\.>$"
    ).unwrap();
    // "1234 1700000000.123456 +++ exited with 0 +++" / "+++ killed by SIGKILL +++"
    static ref EXIT_LINE: Regex = Regex::new(
        r"^(?:(\d+)\s+)?(?:(\d+\.\d+|\d{2}:\d{2}:\d{2}\.\d+)\s+)?\+\+\+ (?:exited with (-?\d+)|killed by (\w+)[^+]*) \+\+\+$"
    ).unwrap();
    static ref QUOTED: Regex = Regex::new(r#""((?:[^"\\]|\\.)*)""#).unwrap();
}

/// One parsed syscall invocation
#[derive(Debug, Clone, PartialEq)]
pub struct SyscallRecord {
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub args: String,
    /// Raw return text, `None` when the call had not returned yet
    pub result: Option<String>,
}

impl SyscallRecord {
    /// Numeric return value, decimal or hex
    pub fn return_value(&self) -> Option<i64> {
        let token = self.result.as_deref()?.split_whitespace().next()?;
        match token.strip_prefix("0x") {
            Some(hex) => i64::from_str_radix(hex, 16).ok(),
            None => token.parse().ok(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.return_value().map(|v| v >= 0).unwrap_or(false)
    }

    /// Quoted string arguments in order of appearance
    pub fn quoted_args(&self) -> Vec<String> {
        QUOTED
            .captures_iter(&self.args)
            .map(|c| c[1].to_string())
            .collect()
    }

    pub fn first_path(&self) -> Option<String> {
        self.quoted_args().into_iter().next()
    }
}

/// One packet seen by tcpdump
#[derive(Debug, Clone, PartialEq)]
pub struct PacketRecord {
    pub timestamp: DateTime<Utc>,
    pub protocol: String,
    pub source: String,
    pub destination: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraceRecord {
    Syscall(SyscallRecord),
    Exit {
        pid: u32,
        timestamp: DateTime<Utc>,
        code: Option<i32>,
        signal: Option<String>,
    },
    Packet(PacketRecord),
}

impl TraceRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TraceRecord::Syscall(s) => s.timestamp,
            TraceRecord::Exit { timestamp, .. } => *timestamp,
            TraceRecord::Packet(p) => p.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Syscalls,
    Packets,
}

/// Parse `-ttt` epoch seconds or `-tt` wall-clock time
fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return Utc::now();
    };

    if raw.contains(':') {
        return NaiveTime::parse_from_str(raw, "%H:%M:%S%.f")
            .ok()
            .and_then(|t| Utc::now().date_naive().and_time(t).and_local_timezone(Utc).single())
            .unwrap_or_else(Utc::now);
    }

    let (secs, frac) = raw.split_once('.').unwrap_or((raw, "0"));
    let secs: i64 = secs.parse().unwrap_or(0);
    let micros: u32 = format!("{:0<6}", &frac[..frac.len().min(6)]).parse().unwrap_or(0);
    Utc.timestamp_opt(secs, micros * 1000)
        .single()
        .unwrap_or_else(Utc::now)
}

fn parse_pid(raw: Option<&str>) -> u32 {
    raw.and_then(|p| p.parse().ok()).unwrap_or(0)
}

/// Parse one strace line. Signal notices and `<... resumed>` tails yield `None`.
pub fn parse_strace_line(line: &str) -> Option<TraceRecord> {
    let line = line.trim();
    if line.is_empty() || line.contains("<... ") || line.contains("--- SIG") {
        return None;
    }

    if let Some(caps) = EXIT_LINE.captures(line) {
        return Some(TraceRecord::Exit {
            pid: parse_pid(caps.get(1).map(|m| m.as_str())),
            timestamp: parse_timestamp(caps.get(2).map(|m| m.as_str())),
            code: caps.get(3).and_then(|m| m.as_str().parse().ok()),
            signal: caps.get(4).map(|m| m.as_str().to_string()),
        });
    }

    if let Some(caps) = UNFINISHED_LINE.captures(line) {
        return Some(TraceRecord::Syscall(SyscallRecord {
            pid: parse_pid(caps.get(1).map(|m| m.as_str())),
            timestamp: parse_timestamp(caps.get(2).map(|m| m.as_str())),
            name: caps[3].to_string(),
            args: caps[4].trim_end_matches(',').trim().to_string(),
            result: None,
        }));
    }

    let caps = SYSCALL_LINE.captures(line)?;
    Some(TraceRecord::Syscall(SyscallRecord {
        pid: parse_pid(caps.get(1).map(|m| m.as_str())),
        timestamp: parse_timestamp(caps.get(2).map(|m| m.as_str())),
        name: caps[3].to_string(),
        args: caps[4].to_string(),
        result: Some(caps[5].trim().to_string()),
    }))
}

/// Split tcpdump's `a.b.c.d.port` notation
fn split_endpoint(endpoint: &str) -> (String, Option<u16>) {
    let endpoint = endpoint.trim_end_matches(':');
    let dots = endpoint.matches('.').count();
    if dots == 4 {
        if let Some((addr, port)) = endpoint.rsplit_once('.') {
            if let Ok(port) = port.parse() {
                return (addr.to_string(), Some(port));
            }
        }
    }
    (endpoint.to_string(), None)
}

/// Parse one `tcpdump -l -n -tt -q` line
pub fn parse_tcpdump_line(line: &str) -> Option<PacketRecord> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let ip_idx = tokens.iter().position(|t| *t == "IP")?;
    if tokens.get(ip_idx + 2) != Some(&">") {
        return None;
    }

    let (source, _) = split_endpoint(tokens.get(ip_idx + 1)?);
    let (destination, port) = split_endpoint(tokens.get(ip_idx + 3)?);
    let protocol = tokens
        .get(ip_idx + 4)
        .map(|t| t.trim_end_matches(',').to_lowercase())
        .unwrap_or_else(|| "ip".to_string());

    Some(PacketRecord {
        timestamp: parse_timestamp(tokens.first().filter(|t| t.contains('.')).copied()),
        protocol,
        source,
        destination,
        port: port.unwrap_or(0),
    })
}

pub fn parse_line(kind: StreamKind, line: &str) -> Option<TraceRecord> {
    match kind {
        StreamKind::Syscalls => parse_strace_line(line),
        StreamKind::Packets => parse_tcpdump_line(line).map(TraceRecord::Packet),
    }
}

/// Delivers every parsed record to each subscriber. Channels are unbounded so
/// a slow consumer (a memory snapshot in progress) never drops records.
#[derive(Default)]
pub struct TraceHub {
    subscribers: Vec<mpsc::UnboundedSender<TraceRecord>>,
}

impl TraceHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TraceRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Spawn one pump per stream. Pumps end when their stream closes or all
    /// subscribers are gone; dropping the hub's senders closes the receivers
    /// once every pump has finished.
    pub fn spawn(self, streams: Vec<(StreamKind, LineStream)>) -> Vec<JoinHandle<()>> {
        streams
            .into_iter()
            .map(|(kind, mut stream)| {
                let subscribers = self.subscribers.clone();
                tokio::spawn(async move {
                    let mut forwarded = 0u64;
                    while let Some(line) = stream.next_line().await {
                        let Some(record) = parse_line(kind, &line) else {
                            continue;
                        };
                        let mut delivered = false;
                        for tx in &subscribers {
                            delivered |= tx.send(record.clone()).is_ok();
                        }
                        if !delivered {
                            break;
                        }
                        forwarded += 1;
                    }
                    debug!(stream = ?kind, forwarded, "Trace stream closed");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syscall(line: &str) -> SyscallRecord {
        match parse_strace_line(line) {
            Some(TraceRecord::Syscall(s)) => s,
            other => panic!("expected syscall record, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_complete_line() {
        let rec = syscall(
            r#"1234 1700000000.250000 openat(AT_FDCWD, "/etc/passwd", O_RDONLY|O_CLOEXEC) = 3"#,
        );
        assert_eq!(rec.pid, 1234);
        assert_eq!(rec.name, "openat");
        assert_eq!(rec.first_path().as_deref(), Some("/etc/passwd"));
        assert_eq!(rec.return_value(), Some(3));
        assert_eq!(rec.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(rec.timestamp.timestamp_subsec_micros(), 250_000);
    }

    #[test]
    fn test_parse_failed_call() {
        let rec = syscall(
            r#"88 1700000001.000001 openat(AT_FDCWD, "/.dockerenv", O_RDONLY) = -1 ENOENT (No such file or directory)"#,
        );
        assert_eq!(rec.return_value(), Some(-1));
        assert!(!rec.succeeded());
    }

    #[test]
    fn test_parse_wall_clock_and_no_pid() {
        let rec = syscall(r#"12:30:45.123456 execve("/bin/sh", ["sh"], 0x7ffc /* 3 vars */) = 0"#);
        assert_eq!(rec.pid, 0);
        assert_eq!(rec.name, "execve");
        assert!(rec.succeeded());
    }

    #[test]
    fn test_parse_unfinished_and_resumed() {
        let rec = syscall("77 1700000000.5 wait4(-1,  <unfinished ...>");
        assert_eq!(rec.name, "wait4");
        assert!(rec.result.is_none());
        assert!(parse_strace_line("77 1700000000.6 <... wait4 resumed>[{WIFEXITED(s)}], 0, NULL) = 78").is_none());
        assert!(parse_strace_line("77 1700000000.7 --- SIGCHLD {si_signo=SIGCHLD} ---").is_none());
    }

    #[test]
    fn test_parse_exit_lines() {
        assert_eq!(
            parse_strace_line("42 1700000000.9 +++ exited with 3 +++"),
            Some(TraceRecord::Exit {
                pid: 42,
                timestamp: Utc.timestamp_opt(1_700_000_000, 900_000_000).unwrap(),
                code: Some(3),
                signal: None,
            })
        );
        match parse_strace_line("42 1700000000.9 +++ killed by SIGKILL +++") {
            Some(TraceRecord::Exit { signal, code, .. }) => {
                assert_eq!(signal.as_deref(), Some("SIGKILL"));
                assert_eq!(code, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_tcpdump_lines() {
        let pkt = parse_tcpdump_line("1700000000.100000 IP 172.17.0.2.43312 > 93.184.216.34.443: tcp 0")
            .unwrap();
        assert_eq!(pkt.protocol, "tcp");
        assert_eq!(pkt.source, "172.17.0.2");
        assert_eq!(pkt.destination, "93.184.216.34");
        assert_eq!(pkt.port, 443);

        let pkt = parse_tcpdump_line("1700000000.2 eth0 Out IP 172.17.0.2.5353 > 8.8.8.8.53: UDP, length 32")
            .unwrap();
        assert_eq!(pkt.protocol, "udp");
        assert_eq!(pkt.port, 53);

        let pkt = parse_tcpdump_line("1700000000.3 IP 172.17.0.2 > 10.0.0.5: ICMP echo request, id 1, seq 1, length 64")
            .unwrap();
        assert_eq!(pkt.protocol, "icmp");
        assert_eq!(pkt.port, 0);

        assert!(parse_tcpdump_line("1700000000.4 ARP, Request who-has 172.17.0.1").is_none());
    }

    #[tokio::test]
    async fn test_hub_fans_out_in_order() {
        let (tx, rx) = mpsc::channel(16);
        let mut hub = TraceHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        let pumps = hub.spawn(vec![(StreamKind::Syscalls, LineStream::from_receiver(rx))]);

        tx.send("1 1700000000.1 fork() = 2".to_string()).await.unwrap();
        tx.send("garbage".to_string()).await.unwrap();
        tx.send("1 1700000000.2 socket(AF_INET, SOCK_STREAM, IPPROTO_TCP) = 3".to_string())
            .await
            .unwrap();
        drop(tx);
        for pump in pumps {
            pump.await.unwrap();
        }

        for rx in [&mut first, &mut second] {
            let names: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
                .filter_map(|r| match r {
                    TraceRecord::Syscall(s) => Some(s.name),
                    _ => None,
                })
                .collect();
            assert_eq!(names, vec!["fork", "socket"]);
        }
    }
}
