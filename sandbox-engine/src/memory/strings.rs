/// String extraction from raw memory
///
/// Scans a byte buffer for printable ASCII runs and UTF-16LE runs, flags
/// strings that look like attacker tooling or encoded payloads, and assigns
/// a category by priority-ordered pattern match.

use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ExtractError;

/// Longest value kept for one string; the rest of the run is discarded
pub const MAX_STRING_LENGTH: usize = 512;

/// Entries holding the same value within this many bytes collapse to one
const DEDUP_WINDOW: u64 = 10;

const SUSPICIOUS_KEYWORDS: &[&str] = &[
    "cmd.exe", "powershell", "wscript", "cscript", "/bin/sh", "/bin/bash",
    "http://", "https://", "ftp://",
    "temp\\", "\\system32\\", "\\windows\\", "/etc/shadow", "/etc/passwd", "/.ssh/",
    "regsvr32", "rundll32", "mshta", "certutil", "bitsadmin",
    "password", "passwd", "credential", "private key",
    "administrator", "mimikatz",
    "exploit", "payload", "shellcode",
    "inject", "hook", "bypass",
    ".exe", ".dll", ".bat", ".vbs", ".ps1",
    "backdoor", "trojan", "malware",
    "keylog", "rootkit", "ransomware",
];

lazy_static! {
    static ref DRIVE_PATH: Regex = Regex::new(r"(?i)^[a-z]:\\").unwrap();
    static ref IPV4: Regex = Regex::new(
        r"^(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)(?:\.(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)){3}$"
    ).unwrap();
    static ref EMAIL: Regex = Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").unwrap();
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    Ascii,
    Unicode,
    Both,
}

impl StringEncoding {
    fn includes_ascii(self) -> bool {
        matches!(self, StringEncoding::Ascii | StringEncoding::Both)
    }

    fn includes_unicode(self) -> bool {
        matches!(self, StringEncoding::Unicode | StringEncoding::Both)
    }
}

impl FromStr for StringEncoding {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ascii" => Ok(StringEncoding::Ascii),
            "unicode" => Ok(StringEncoding::Unicode),
            "both" => Ok(StringEncoding::Both),
            _ => Err(ExtractError::InvalidEncoding(s.to_string())),
        }
    }
}

/// Encoding a single string was found in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FoundEncoding {
    Ascii,
    Unicode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StringCategory {
    Url,
    FilePath,
    Registry,
    IpAddress,
    Email,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedString {
    pub offset: u64,
    pub value: String,
    pub encoding: FoundEncoding,
    pub suspicious: bool,
    pub category: Option<StringCategory>,
}

pub struct StringExtractor;

impl StringExtractor {
    /// Extract strings of at least `min_length` characters. `encoding` is one
    /// of `ascii`, `unicode` or `both`; anything else is rejected.
    pub fn extract(
        buffer: &[u8],
        min_length: usize,
        encoding: &str,
    ) -> Result<Vec<ExtractedString>, ExtractError> {
        let encoding: StringEncoding = encoding.parse()?;
        Ok(Self::extract_with(buffer, min_length, encoding))
    }

    pub fn extract_with(
        buffer: &[u8],
        min_length: usize,
        encoding: StringEncoding,
    ) -> Vec<ExtractedString> {
        let min_length = min_length.max(1);
        let mut strings = Vec::new();

        if encoding.includes_ascii() {
            Self::scan_ascii(buffer, min_length, &mut strings);
        }
        if encoding.includes_unicode() {
            Self::scan_utf16le(buffer, min_length, &mut strings);
        }

        strings.sort_by_key(|s| s.offset);
        Self::dedup_nearby(strings)
    }

    fn scan_ascii(buffer: &[u8], min_length: usize, out: &mut Vec<ExtractedString>) {
        let mut run = RunBuilder::new(min_length, FoundEncoding::Ascii);
        for (offset, &byte) in buffer.iter().enumerate() {
            if is_printable(byte) {
                run.push(offset as u64, byte);
            } else {
                run.flush(out);
            }
        }
        run.flush(out);
    }

    fn scan_utf16le(buffer: &[u8], min_length: usize, out: &mut Vec<ExtractedString>) {
        let mut run = RunBuilder::new(min_length, FoundEncoding::Unicode);
        let mut i = 0;
        while i + 1 < buffer.len() {
            let (low, high) = (buffer[i], buffer[i + 1]);
            if high == 0 && is_printable(low) {
                run.push(i as u64, low);
                i += 2;
            } else {
                run.flush(out);
                i += 1;
            }
        }
        run.flush(out);
    }

    /// Drop any entry whose value was already kept within the dedup window.
    /// Input must be sorted by offset.
    fn dedup_nearby(strings: Vec<ExtractedString>) -> Vec<ExtractedString> {
        let mut kept: Vec<ExtractedString> = Vec::with_capacity(strings.len());
        for s in strings {
            let duplicate = kept
                .iter()
                .rev()
                .take_while(|k| s.offset - k.offset <= DEDUP_WINDOW)
                .any(|k| k.value == s.value);
            if !duplicate {
                kept.push(s);
            }
        }
        kept
    }
}

struct RunBuilder {
    min_length: usize,
    encoding: FoundEncoding,
    start: u64,
    value: String,
    chars: usize,
}

impl RunBuilder {
    fn new(min_length: usize, encoding: FoundEncoding) -> Self {
        Self {
            min_length,
            encoding,
            start: 0,
            value: String::new(),
            chars: 0,
        }
    }

    fn push(&mut self, offset: u64, byte: u8) {
        if self.chars == 0 {
            self.start = offset;
        }
        if self.chars < MAX_STRING_LENGTH {
            self.value.push(byte as char);
        }
        self.chars += 1;
    }

    fn flush(&mut self, out: &mut Vec<ExtractedString>) {
        if self.chars >= self.min_length {
            let value = std::mem::take(&mut self.value);
            out.push(ExtractedString {
                offset: self.start,
                suspicious: is_suspicious(&value),
                category: categorize(&value),
                encoding: self.encoding,
                value,
            });
        }
        self.value.clear();
        self.chars = 0;
    }
}

fn is_printable(byte: u8) -> bool {
    (32..=126).contains(&byte) || byte == b'\t' || byte == b'\n' || byte == b'\r'
}

/// Shannon entropy in bits per byte
fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut freq = [0u32; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }

    let len = data.len() as f64;
    freq.iter().filter(|&&f| f > 0).fold(0.0, |ent, &f| {
        let p = f as f64 / len;
        ent - p * p.log2()
    })
}

fn looks_like_base64(s: &str) -> bool {
    if s.len() < 20 {
        return false;
    }
    let charset = s
        .bytes()
        .filter(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
        .count();
    charset as f64 / s.len() as f64 >= 0.95 && shannon_entropy(s.as_bytes()) >= 4.0
}

fn looks_like_hex(s: &str) -> bool {
    s.len() >= 32 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn is_suspicious(value: &str) -> bool {
    let lower = value.to_lowercase();
    SUSPICIOUS_KEYWORDS.iter().any(|k| lower.contains(k))
        || looks_like_base64(value)
        || looks_like_hex(value)
}

pub fn categorize(value: &str) -> Option<StringCategory> {
    let trimmed = value.trim();
    let lower = trimmed.to_lowercase();

    if lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("ftp://") {
        return Some(StringCategory::Url);
    }

    let windows_binary = trimmed.contains('\\')
        && [".exe", ".dll", ".sys"].iter().any(|ext| lower.contains(ext));
    let unix_path = ["/etc/", "/tmp/", "/usr/", "/bin/", "/var/", "/home/", "/proc/"]
        .iter()
        .any(|root| trimmed.starts_with(root));
    if DRIVE_PATH.is_match(trimmed) || windows_binary || unix_path {
        return Some(StringCategory::FilePath);
    }

    if IPV4.is_match(trimmed) {
        return Some(StringCategory::IpAddress);
    }

    if EMAIL.is_match(trimmed) {
        return Some(StringCategory::Email);
    }

    if trimmed.starts_with("HKEY_")
        || trimmed.starts_with("HKLM\\")
        || trimmed.starts_with("HKCU\\")
        || trimmed.contains("\\Software\\")
        || trimmed.contains("\\CurrentVersion\\")
    {
        return Some(StringCategory::Registry);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn utf16le(s: &str) -> Vec<u8> {
        s.bytes().flat_map(|b| [b, 0]).collect()
    }

    #[test]
    fn test_mixed_encodings_categorized() {
        let mut buffer = vec![0u8; 8];
        buffer.extend_from_slice(br"C:\Windows\System32\cmd.exe");
        buffer.extend_from_slice(&[0xff, 0xfe, 0x00, 0x00]);
        buffer.extend_from_slice(&utf16le("http://10.0.0.5/payload"));
        buffer.extend_from_slice(&[0xff, 0xff]);

        let strings = StringExtractor::extract(&buffer, 4, "both").unwrap();
        let path = strings
            .iter()
            .find(|s| s.value == r"C:\Windows\System32\cmd.exe")
            .expect("ascii path extracted");
        assert_eq!(path.encoding, FoundEncoding::Ascii);
        assert_eq!(path.category, Some(StringCategory::FilePath));
        assert!(path.suspicious);
        assert_eq!(path.offset, 8);

        let url = strings
            .iter()
            .find(|s| s.value == "http://10.0.0.5/payload")
            .expect("utf-16 url extracted");
        assert_eq!(url.encoding, FoundEncoding::Unicode);
        assert_eq!(url.category, Some(StringCategory::Url));
        assert!(url.suspicious);
    }

    #[test]
    fn test_short_runs_dropped() {
        let buffer = b"abc\x00def\x00ghi\x01xyz";
        assert!(StringExtractor::extract(buffer, 4, "ascii").unwrap().is_empty());
        assert!(StringExtractor::extract(buffer, 4, "both").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_encoding_rejected() {
        assert_eq!(
            StringExtractor::extract(b"hello world", 4, "xml"),
            Err(ExtractError::InvalidEncoding("xml".to_string()))
        );
        assert!(StringExtractor::extract(b"hello world", 4, "BOTH").is_ok());
    }

    #[test]
    fn test_values_capped() {
        let buffer = vec![b'A'; 2000];
        let strings = StringExtractor::extract(&buffer, 4, "ascii").unwrap();
        assert_eq!(strings.len(), 1);
        assert_eq!(strings[0].value.len(), MAX_STRING_LENGTH);
    }

    #[test]
    fn test_output_sorted_and_near_duplicates_collapsed() {
        let buffer = b"beacon\x00beacon\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00beacon\x00other1";
        let strings = StringExtractor::extract(buffer, 4, "ascii").unwrap();
        let offsets: Vec<u64> = strings.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 26, 33]);

        for (i, a) in strings.iter().enumerate() {
            for b in &strings[i + 1..] {
                assert!(a.value != b.value || b.offset - a.offset > DEDUP_WINDOW);
            }
            if i > 0 {
                assert!(strings[i - 1].offset <= a.offset);
            }
        }
    }

    #[test]
    fn test_categories() {
        assert_eq!(categorize("https://evil.example/gate.php"), Some(StringCategory::Url));
        assert_eq!(categorize("/etc/cron.d/update"), Some(StringCategory::FilePath));
        assert_eq!(categorize("192.168.1.10"), Some(StringCategory::IpAddress));
        assert_eq!(categorize("999.1.1.1"), None);
        assert_eq!(categorize("ops@example.com"), Some(StringCategory::Email));
        assert_eq!(
            categorize(r"HKEY_LOCAL_MACHINE\Software\Microsoft\Windows\CurrentVersion\Run"),
            Some(StringCategory::Registry)
        );
        assert_eq!(categorize("hello world"), None);
    }

    #[test]
    fn test_suspicious_heuristics() {
        assert!(is_suspicious("powershell -enc"));
        assert!(is_suspicious("U2hlbGxjb2RlTG9hZGVyVjJfcGF5bG9hZA=="));
        assert!(is_suspicious("d41d8cd98f00b204e9800998ecf8427ed41d8cd9"));
        assert!(!is_suspicious("hello world"));
        assert!(!is_suspicious("aaaaaaaaaaaaaaaaaaaaaaaa"));
    }
}
