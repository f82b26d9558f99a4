/// MITRE ATT&CK mapping
///
/// Maps recognized behavior events to ATT&CK techniques through a static
/// table. The first event matching a technique creates its entry; later
/// matches only add evidence, so a run never reports a technique twice.

use serde::{Deserialize, Serialize};

use super::{BehaviorEvent, EventKind};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MitreAttack {
    pub technique_id: String,
    pub technique_name: String,
    pub tactic: String,
    pub description: String,
    pub confidence: f32,
    /// Indices into the report's behavioral events
    pub evidence: Vec<usize>,
}

struct TechniqueRule {
    kind: EventKind,
    id: &'static str,
    name: &'static str,
    tactic: &'static str,
    description: &'static str,
    confidence: f32,
}

const TECHNIQUE_TABLE: &[TechniqueRule] = &[
    TechniqueRule {
        kind: EventKind::ProcessExecution,
        id: "T1059",
        name: "Command and Scripting Interpreter",
        tactic: "execution",
        description: "Sample executed a new program image",
        confidence: 0.7,
    },
    TechniqueRule {
        kind: EventKind::ProcessCreation,
        id: "T1106",
        name: "Native API",
        tactic: "execution",
        description: "Sample spawned processes through direct system calls",
        confidence: 0.5,
    },
    TechniqueRule {
        kind: EventKind::NetworkConnect,
        id: "T1071",
        name: "Application Layer Protocol",
        tactic: "command_and_control",
        description: "Sample initiated outbound network connections",
        confidence: 0.7,
    },
    TechniqueRule {
        kind: EventKind::SocketCreation,
        id: "T1095",
        name: "Non-Application Layer Protocol",
        tactic: "command_and_control",
        description: "Sample created raw or transport-level sockets",
        confidence: 0.4,
    },
    TechniqueRule {
        kind: EventKind::SensitiveFileAccess,
        id: "T1003",
        name: "OS Credential Dumping",
        tactic: "credential_access",
        description: "Sample read credential stores",
        confidence: 0.9,
    },
    TechniqueRule {
        kind: EventKind::MemoryProtectionChange,
        id: "T1055",
        name: "Process Injection",
        tactic: "defense_evasion",
        description: "Sample made memory executable at runtime",
        confidence: 0.8,
    },
    TechniqueRule {
        kind: EventKind::ProcessTrace,
        id: "T1055",
        name: "Process Injection",
        tactic: "defense_evasion",
        description: "Sample attached to another process with ptrace",
        confidence: 0.8,
    },
    TechniqueRule {
        kind: EventKind::MemoryAnomaly,
        id: "T1055",
        name: "Process Injection",
        tactic: "defense_evasion",
        description: "Executable memory found in writable or non-code regions",
        confidence: 0.8,
    },
    TechniqueRule {
        kind: EventKind::AutostartWrite,
        id: "T1547",
        name: "Boot or Logon Autostart Execution",
        tactic: "persistence",
        description: "Sample wrote to an autostart location",
        confidence: 0.9,
    },
    TechniqueRule {
        kind: EventKind::FileDeletion,
        id: "T1070",
        name: "Indicator Removal",
        tactic: "defense_evasion",
        description: "Sample deleted files",
        confidence: 0.4,
    },
    TechniqueRule {
        kind: EventKind::PermissionChange,
        id: "T1222",
        name: "File and Directory Permissions Modification",
        tactic: "defense_evasion",
        description: "Sample changed file permissions",
        confidence: 0.5,
    },
    TechniqueRule {
        kind: EventKind::PrivilegeChange,
        id: "T1548",
        name: "Abuse Elevation Control Mechanism",
        tactic: "privilege_escalation",
        description: "Sample attempted to change its user or group identity",
        confidence: 0.6,
    },
    TechniqueRule {
        kind: EventKind::EvasionAttempt,
        id: "T1497",
        name: "Virtualization/Sandbox Evasion",
        tactic: "defense_evasion",
        description: "Sample checked for analysis-environment artifacts",
        confidence: 0.8,
    },
];

pub struct MitreMapper;

impl MitreMapper {
    pub fn map(events: &[BehaviorEvent]) -> Vec<MitreAttack> {
        let mut attacks: Vec<MitreAttack> = Vec::new();

        for (idx, event) in events.iter().enumerate() {
            let Some(rule) = TECHNIQUE_TABLE.iter().find(|r| r.kind == event.kind) else {
                continue;
            };

            match attacks.iter_mut().find(|a| a.technique_id == rule.id) {
                Some(existing) => existing.evidence.push(idx),
                None => attacks.push(MitreAttack {
                    technique_id: rule.id.to_string(),
                    technique_name: rule.name.to_string(),
                    tactic: rule.tactic.to_string(),
                    description: rule.description.to_string(),
                    confidence: rule.confidence,
                    evidence: vec![idx],
                }),
            }
        }

        attacks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashSet;

    fn event(kind: EventKind) -> BehaviorEvent {
        BehaviorEvent::new(Utc::now(), kind, "test", 100, "")
    }

    #[test]
    fn test_core_mappings() {
        let events = vec![
            event(EventKind::ProcessExecution),
            event(EventKind::NetworkConnect),
            event(EventKind::SensitiveFileAccess),
            event(EventKind::MemoryProtectionChange),
            event(EventKind::AutostartWrite),
        ];
        let ids: Vec<String> = MitreMapper::map(&events)
            .into_iter()
            .map(|a| a.technique_id)
            .collect();
        assert_eq!(ids, vec!["T1059", "T1071", "T1003", "T1055", "T1547"]);
    }

    #[test]
    fn test_no_duplicate_techniques() {
        let events = vec![
            event(EventKind::MemoryProtectionChange),
            event(EventKind::ProcessTrace),
            event(EventKind::NetworkConnect),
            event(EventKind::MemoryAnomaly),
            event(EventKind::NetworkConnect),
        ];
        let attacks = MitreMapper::map(&events);
        let unique: HashSet<_> = attacks.iter().map(|a| a.technique_id.clone()).collect();
        assert_eq!(unique.len(), attacks.len());

        let injection = attacks.iter().find(|a| a.technique_id == "T1055").unwrap();
        assert_eq!(injection.evidence, vec![0, 1, 3]);
        assert_eq!(injection.description, "Sample made memory executable at runtime");
    }

    #[test]
    fn test_empty_events() {
        assert!(MitreMapper::map(&[]).is_empty());
    }
}
