//! The deterministic reviewer.
//!
//! Before the oracle is allowed an opinion, confirm on disk that a
//! structural change actually happened: read every modified file directly
//! (bypassing the context buffer), hash it, and compare against the
//! fingerprints recorded at write time.

use std::fs;

use super::state::AgentState;
use crate::util::hash_bytes;

/// What the deterministic pass decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDecision {
    /// No observable change; do not waste an oracle call.
    Reject { reason: String },
    /// Disk changed; ask the oracle for a goal-satisfaction judgement over
    /// these files.
    AskOracle { files: Vec<String> },
}

pub fn deterministic_review(state: &AgentState) -> ReviewDecision {
    // Nothing modified at REVIEWER entry means nothing to approve.
    if state.files_modified.is_empty() {
        return ReviewDecision::Reject {
            reason: "no edits produced".to_string(),
        };
    }

    let mut changed = Vec::new();
    for file in &state.files_modified {
        let disk = match fs::read(state.repo_root.join(file)) {
            Ok(bytes) => hash_bytes(&bytes),
            Err(_) => {
                // File vanished after an approved write: still a change,
                // but nothing the fingerprint can vouch for.
                return ReviewDecision::Reject {
                    reason: format!("no change on disk: {} unreadable", file),
                };
            }
        };

        let Some(fingerprint) = state.diff_memory.get(file) else {
            return ReviewDecision::Reject {
                reason: format!("no change on disk: {} has no fingerprint", file),
            };
        };
        if disk == fingerprint.pre_hash {
            return ReviewDecision::Reject {
                reason: format!("no change on disk: {}", file),
            };
        }
        changed.push(file.clone());
    }

    ReviewDecision::AskOracle { files: changed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::DiffFingerprint;
    use crate::util::hash_str;
    use std::fs;

    fn state_with_file(content: &str) -> (tempfile::TempDir, AgentState) {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("app.py"), content).unwrap();
        let state = AgentState::new("goal", tmp.path());
        (tmp, state)
    }

    #[test]
    fn test_empty_modified_set_rejects() {
        let (_tmp, state) = state_with_file("x = 1\n");
        assert_eq!(
            deterministic_review(&state),
            ReviewDecision::Reject {
                reason: "no edits produced".to_string()
            }
        );
    }

    #[test]
    fn test_missing_fingerprint_rejects() {
        let (_tmp, mut state) = state_with_file("x = 1\n");
        state.files_modified.insert("app.py".to_string());
        match deterministic_review(&state) {
            ReviewDecision::Reject { reason } => assert!(reason.contains("no fingerprint")),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_disk_equal_to_pre_edit_hash_rejects() {
        let (_tmp, mut state) = state_with_file("x = 1\n");
        state.files_modified.insert("app.py".to_string());
        state.diff_memory.insert(
            "app.py".to_string(),
            DiffFingerprint {
                pre_hash: hash_str("x = 1\n"),
                post_hash: hash_str("x = 2\n"),
            },
        );
        match deterministic_review(&state) {
            ReviewDecision::Reject { reason } => assert!(reason.starts_with("no change on disk")),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_changed_disk_asks_oracle() {
        let (_tmp, mut state) = state_with_file("x = 2\n");
        state.files_modified.insert("app.py".to_string());
        state.diff_memory.insert(
            "app.py".to_string(),
            DiffFingerprint {
                pre_hash: hash_str("x = 1\n"),
                post_hash: hash_str("x = 2\n"),
            },
        );
        assert_eq!(
            deterministic_review(&state),
            ReviewDecision::AskOracle {
                files: vec!["app.py".to_string()]
            }
        );
    }
}
