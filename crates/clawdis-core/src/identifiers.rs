//! Process-unique identifiers.
//!
//! One shared sequence feeds every identifier this process mints: run ids,
//! temp-file tokens, anything that must never collide with a sibling task.
//! Pairing codes are the exception; they are random because a human reads
//! them back to the gateway, not because they need uniqueness across runs.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::clock::unix_time_ms;

/// Pairing codes avoid `0`, `O`, `1`, and `I` so they survive being read aloud.
pub const PAIRING_CODE_CHARSET: &str = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const PAIRING_CODE_LENGTH: usize = 8;

static SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Run identifier: creation-ordered within a process, unique across
/// restarts through the timestamp component.
pub fn generate_run_id() -> String {
    format!("run-{}-{}", unix_time_ms(), next_sequence())
}

/// Token for temp-file names: `<pid>.<sequence>`. Distinct per call, so two
/// writers aiming at the same destination never share a scratch file.
pub fn temp_file_token() -> String {
    format!("{}.{}", std::process::id(), next_sequence())
}

/// Generates an 8-character pairing code from the unambiguous charset.
pub fn generate_pairing_code() -> String {
    let charset = PAIRING_CODE_CHARSET.as_bytes();
    let mut rng = rand::thread_rng();
    (0..PAIRING_CODE_LENGTH)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{generate_pairing_code, generate_run_id, temp_file_token, PAIRING_CODE_CHARSET};

    #[test]
    fn unit_run_ids_and_temp_tokens_share_a_collision_free_sequence() {
        let mut seen = HashSet::new();
        for _ in 0..32 {
            assert!(seen.insert(generate_run_id()));
            assert!(seen.insert(format!("tmp:{}", temp_file_token())));
        }
    }

    #[test]
    fn unit_pairing_code_excludes_ambiguous_characters() {
        assert!(!PAIRING_CODE_CHARSET.contains('0'));
        assert!(!PAIRING_CODE_CHARSET.contains('O'));
        assert!(!PAIRING_CODE_CHARSET.contains('1'));
        assert!(!PAIRING_CODE_CHARSET.contains('I'));
        for _ in 0..32 {
            let code = generate_pairing_code();
            assert_eq!(code.len(), 8);
            assert!(code.chars().all(|ch| PAIRING_CODE_CHARSET.contains(ch)));
        }
    }
}
