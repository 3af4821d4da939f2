//! Foundational utilities shared across Clawdis crates.
//!
//! Covers the state-file ground rules the rest of the workspace leans on:
//! snapshot files are replaced atomically after an fsync, store writers
//! coordinate through metadata-carrying lock files, identifiers come from
//! one process-wide sequence, and logs are daily files with date-based
//! retention plus a byte-capped JSONL run log.

pub mod atomic_io;
pub mod clock;
pub mod duration_parse;
pub mod file_lock;
pub mod identifiers;
pub mod log_files;

pub use atomic_io::{write_json_atomic, write_text_atomic};
pub use clock::{unix_time_ms, unix_time_secs};
pub use duration_parse::parse_every_duration;
pub use file_lock::{LockPolicy, StoreLock};
pub use identifiers::{
    generate_pairing_code, generate_run_id, temp_file_token, PAIRING_CODE_CHARSET,
};
pub use log_files::{
    append_daily_log_line, append_jsonl_capped, daily_log_file_name, DEFAULT_LOG_KEEP_DAYS,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_write_then_lock_cycle_works_end_to_end() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store_path = temp.path().join("store.json");
        let lock_path = store_path.with_extension("lock");

        let _lock = StoreLock::acquire(&lock_path, LockPolicy::default()).expect("lock");
        write_text_atomic(&store_path, "{}").expect("write");
        assert_eq!(std::fs::read_to_string(&store_path).expect("read"), "{}");
    }

    #[test]
    fn pairing_codes_stay_inside_the_published_charset() {
        let code = generate_pairing_code();
        assert_eq!(code.len(), 8);
        assert!(code.chars().all(|ch| PAIRING_CODE_CHARSET.contains(ch)));
    }
}
