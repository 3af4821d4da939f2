//! Cron runtime: named jobs with `every` / `at` / `cron` schedules.
//!
//! Jobs persist in a schema-versioned file; every execution appends to an
//! append-only run log. Payloads re-enter the scheduler as synthesized
//! prompts; `next-heartbeat` wake mode only pokes the heartbeat scheduler.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use clawdis_core::{append_jsonl_capped, parse_every_duration, unix_time_ms, write_json_atomic};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::run_registry::RunState;
use crate::run_scheduler::SessionScheduler;

pub const CRON_SCHEMA_VERSION: u32 = 1;

/// The run log keeps only recent history; status RPCs never read further
/// back than this.
const CRON_RUN_LOG_MAX_BYTES: u64 = 1024 * 1024;

fn cron_schema_version() -> u32 {
    CRON_SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
/// Enumerates supported `CronSchedule` values.
pub enum CronSchedule {
    /// Fixed interval, `every` duration string (default unit minutes).
    Every { every: String },
    /// One-shot wall-clock instant.
    At { at_unix_ms: u64 },
    /// Five-field cron expression (minute granularity).
    Cron { expr: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
/// Enumerates supported `CronWakeMode` values.
pub enum CronWakeMode {
    /// Run the payload immediately through the scheduler.
    #[default]
    Now,
    /// Only wake the heartbeat; the payload rides the next heartbeat run.
    NextHeartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
/// Enumerates supported `CronPayload` values.
pub enum CronPayload {
    /// Injected as a system-style prompt on the main lane.
    SystemPrompt { text: String },
    /// Treated like a user message.
    UserMessage { text: String },
}

impl CronPayload {
    pub fn text(&self) -> &str {
        match self {
            Self::SystemPrompt { text } | Self::UserMessage { text } => text,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Public struct `CronJob` used across Clawdis components.
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub schedule: CronSchedule,
    #[serde(default)]
    pub wake_mode: CronWakeMode,
    pub payload: CronPayload,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub last_run_unix_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct CronJobFile {
    #[serde(default = "cron_schema_version")]
    schema_version: u32,
    #[serde(default)]
    jobs: Vec<CronJob>,
}

impl Default for CronJobFile {
    fn default() -> Self {
        Self {
            schema_version: CRON_SCHEMA_VERSION,
            jobs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// One line of the cron run log.
pub struct CronRunRecord {
    pub job_id: String,
    pub scheduled_unix_ms: u64,
    pub started_unix_ms: u64,
    pub duration_ms: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug)]
/// File-backed cron job store plus its run log.
pub struct CronStore {
    jobs_path: PathBuf,
    run_log_path: PathBuf,
    file: CronJobFile,
}

impl CronStore {
    pub fn open(jobs_path: impl AsRef<Path>, run_log_path: impl AsRef<Path>) -> Result<Self> {
        let jobs_path = jobs_path.as_ref().to_path_buf();
        let file = if jobs_path.exists() {
            let raw = std::fs::read_to_string(&jobs_path)
                .with_context(|| format!("failed to read cron jobs {}", jobs_path.display()))?;
            let parsed = serde_json::from_str::<CronJobFile>(&raw)
                .with_context(|| format!("failed to parse cron jobs {}", jobs_path.display()))?;
            if parsed.schema_version != CRON_SCHEMA_VERSION {
                bail!(
                    "unsupported cron jobs schema_version {} (expected {})",
                    parsed.schema_version,
                    CRON_SCHEMA_VERSION
                );
            }
            parsed
        } else {
            CronJobFile::default()
        };
        Ok(Self {
            jobs_path,
            run_log_path: run_log_path.as_ref().to_path_buf(),
            file,
        })
    }

    pub fn jobs(&self) -> &[CronJob] {
        &self.file.jobs
    }

    pub fn job(&self, job_id: &str) -> Option<&CronJob> {
        self.file.jobs.iter().find(|job| job.id == job_id)
    }

    pub fn upsert_job(&mut self, job: CronJob) -> Result<()> {
        validate_job(&job)?;
        match self
            .file
            .jobs
            .iter_mut()
            .find(|existing| existing.id == job.id)
        {
            Some(existing) => *existing = job,
            None => self.file.jobs.push(job),
        }
        self.save()
    }

    pub fn remove_job(&mut self, job_id: &str) -> Result<bool> {
        let before = self.file.jobs.len();
        self.file.jobs.retain(|job| job.id != job_id);
        let removed = self.file.jobs.len() != before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn mark_ran(&mut self, job_id: &str, at_unix_ms: u64) -> Result<()> {
        if let Some(job) = self
            .file
            .jobs
            .iter_mut()
            .find(|job| job.id == job_id)
        {
            job.last_run_unix_ms = Some(at_unix_ms);
        }
        self.save()
    }

    /// Jobs due at `now`, with the fire instant each was due at.
    pub fn due_jobs(&self, now_unix_ms: u64) -> Vec<(CronJob, u64)> {
        self.file
            .jobs
            .iter()
            .filter(|job| job.enabled)
            .filter_map(|job| {
                next_fire_unix_ms(job, now_unix_ms).and_then(|fire| {
                    if fire <= now_unix_ms {
                        Some((job.clone(), fire))
                    } else {
                        None
                    }
                })
            })
            .collect()
    }

    pub fn append_run_record(&self, record: &CronRunRecord) -> Result<()> {
        let line =
            serde_json::to_string(record).context("failed to serialize cron run record")?;
        append_jsonl_capped(&self.run_log_path, &line, CRON_RUN_LOG_MAX_BYTES)
    }

    /// Recent run records, newest last.
    pub fn read_run_log(&self, limit: usize) -> Result<Vec<CronRunRecord>> {
        if !self.run_log_path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.run_log_path).with_context(|| {
            format!("failed to read cron run log {}", self.run_log_path.display())
        })?;
        let mut records = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<CronRunRecord>(line).ok())
            .collect::<Vec<_>>();
        if limit > 0 && records.len() > limit {
            records = records.split_off(records.len() - limit);
        }
        Ok(records)
    }

    fn save(&self) -> Result<()> {
        write_json_atomic(&self.jobs_path, &self.file).context("failed to save cron jobs")
    }
}

fn validate_job(job: &CronJob) -> Result<()> {
    if job.id.trim().is_empty() {
        bail!("cron job id cannot be empty");
    }
    if job.name.trim().is_empty() {
        bail!("cron job name cannot be empty");
    }
    match &job.schedule {
        CronSchedule::Every { every } => {
            if parse_every_duration(every).is_none() {
                bail!("cron job '{}' has unparseable interval '{}'", job.id, every);
            }
        }
        CronSchedule::At { at_unix_ms } => {
            if *at_unix_ms == 0 {
                bail!("cron job '{}' has zero at_unix_ms", job.id);
            }
        }
        CronSchedule::Cron { expr } => {
            parse_cron_expr(expr)
                .with_context(|| format!("cron job '{}' has invalid expression", job.id))?;
        }
    }
    Ok(())
}

/// Next fire instant for a job, or `None` when it will never fire again.
pub fn next_fire_unix_ms(job: &CronJob, now_unix_ms: u64) -> Option<u64> {
    match &job.schedule {
        CronSchedule::Every { every } => {
            let interval_ms = parse_every_duration(every)?.as_millis() as u64;
            match job.last_run_unix_ms {
                Some(last) => Some(last.saturating_add(interval_ms)),
                None => Some(now_unix_ms),
            }
        }
        CronSchedule::At { at_unix_ms } => {
            if job.last_run_unix_ms.is_some() {
                None
            } else {
                Some(*at_unix_ms)
            }
        }
        CronSchedule::Cron { expr } => {
            let after = job.last_run_unix_ms.unwrap_or(0).max(
                now_unix_ms.saturating_sub(60_000),
            );
            next_cron_fire_unix_ms(expr, after)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CronField {
    Any,
    Step(u32),
    Values(Vec<u32>),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Step(step) => *step > 0 && value % step == 0,
            Self::Values(values) => values.contains(&value),
        }
    }
}

fn parse_cron_field(raw: &str, min: u32, max: u32) -> Result<CronField> {
    let raw = raw.trim();
    if raw == "*" {
        return Ok(CronField::Any);
    }
    if let Some(step) = raw.strip_prefix("*/") {
        let step = step
            .parse::<u32>()
            .with_context(|| format!("invalid step '{raw}'"))?;
        if step == 0 {
            bail!("step cannot be zero in '{raw}'");
        }
        return Ok(CronField::Step(step));
    }
    let mut values = Vec::new();
    for part in raw.split(',') {
        if let Some((start, end)) = part.split_once('-') {
            let start = start
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid range start '{part}'"))?;
            let end = end
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid range end '{part}'"))?;
            if start > end || start < min || end > max {
                bail!("range '{part}' outside {min}..={max}");
            }
            values.extend(start..=end);
        } else {
            let value = part
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid value '{part}'"))?;
            if value < min || value > max {
                bail!("value '{part}' outside {min}..={max}");
            }
            values.push(value);
        }
    }
    if values.is_empty() {
        bail!("empty cron field '{raw}'");
    }
    values.sort_unstable();
    values.dedup();
    Ok(CronField::Values(values))
}

fn parse_cron_expr(expr: &str) -> Result<CronExpr> {
    let fields = expr.split_whitespace().collect::<Vec<_>>();
    if fields.len() != 5 {
        bail!(
            "cron expression '{}' must have 5 fields, found {}",
            expr,
            fields.len()
        );
    }
    Ok(CronExpr {
        minute: parse_cron_field(fields[0], 0, 59)?,
        hour: parse_cron_field(fields[1], 0, 23)?,
        day_of_month: parse_cron_field(fields[2], 1, 31)?,
        month: parse_cron_field(fields[3], 1, 12)?,
        day_of_week: parse_cron_field(fields[4], 0, 6)?,
    })
}

/// Scans forward minute by minute for the next match, bounded at one year.
fn next_cron_fire_unix_ms(expr: &str, after_unix_ms: u64) -> Option<u64> {
    let parsed = parse_cron_expr(expr).ok()?;
    let after_secs = (after_unix_ms / 1_000) as i64;
    let mut candidate = (after_secs / 60 + 1) * 60;
    let horizon = after_secs + 366 * 24 * 3_600;

    while candidate <= horizon {
        let Some(moment) = Utc.timestamp_opt(candidate, 0).single() else {
            return None;
        };
        let weekday = moment.weekday().num_days_from_sunday();
        if parsed.minute.matches(moment.minute())
            && parsed.hour.matches(moment.hour())
            && parsed.day_of_month.matches(moment.day())
            && parsed.month.matches(moment.month())
            && parsed.day_of_week.matches(weekday)
        {
            return Some(candidate as u64 * 1_000);
        }
        candidate += 60;
    }
    None
}

/// Executes every due job once, appending run-log lines.
///
/// `wake_heartbeat` handles the `next-heartbeat` wake mode; `Now` jobs run
/// through the scheduler on the main lane.
pub async fn run_due_jobs(
    store: &mut CronStore,
    scheduler: &SessionScheduler,
    main_key: &str,
    wake_heartbeat: impl Fn(),
    now_unix_ms: u64,
) -> Result<usize> {
    let due = store.due_jobs(now_unix_ms);
    let mut executed = 0usize;

    for (job, scheduled) in due {
        let started = unix_time_ms();
        let (status, detail) = match job.wake_mode {
            CronWakeMode::NextHeartbeat => {
                wake_heartbeat();
                ("woke-heartbeat".to_string(), None)
            }
            CronWakeMode::Now => {
                let prompt = match &job.payload {
                    CronPayload::SystemPrompt { text } => {
                        format!("[Scheduled task: {}]\n{}", job.name, text)
                    }
                    CronPayload::UserMessage { text } => text.clone(),
                };
                match scheduler.run_detached(main_key, &prompt, true).await {
                    Ok((RunState::Final, _)) => ("ok".to_string(), None),
                    Ok((state, _)) => (state.as_str().to_string(), None),
                    Err(error) => ("error".to_string(), Some(format!("{error:#}"))),
                }
            }
        };

        let record = CronRunRecord {
            job_id: job.id.clone(),
            scheduled_unix_ms: scheduled,
            started_unix_ms: started,
            duration_ms: unix_time_ms().saturating_sub(started),
            status: status.clone(),
            detail,
        };
        if let Err(error) = store.append_run_record(&record) {
            warn!(target: "clawdis.cron", error = %error, "failed to append cron run record");
        }
        store.mark_ran(&job.id, now_unix_ms)?;
        debug!(
            target: "clawdis.cron",
            job_id = %job.id,
            status = %status,
            "cron job executed"
        );
        executed += 1;
    }
    Ok(executed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_job(id: &str, every: &str) -> CronJob {
        CronJob {
            id: id.to_string(),
            name: format!("job {id}"),
            schedule: CronSchedule::Every {
                every: every.to_string(),
            },
            wake_mode: CronWakeMode::Now,
            payload: CronPayload::UserMessage {
                text: "do the thing".to_string(),
            },
            enabled: true,
            last_run_unix_ms: None,
        }
    }

    #[test]
    fn unit_cron_expr_parse_rejects_bad_shapes() {
        assert!(parse_cron_expr("* * * *").is_err());
        assert!(parse_cron_expr("61 * * * *").is_err());
        assert!(parse_cron_expr("*/0 * * * *").is_err());
        parse_cron_expr("*/5 9-17 * * 1-5").expect("valid expression");
    }

    #[test]
    fn functional_next_cron_fire_matches_minute_fields() {
        // 2026-08-02 00:00:00 UTC.
        let base_ms = 1_785_542_400_000u64;
        let next = next_cron_fire_unix_ms("30 * * * *", base_ms).expect("fire");
        let offset_minutes = (next - base_ms) / 60_000;
        assert_eq!(offset_minutes, 30);

        let daily = next_cron_fire_unix_ms("0 9 * * *", base_ms).expect("fire");
        assert_eq!((daily - base_ms) / 3_600_000, 9);
    }

    #[test]
    fn unit_every_schedule_fires_immediately_then_at_interval() {
        let mut job = every_job("j1", "5m");
        let now = 1_000_000u64;
        assert_eq!(next_fire_unix_ms(&job, now), Some(now));
        job.last_run_unix_ms = Some(now);
        assert_eq!(next_fire_unix_ms(&job, now), Some(now + 300_000));
    }

    #[test]
    fn unit_at_schedule_is_one_shot() {
        let mut job = every_job("j1", "5m");
        job.schedule = CronSchedule::At { at_unix_ms: 42_000 };
        assert_eq!(next_fire_unix_ms(&job, 0), Some(42_000));
        job.last_run_unix_ms = Some(42_000);
        assert_eq!(next_fire_unix_ms(&job, 50_000), None);
    }

    #[test]
    fn integration_store_round_trips_jobs_and_run_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let jobs_path = temp.path().join("cron/jobs.json");
        let log_path = temp.path().join("cron/runs.jsonl");
        {
            let mut store = CronStore::open(&jobs_path, &log_path).expect("open");
            store.upsert_job(every_job("daily", "1h")).expect("upsert");
            store
                .append_run_record(&CronRunRecord {
                    job_id: "daily".to_string(),
                    scheduled_unix_ms: 1,
                    started_unix_ms: 2,
                    duration_ms: 3,
                    status: "ok".to_string(),
                    detail: None,
                })
                .expect("append");
        }
        let store = CronStore::open(&jobs_path, &log_path).expect("reopen");
        assert_eq!(store.jobs().len(), 1);
        let log = store.read_run_log(10).expect("log");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, "ok");
    }

    #[test]
    fn regression_upsert_rejects_unparseable_interval() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = CronStore::open(
            temp.path().join("jobs.json"),
            temp.path().join("runs.jsonl"),
        )
        .expect("open");
        let error = store
            .upsert_job(every_job("bad", "soon"))
            .expect_err("bad interval should fail");
        assert!(error.to_string().contains("unparseable interval"));
    }

    #[test]
    fn unit_due_jobs_skips_disabled_and_future() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = CronStore::open(
            temp.path().join("jobs.json"),
            temp.path().join("runs.jsonl"),
        )
        .expect("open");
        let mut disabled = every_job("off", "5m");
        disabled.enabled = false;
        store.upsert_job(disabled).expect("disabled");
        let mut future = every_job("later", "5m");
        future.schedule = CronSchedule::At {
            at_unix_ms: u64::MAX,
        };
        store.upsert_job(future).expect("future");
        store.upsert_job(every_job("due", "5m")).expect("due");

        let due = store.due_jobs(1_000_000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0.id, "due");
    }
}
