//! Backup job scheduler: one 30 s tick, standard 5-field cron parsing,
//! single-flight per-job execution, and partial-failure aggregation for
//! hierarchy-mode jobs.

use crate::error::{Error, Result};
use crate::zfs::ZfsGateway;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};

const TICK_INTERVAL: Duration = Duration::from_secs(30);
const MAX_CRON_LOOKAHEAD_MINUTES: i64 = 4 * 366 * 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Dataset,
    Jails,
    Vm,
}

#[derive(Debug, Clone)]
pub struct BackupJob {
    pub id: u64,
    pub enabled: bool,
    pub cron_expr: String,
    /// Empty means "only the cluster leader runs this job".
    pub runner_node_id: Option<String>,
    pub kind: JobKind,
    pub source_dataset: String,
    pub destination_dataset: String,
    pub next_run_at: Option<i64>,
}

/// Persistence seam for job rows; the SQL store itself is an external
/// collaborator.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn load_enabled_jobs(&self) -> Result<Vec<BackupJob>>;
    async fn update_next_run_at(&self, job_id: u64, next_run_at: Option<i64>) -> Result<()>;
    async fn record_result(
        &self,
        job_id: u64,
        status: &str,
        error: Option<String>,
        next_run_at: Option<i64>,
    ) -> Result<()>;
}

/// Dataset replication itself is delegated — the scheduler only knows
/// how to pick jobs and run them, not how a push reaches its peer.
#[async_trait::async_trait]
pub trait Replicator: Send + Sync {
    async fn replicate_dataset(
        &self,
        source_dataset: &str,
        destination_dataset: &str,
        fresh_snapshot_name: &str,
    ) -> Result<()>;
}

/// Reads `isLeader()`/`localNodeId()` from the consensus layer. The
/// scheduler never serializes through it, only consults it per tick.
pub trait ClusterInfo: Send + Sync {
    fn is_leader(&self) -> bool;
    fn local_node_id(&self) -> String;
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    replicator: Arc<dyn Replicator>,
    cluster: Arc<dyn ClusterInfo>,
    zfs: Arc<ZfsGateway>,
    running: Mutex<HashSet<u64>>,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        replicator: Arc<dyn Replicator>,
        cluster: Arc<dyn ClusterInfo>,
        zfs: Arc<ZfsGateway>,
    ) -> Self {
        Self::with_tick_interval(store, replicator, cluster, zfs, TICK_INTERVAL)
    }

    /// Same as `new`, but with an explicit tick period instead of the
    /// default 30 s, for callers that read it from `NodeConfig`.
    pub fn with_tick_interval(
        store: Arc<dyn JobStore>,
        replicator: Arc<dyn Replicator>,
        cluster: Arc<dyn ClusterInfo>,
        zfs: Arc<ZfsGateway>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            store,
            replicator,
            cluster,
            zfs,
            running: Mutex::new(HashSet::new()),
            tick_interval,
        }
    }

    /// Runs the tick loop until cancelled. Intended to be spawned as an
    /// independent task.
    pub async fn run(self: Arc<Self>, now: impl Fn() -> i64 + Send + Sync + 'static) {
        let mut ticker = interval(self.tick_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = tick(&self, now()).await {
                eprintln!("scheduler: tick failed: {e}");
            }
        }
    }
}

async fn tick(scheduler: &Arc<Scheduler>, now: i64) -> Result<()> {
    let jobs = scheduler.store.load_enabled_jobs().await?;
    let local_node = scheduler.cluster.local_node_id();
    let is_leader = scheduler.cluster.is_leader();

    for job in jobs {
        let runs_here = match &job.runner_node_id {
            Some(id) if !id.is_empty() => *id == local_node,
            _ => is_leader,
        };
        if !runs_here {
            continue;
        }

        let cron = match CronExpr::parse(&job.cron_expr) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("scheduler: job {} has invalid cron: {e}", job.id);
                continue;
            }
        };

        match job.next_run_at {
            None => {
                let next = cron.next_after(now);
                scheduler.store.update_next_run_at(job.id, next).await?;
            }
            Some(at) if now < at => {}
            Some(_) => {
                let next = cron.next_after(now);
                scheduler.store.update_next_run_at(job.id, next).await?;
                spawn_run(scheduler.clone(), job, next, now);
            }
        }
    }
    Ok(())
}

/// Single-flight: a job already running is recorded as
/// `backup_job_already_running` and the attempt returns without
/// touching the replicator.
fn spawn_run(scheduler: Arc<Scheduler>, job: BackupJob, next_run_at: Option<i64>, now: i64) {
    tokio::spawn(async move {
        {
            let mut running = scheduler.running.lock().await;
            if !running.insert(job.id) {
                drop(running);
                if let Err(e) = scheduler
                    .store
                    .record_result(
                        job.id,
                        "error",
                        Some(Error::BackupJobAlreadyRunning.to_string()),
                        next_run_at,
                    )
                    .await
                {
                    eprintln!("scheduler: failed to record skip for job {}: {e}", job.id);
                }
                return;
            }
        }

        let result = run_job(&scheduler.replicator, &scheduler.zfs, &job, now).await;
        scheduler.running.lock().await.remove(&job.id);

        let (status, error) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };
        if let Err(e) = scheduler
            .store
            .record_result(job.id, status, error, next_run_at)
            .await
        {
            eprintln!("scheduler: failed to record result for job {}: {e}", job.id);
        }
    });
}

async fn run_job(
    replicator: &Arc<dyn Replicator>,
    zfs: &Arc<ZfsGateway>,
    job: &BackupJob,
    now: i64,
) -> Result<()> {
    let snapshot_name = format!("backup-{}", format_backup_timestamp(now));

    match job.kind {
        JobKind::Dataset => {
            replicator
                .replicate_dataset(&job.source_dataset, &job.destination_dataset, &snapshot_name)
                .await
        }
        JobKind::Jails | JobKind::Vm => {
            let children = zfs.list_datasets(&format!("{}/", job.source_dataset))?;
            if children.is_empty() {
                return replicator
                    .replicate_dataset(
                        &job.source_dataset,
                        &job.destination_dataset,
                        &snapshot_name,
                    )
                    .await;
            }

            let mut failures = Vec::new();
            for child in &children {
                let Some(suffix) = child.name.strip_prefix(&format!("{}/", job.source_dataset))
                else {
                    continue;
                };
                let destination = format!("{}/{}", job.destination_dataset, suffix);
                if let Err(e) = replicator
                    .replicate_dataset(&child.name, &destination, &snapshot_name)
                    .await
                {
                    failures.push(format!("{}: {e}", child.name));
                }
            }
            if failures.is_empty() {
                Ok(())
            } else if failures.len() == children.len() {
                Err(Error::AllFailed {
                    op: "backup".to_string(),
                    details: failures.join("; "),
                })
            } else {
                Err(Error::PartialFailure {
                    op: "backup".to_string(),
                    details: failures.join("; "),
                })
            }
        }
    }
}

fn format_backup_timestamp(unix_seconds: i64) -> String {
    let dt = Utc
        .timestamp_opt(unix_seconds, 0)
        .single()
        .unwrap_or_else(Utc::now);
    dt.format("%Y-%m-%d-%H-%M-%S").to_string()
}

/// Standard 5-field `minute hour day-of-month month day-of-week` cron
/// expression. Supports `*`, `N`, `N-M`, `N,M,...`, and `*/N`.
#[derive(Debug, Clone)]
pub struct CronExpr {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::InvalidCronExpr(expr.to_string()));
        }
        let minutes = parse_field(fields[0], 0, 59, expr)?;
        let hours = parse_field(fields[1], 0, 23, expr)?;
        let days_of_month = parse_field(fields[2], 1, 31, expr)?;
        let months = parse_field(fields[3], 1, 12, expr)?;
        let days_of_week = parse_field(fields[4], 0, 6, expr)?;
        Ok(Self {
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
        })
    }

    /// Next occurrence strictly after `after` (unix seconds), or `None`
    /// if nothing matches within four years.
    pub fn next_after(&self, after: i64) -> Option<i64> {
        let start = Utc.timestamp_opt(after, 0).single()?;
        let mut candidate = (start + ChronoDuration::minutes(1))
            .with_second(0)
            .and_then(|d| d.with_nanosecond(0))?;

        for _ in 0..MAX_CRON_LOOKAHEAD_MINUTES {
            if self.matches(&candidate) {
                return Some(candidate.timestamp());
            }
            candidate += ChronoDuration::minutes(1);
        }
        None
    }

    fn matches(&self, dt: &DateTime<Utc>) -> bool {
        if !self.minutes.contains(&dt.minute()) {
            return false;
        }
        if !self.hours.contains(&dt.hour()) {
            return false;
        }
        if !self.months.contains(&dt.month()) {
            return false;
        }
        let dom_match = self.days_of_month.contains(&dt.day());
        let dow = dt.weekday().num_days_from_sunday();
        let dow_match = self.days_of_week.contains(&dow);

        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_match || dow_match,
            (true, false) => dom_match,
            (false, true) => dow_match,
            (false, false) => true,
        }
    }
}

fn parse_field(field: &str, min: u32, max: u32, whole_expr: &str) -> Result<Vec<u32>> {
    if field == "*" {
        return Ok((min..=max).collect());
    }

    if let Some(step_str) = field.strip_prefix("*/") {
        let step: u32 = step_str
            .parse()
            .map_err(|_| Error::InvalidCronExpr(whole_expr.to_string()))?;
        if step == 0 {
            return Err(Error::InvalidCronExpr(whole_expr.to_string()));
        }
        return Ok((min..=max).step_by(step as usize).collect());
    }

    let mut values = Vec::new();
    for part in field.split(',') {
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| Error::InvalidCronExpr(whole_expr.to_string()))?;
            let hi: u32 = hi.parse().map_err(|_| Error::InvalidCronExpr(whole_expr.to_string()))?;
            if lo > hi || lo < min || hi > max {
                return Err(Error::InvalidCronExpr(whole_expr.to_string()));
            }
            values.extend(lo..=hi);
        } else {
            let v: u32 = part.parse().map_err(|_| Error::InvalidCronExpr(whole_expr.to_string()))?;
            if v < min || v > max {
                return Err(Error::InvalidCronExpr(whole_expr.to_string()));
            }
            values.push(v);
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_minute_matches_anything() {
        let cron = CronExpr::parse("* * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 10, 30, 0).unwrap().timestamp();
        let next = cron.next_after(now).unwrap();
        assert_eq!(next, now + 60);
    }

    #[test]
    fn daily_at_hour_rolls_to_next_day() {
        let cron = CronExpr::parse("0 3 * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 10, 0, 0).unwrap().timestamp();
        let next = cron.next_after(now).unwrap();
        let next_dt = Utc.timestamp_opt(next, 0).single().unwrap();
        assert_eq!(next_dt.day(), 29);
        assert_eq!(next_dt.hour(), 3);
        assert_eq!(next_dt.minute(), 0);
    }

    #[test]
    fn step_field_every_fifteen_minutes() {
        let cron = CronExpr::parse("*/15 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 10, 2, 0).unwrap().timestamp();
        let next_dt = Utc.timestamp_opt(cron.next_after(now).unwrap(), 0).single().unwrap();
        assert_eq!(next_dt.minute(), 15);
    }

    #[test]
    fn invalid_expression_is_rejected() {
        assert!(CronExpr::parse("not a cron").is_err());
        assert!(CronExpr::parse("60 * * * *").is_err());
    }

    #[test]
    fn dom_or_dow_when_both_restricted() {
        // 15th of the month OR Monday, at midnight.
        let cron = CronExpr::parse("0 0 15 * 1").unwrap();
        let not_matching = Utc.with_ymd_and_hms(2026, 7, 10, 0, 0, 0).unwrap();
        let matching_dom = Utc.with_ymd_and_hms(2026, 7, 15, 0, 0, 0).unwrap();
        assert!(!cron.matches(&not_matching));
        assert!(cron.matches(&matching_dom));
    }
}
