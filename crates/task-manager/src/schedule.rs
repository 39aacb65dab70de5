//! Timetable for the task manager
//!
//! Jobs fire either on a fixed interval or on a cron expression (UTC, with a
//! leading seconds field), and are driven by a `tokio-cron-scheduler`
//! [`JobScheduler`].

use crate::TaskManager;
use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler, JobSchedulerError};
use tracing::debug;

/// The task manager's jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    RefreshTargets,
    Dispatch,
    RefreshTrends,
}

/// When a job fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Every interval, counted from the scheduler start
    Every(Duration),
    /// `sec min hour day-of-month month day-of-week`, UTC
    Cron(String),
}

/// Triggers of every job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timetable {
    pub refresh_targets: Trigger,
    pub dispatch: Trigger,
    pub refresh_trends: Trigger,
}

impl Default for Timetable {
    fn default() -> Self {
        Self {
            refresh_targets: Trigger::Every(Duration::from_secs(30 * 60)),
            dispatch: Trigger::Cron("0 1 0,8,16 * * *".to_string()),
            refresh_trends: Trigger::Cron("0 0 1,9,17 * * *".to_string()),
        }
    }
}

impl Timetable {
    #[must_use]
    pub fn jobs(&self) -> [(Job, &Trigger); 3] {
        [
            (Job::RefreshTargets, &self.refresh_targets),
            (Job::Dispatch, &self.dispatch),
            (Job::RefreshTrends, &self.refresh_trends),
        ]
    }
}

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn fire(job: Job, manager: Arc<Mutex<TaskManager>>) -> JobFuture {
    Box::pin(async move {
        debug!("Job {:?} fired", job);
        manager.lock().await.run_job(job, Utc::now()).await;
    })
}

fn cron_job(
    job: Job,
    trigger: &Trigger,
    manager: Arc<Mutex<TaskManager>>,
) -> Result<CronJob, JobSchedulerError> {
    match trigger {
        Trigger::Every(interval) => {
            CronJob::new_repeated_async(*interval, move |_, _| fire(job, Arc::clone(&manager)))
        }
        Trigger::Cron(expression) => {
            CronJob::new_async(expression.as_str(), move |_, _| fire(job, Arc::clone(&manager)))
        }
    }
}

/// Register every job of `timetable` on a new, not yet started, scheduler
///
/// Jobs share `manager`; a job waits while another one runs.
///
/// # Errors
///
/// Returns an error if the scheduler cannot be created or a cron expression
/// does not parse.
pub async fn build_scheduler(
    timetable: &Timetable,
    manager: Arc<Mutex<TaskManager>>,
) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;
    for (job, trigger) in timetable.jobs() {
        scheduler
            .add(cron_job(job, trigger, Arc::clone(&manager))?)
            .await?;
        debug!("Scheduled {:?} on {:?}", job, trigger);
    }
    Ok(scheduler)
}
