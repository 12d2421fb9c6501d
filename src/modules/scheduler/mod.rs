use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How long a running job gets to finish after shutdown is requested.
pub const JOB_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

enum Schedule {
    /// Empty timespec: the job is configured off.
    Disabled,
    /// Run once, then never again.
    Oneshot,
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    fn parse(timespec: &str) -> anyhow::Result<Schedule> {
        match timespec {
            "" => Ok(Schedule::Disabled),
            "oneshot" => Ok(Schedule::Oneshot),
            spec => Ok(Schedule::Cron(Box::new(cron::Schedule::from_str(spec)?))),
        }
    }
}

/// Cooperative in-process job scheduler. Each job spec gets a driver task;
/// each firing runs on its own task so a panicking job body cannot take the
/// schedule down with it. A spec re-arms only after the current run returns.
pub struct Scheduler {
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            cancel: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Token observed by jobs at their safe points.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn schedule<F>(&self, timespec: &str, name: &str, job: F) -> anyhow::Result<()>
    where
        F: Fn(CancellationToken) -> JobFuture + Send + Sync + 'static,
    {
        let schedule = Schedule::parse(timespec)?;
        if matches!(schedule, Schedule::Disabled) {
            debug!(job = name, "job is ignored as the timespec is empty");
            return Ok(());
        }

        let cancel = self.cancel.clone();
        let job_name = name.to_string();
        let handle = tokio::spawn(run_schedule(schedule, job_name.clone(), job, cancel));
        self.tasks.lock().await.push((job_name, handle));
        Ok(())
    }

    /// Cancels pending firings, signals running jobs and waits up to 60
    /// seconds for each of them.
    pub async fn shutdown(&self) {
        info!("shutting down scheduler");
        self.cancel.cancel();

        let mut tasks = self.tasks.lock().await;
        for (name, mut handle) in tasks.drain(..) {
            info!(job = %name, "waiting for job to finish");
            match tokio::time::timeout(JOB_SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    error!(job = %name, "job did not finish after 60 second timeout, forcing stop");
                    handle.abort();
                }
            }
        }
        info!("finished scheduler shutdown");
    }
}

async fn run_schedule<F>(schedule: Schedule, name: String, job: F, cancel: CancellationToken)
where
    F: Fn(CancellationToken) -> JobFuture + Send + Sync + 'static,
{
    match schedule {
        Schedule::Disabled => {}
        Schedule::Oneshot => {
            run_once(&name, &job, &cancel).await;
        }
        Schedule::Cron(schedule) => loop {
            let now = Utc::now();
            let Some(next) = schedule.after(&now).next() else {
                debug!(job = %name, "schedule has no future firings");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(job = %name, at = %next, "scheduling job");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            if cancel.is_cancelled() {
                break;
            }
            run_once(&name, &job, &cancel).await;
        },
    }
}

/// One firing on its own task. Errors are logged, panics are contained; the
/// next firing happens either way.
async fn run_once<F>(name: &str, job: &F, cancel: &CancellationToken)
where
    F: Fn(CancellationToken) -> JobFuture + Send + Sync + 'static,
{
    debug!(job = name, "executing job");
    let run = tokio::spawn(job(cancel.child_token()));
    match run.await {
        Ok(Ok(())) => debug!(job = name, "job finished"),
        Ok(Err(e)) => error!(job = name, error = ?e, "error executing job"),
        Err(e) => error!(job = name, error = %e, "job panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn oneshot_runs_exactly_once() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        scheduler
            .schedule("oneshot", "test", move |_| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_timespec_disables_the_job() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        scheduler
            .schedule("", "disabled", move |_| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_timespec_is_rejected() {
        let scheduler = Scheduler::new();
        let result = scheduler
            .schedule("not a crontab", "broken", |_| Box::pin(async { Ok(()) }))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn failing_job_is_rescheduled() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        // Every second, always failing.
        scheduler
            .schedule("* * * * * *", "flaky", move |_| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("boom")
                })
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        scheduler.shutdown().await;
        assert!(
            runs.load(Ordering::SeqCst) >= 2,
            "failing job was not rescheduled"
        );
    }

    #[tokio::test]
    async fn shutdown_cancels_running_jobs() {
        let scheduler = Scheduler::new();
        let observed_cancel = Arc::new(AtomicUsize::new(0));
        let counter = observed_cancel.clone();
        scheduler
            .schedule("oneshot", "long", move |cancel| {
                let counter = counter.clone();
                Box::pin(async move {
                    cancel.cancelled().await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await
            .unwrap();

        // Give the job a moment to start waiting on the token.
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown().await;
        assert_eq!(observed_cancel.load(Ordering::SeqCst), 1);
    }
}
