//! Account scheduler for periodic marketplace synchronization
//!
//! This module provides a scheduler that checks on a fixed tick which
//! accounts are due, runs their cycles concurrently, and accepts manual
//! triggers through a cloneable handle.

use crate::config::{AccountConfig, ScheduleConfig};
use crate::error::{ErrorKind, SyncError};
use crate::models::{AccountSchedule, ScheduleStatus, SyncRun, SyncRunStatus};
use crate::sync::pipeline::AccountSyncer;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Configuration for the account scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// How often due accounts are looked for
    pub tick_interval: Duration,
    /// Delay before the first check, for startup load distribution
    pub initial_delay: Duration,
    /// Longest a single account cycle may run before it is cancelled
    pub run_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&ScheduleConfig::default())
    }
}

impl From<&ScheduleConfig> for SchedulerConfig {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            tick_interval: Duration::from_secs(config.tick_interval_secs.max(1)),
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            run_timeout: config.run_timeout_secs.map(Duration::from_secs),
        }
    }
}

type ScheduleMap = Arc<RwLock<HashMap<String, AccountSchedule>>>;

/// Manual sync request
struct ManualSyncRequest {
    account_id: String,
    response: oneshot::Sender<Result<Vec<SyncRun>, SyncError>>,
}

/// Runs account cycles and keeps their schedules
#[derive(Clone)]
struct CycleRunner {
    syncer: Arc<dyn AccountSyncer>,
    schedules: ScheduleMap,
    cancel: CancellationToken,
    run_timeout: Option<Duration>,
}

impl CycleRunner {
    /// Run every operation of `account` and record the outcome
    async fn run_cycle(
        &self,
        account: AccountConfig,
        manual: bool,
    ) -> Result<Vec<SyncRun>, SyncError> {
        let cycle_cancel = self.cancel.child_token();

        // Timeout cancels the cycle
        let watchdog = self.run_timeout.map(|limit| {
            let token = cycle_cancel.clone();
            let account_id = account.id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        warn!(
                            account_id = %account_id,
                            timeout_secs = limit.as_secs(),
                            "Account cycle timed out, cancelling"
                        );
                        token.cancel();
                    }
                }
            })
        });

        // A panicking syncer must still leave a recorded outcome
        let operations = {
            let runner = self.clone();
            let account = account.clone();
            tokio::spawn(async move { runner.run_operations(&account, cycle_cancel).await })
        };
        let result = match operations.await {
            Ok(result) => result,
            Err(e) => {
                error!(account_id = %account.id, error = %e, "Account cycle aborted");
                Err(SyncError::CycleAborted(e.to_string()))
            }
        };
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        self.record_outcome(&account.id, &result, manual).await;
        result
    }

    async fn run_operations(
        &self,
        account: &AccountConfig,
        cancel: CancellationToken,
    ) -> Result<Vec<SyncRun>, SyncError> {
        let mut runs = Vec::with_capacity(account.operation_types.len());

        for operation in &account.operation_types {
            if cancel.is_cancelled() {
                debug!(account_id = %account.id, "Cycle cancelled before {}", operation);
                break;
            }

            let run = self
                .syncer
                .sync_account(account, *operation, cancel.clone())
                .await?;
            let auth_failed = run.error_kind == Some(ErrorKind::Auth);
            runs.push(run);

            if auth_failed {
                break;
            }
        }

        Ok(runs)
    }

    async fn record_outcome(
        &self,
        account_id: &str,
        result: &Result<Vec<SyncRun>, SyncError>,
        manual: bool,
    ) {
        let completed_at = Utc::now();
        let (succeeded, error_message, auth_failed) = match result {
            Ok(runs) => {
                let failed = runs.iter().find(|r| r.status == SyncRunStatus::Failed);
                (
                    failed.is_none(),
                    failed.and_then(|r| r.error_message.clone()),
                    runs.iter().any(|r| r.error_kind == Some(ErrorKind::Auth)),
                )
            }
            Err(e) => (false, Some(e.to_string()), false),
        };

        let mut schedules = self.schedules.write().await;
        let Some(schedule) = schedules.get_mut(account_id) else {
            return;
        };

        schedule.record_completion(completed_at, succeeded, error_message.clone());

        if auth_failed {
            schedule.halt(error_message.unwrap_or_else(|| "authentication failed".to_string()));
            error!(
                account_id = account_id,
                "Authentication failed, automatic sync halted until a manual run succeeds"
            );
        } else if manual && succeeded && schedule.halted {
            schedule.resume();
            info!(account_id = account_id, "Manual sync succeeded, automatic sync resumed");
        }

        if succeeded {
            info!(
                account_id = account_id,
                next_sync_at = %schedule.next_sync_at,
                "Account cycle completed"
            );
        } else {
            warn!(
                account_id = account_id,
                error = schedule.last_error.as_deref().unwrap_or_default(),
                next_sync_at = %schedule.next_sync_at,
                "Account cycle failed"
            );
        }
    }
}

/// Account scheduler
///
/// Owns one [`AccountSchedule`] per configured account and launches due
/// cycles concurrently, one task per account.
pub struct AccountScheduler {
    config: SchedulerConfig,
    accounts: HashMap<String, AccountConfig>,
    runner: CycleRunner,
}

impl AccountScheduler {
    /// Create a new scheduler
    ///
    /// # Arguments
    ///
    /// * `config` - Scheduler configuration
    /// * `syncer` - Runs one operation of one account
    /// * `accounts` - Accounts to schedule; each is due on the first tick
    pub fn new(
        config: SchedulerConfig,
        syncer: Arc<dyn AccountSyncer>,
        accounts: Vec<AccountConfig>,
    ) -> Self {
        let first_run_at = Utc::now();

        let schedules = accounts
            .iter()
            .map(|a| {
                (
                    a.id.clone(),
                    AccountSchedule::new(
                        a.id.clone(),
                        a.interval_secs,
                        a.operation_types.clone(),
                        first_run_at,
                    ),
                )
            })
            .collect();

        let runner = CycleRunner {
            syncer,
            schedules: Arc::new(RwLock::new(schedules)),
            cancel: CancellationToken::new(),
            run_timeout: config.run_timeout,
        };

        Self {
            config,
            accounts: accounts.into_iter().map(|a| (a.id.clone(), a)).collect(),
            runner,
        }
    }

    /// Start the scheduler loop in the background
    pub fn start(self) -> SchedulerHandle {
        let (manual_tx, manual_rx) = mpsc::channel(32);
        let schedules = self.runner.schedules.clone();
        let cancel = self.runner.cancel.clone();

        let task = tokio::spawn(self.run(manual_rx));

        SchedulerHandle {
            schedules,
            manual_tx,
            cancel,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(self, mut manual_rx: mpsc::Receiver<ManualSyncRequest>) {
        info!(accounts = self.accounts.len(), "Starting account scheduler");
        let cancel = self.runner.cancel.clone();

        // First check waits out the initial delay; manual requests do not
        debug!(
            delay_secs = self.config.initial_delay.as_secs(),
            "Scheduling first check"
        );
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.initial_delay,
            self.config.tick_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown signal received, stopping account scheduler");
                    break;
                }
                Some(request) = manual_rx.recv() => {
                    self.handle_manual_sync(request, &mut tasks).await;
                }
                _ = ticker.tick() => {
                    self.dispatch_due(&mut tasks).await;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Account cycle task panicked");
                    }
                }
            }
        }

        // Requests still queued will never be served
        manual_rx.close();
        while let Some(request) = manual_rx.recv().await {
            let _ = request.response.send(Err(SyncError::SchedulerStopped));
        }

        // Wait for in-flight cycles to observe the cancellation
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Account cycle task panicked");
            }
        }

        info!("Account scheduler stopped");
    }

    async fn dispatch_due(&self, tasks: &mut JoinSet<()>) {
        let now = Utc::now();
        let due: Vec<String> = {
            let mut schedules = self.runner.schedules.write().await;
            schedules
                .values_mut()
                .filter(|s| s.is_due(now))
                .map(|s| {
                    s.mark_running();
                    s.account_id.clone()
                })
                .collect()
        };

        for account_id in due {
            let Some(account) = self.accounts.get(&account_id).cloned() else {
                continue;
            };
            info!(account_id = %account_id, "Performing scheduled sync");

            let runner = self.runner.clone();
            tasks.spawn(async move {
                let _ = runner.run_cycle(account, false).await;
            });
        }
    }

    async fn handle_manual_sync(&self, request: ManualSyncRequest, tasks: &mut JoinSet<()>) {
        let Some(account) = self.accounts.get(&request.account_id).cloned() else {
            warn!(
                account_id = %request.account_id,
                "Manual sync requested for unknown account"
            );
            let _ = request
                .response
                .send(Err(SyncError::AccountNotFound(request.account_id)));
            return;
        };

        {
            let mut schedules = self.runner.schedules.write().await;
            match schedules.get_mut(&account.id) {
                Some(schedule) if schedule.status == ScheduleStatus::Running => {
                    let _ = request
                        .response
                        .send(Err(SyncError::AlreadyRunning(account.id.clone())));
                    return;
                }
                Some(schedule) => schedule.mark_running(),
                None => {
                    let _ = request
                        .response
                        .send(Err(SyncError::AccountNotFound(account.id.clone())));
                    return;
                }
            }
        }

        info!(account_id = %account.id, "Manual sync triggered");
        let runner = self.runner.clone();
        tasks.spawn(async move {
            let result = runner.run_cycle(account, true).await;
            let _ = request.response.send(result);
        });
    }
}

/// Handle for observing and driving a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    schedules: ScheduleMap,
    manual_tx: mpsc::Sender<ManualSyncRequest>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SchedulerHandle {
    /// Snapshot of every schedule, ordered by account id
    pub async fn status(&self) -> Vec<AccountSchedule> {
        let mut schedules: Vec<AccountSchedule> =
            self.schedules.read().await.values().cloned().collect();
        schedules.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        schedules
    }

    /// Run a cycle for `account_id` now and wait for its runs
    pub async fn trigger_now(&self, account_id: &str) -> Result<Vec<SyncRun>, SyncError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.manual_tx
            .send(ManualSyncRequest {
                account_id: account_id.to_string(),
                response: response_tx,
            })
            .await
            .map_err(|_| SyncError::SchedulerStopped)?;

        response_rx.await.map_err(|_| SyncError::SchedulerStopped)?
    }

    /// Whether the scheduler still accepts work
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop scheduling, cancel in-flight cycles and wait for them
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Scheduler task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountCredentials, OperationType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Mode {
        Complete,
        FailAuth,
        WaitForCancel,
        Panic,
    }

    /// Test implementation of `AccountSyncer` that counts calls per operation
    struct FakeSyncer {
        calls: AtomicU32,
        order_calls: AtomicU32,
        mode: std::sync::Mutex<Mode>,
    }

    impl FakeSyncer {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                order_calls: AtomicU32::new(0),
                mode: std::sync::Mutex::new(mode),
            })
        }

        fn set_mode(&self, mode: Mode) {
            *self.mode.lock().unwrap() = mode;
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AccountSyncer for FakeSyncer {
        async fn sync_account(
            &self,
            account: &AccountConfig,
            operation: OperationType,
            cancel: CancellationToken,
        ) -> Result<SyncRun, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if operation == OperationType::Orders {
                self.order_calls.fetch_add(1, Ordering::SeqCst);
            }

            let mode = *self.mode.lock().unwrap();
            let mut run = SyncRun::start(&account.id, operation);
            match mode {
                Mode::Complete => run.complete(),
                Mode::FailAuth => run.fail(Some(ErrorKind::Auth), "invalid token"),
                Mode::WaitForCancel => {
                    cancel.cancelled().await;
                    run.fail(None, "Sync cancelled");
                }
                Mode::Panic => panic!("syncer crashed"),
            }
            Ok(run)
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(60),
            initial_delay: Duration::ZERO,
            run_timeout: None,
        }
    }

    fn account(id: &str, interval_secs: u64) -> AccountConfig {
        AccountConfig::new(id, AccountCredentials::new("key")).with_interval(interval_secs)
    }

    // Test 1: Due accounts are synced on the first tick
    #[tokio::test(start_paused = true)]
    async fn test_initial_cycle_on_startup() {
        let syncer = FakeSyncer::new(Mode::Complete);
        let handle =
            AccountScheduler::new(config(), syncer.clone(), vec![account("acme", 3600)]).start();

        tokio::time::sleep(Duration::from_millis(100)).await;

        // One run per operation type
        assert_eq!(syncer.calls(), 2);
        assert_eq!(syncer.order_calls.load(Ordering::SeqCst), 1);

        let status = handle.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].status, ScheduleStatus::Completed);
        let last = status[0].last_sync_at.unwrap();
        assert_eq!(status[0].next_sync_at, last + chrono::Duration::seconds(3600));

        handle.stop().await;
    }

    // Test 2: Accounts are not re-run before their interval elapses
    #[tokio::test(start_paused = true)]
    async fn test_interval_respected() {
        let syncer = FakeSyncer::new(Mode::Complete);
        let accounts = vec![account("acme", 3600).with_operations([OperationType::Offers])];
        let handle = AccountScheduler::new(config(), syncer.clone(), accounts).start();

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(syncer.calls(), 1);

        handle.stop().await;
    }

    // Test 3: A zero interval account is due on every tick
    //
    // Config::validate rejects a zero interval; the account is built directly
    // so that wall-clock due checks pass under paused time.
    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_runs_every_tick() {
        let syncer = FakeSyncer::new(Mode::Complete);
        let accounts = vec![account("acme", 0).with_operations([OperationType::Offers])];
        let handle = AccountScheduler::new(config(), syncer.clone(), accounts).start();

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(syncer.calls(), 3);

        handle.stop().await;
    }

    // Test 4: Manual trigger returns the cycle's runs
    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger() {
        let syncer = FakeSyncer::new(Mode::Complete);
        let handle =
            AccountScheduler::new(config(), syncer.clone(), vec![account("acme", 3600)]).start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let runs = handle.trigger_now("acme").await.unwrap();

        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == SyncRunStatus::Completed));
        assert_eq!(syncer.calls(), 4);

        handle.stop().await;
    }

    // Test 5: Manual trigger for an unknown account
    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_unknown_account() {
        let syncer = FakeSyncer::new(Mode::Complete);
        let handle =
            AccountScheduler::new(config(), syncer, vec![account("acme", 3600)]).start();

        let result = handle.trigger_now("globex").await;
        assert!(matches!(result, Err(SyncError::AccountNotFound(id)) if id == "globex"));

        handle.stop().await;
    }

    // Test 6: Auth failure halts automatic runs until a manual run succeeds
    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_halts_schedule() {
        let syncer = FakeSyncer::new(Mode::FailAuth);
        let handle =
            AccountScheduler::new(config(), syncer.clone(), vec![account("acme", 0)]).start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Orders are skipped once offers fail authentication
        assert_eq!(syncer.calls(), 1);
        let status = handle.status().await;
        assert!(status[0].halted);
        assert_eq!(status[0].status, ScheduleStatus::Failed);

        // Halted: zero interval but no automatic runs
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(syncer.calls(), 1);

        syncer.set_mode(Mode::Complete);
        let runs = handle.trigger_now("acme").await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(!handle.status().await[0].halted);

        handle.stop().await;
    }

    // Test 7: Stop cancels in-flight cycles and waits for them
    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_in_flight() {
        let syncer = FakeSyncer::new(Mode::WaitForCancel);
        let handle =
            AccountScheduler::new(config(), syncer.clone(), vec![account("acme", 3600)]).start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.status().await[0].status, ScheduleStatus::Running);

        handle.stop().await;

        assert!(!handle.is_running());
        // The second operation never starts after cancellation
        assert_eq!(syncer.calls(), 1);
        let status = handle.status().await;
        assert_eq!(status[0].status, ScheduleStatus::Failed);
        assert_eq!(status[0].last_error.as_deref(), Some("Sync cancelled"));
    }

    // Test 8: Run timeout cancels the cycle
    #[tokio::test(start_paused = true)]
    async fn test_run_timeout() {
        let syncer = FakeSyncer::new(Mode::WaitForCancel);
        let config = SchedulerConfig {
            run_timeout: Some(Duration::from_secs(5)),
            ..config()
        };
        let handle = AccountScheduler::new(config, syncer.clone(), vec![account("acme", 3600)]).start();

        tokio::time::sleep(Duration::from_secs(6)).await;

        let status = handle.status().await;
        assert_eq!(status[0].status, ScheduleStatus::Failed);
        assert!(handle.is_running());

        handle.stop().await;
    }

    // Test 9: Manual trigger while a cycle is in flight
    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_while_running() {
        let syncer = FakeSyncer::new(Mode::WaitForCancel);
        let handle =
            AccountScheduler::new(config(), syncer, vec![account("acme", 3600)]).start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let result = handle.trigger_now("acme").await;
        assert!(matches!(result, Err(SyncError::AlreadyRunning(_))));

        handle.stop().await;
    }

    // Test 10: Trigger after stop reports a stopped scheduler
    #[tokio::test(start_paused = true)]
    async fn test_trigger_after_stop() {
        let syncer = FakeSyncer::new(Mode::Complete);
        let handle =
            AccountScheduler::new(config(), syncer, vec![account("acme", 3600)]).start();

        handle.stop().await;
        let result = handle.trigger_now("acme").await;
        assert!(matches!(result, Err(SyncError::SchedulerStopped)));
    }

    // Test 11: Initial delay postpones the first cycle
    #[tokio::test(start_paused = true)]
    async fn test_initial_delay() {
        let syncer = FakeSyncer::new(Mode::Complete);
        let config = SchedulerConfig {
            initial_delay: Duration::from_secs(30),
            ..config()
        };
        let handle = AccountScheduler::new(config, syncer.clone(), vec![account("acme", 3600)]).start();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(syncer.calls(), 0);

        handle.stop().await;
    }

    // Test 12: Config conversion
    #[test]
    fn test_scheduler_config_from_schedule_config() {
        let config = SchedulerConfig::from(&ScheduleConfig {
            tick_interval_secs: 0,
            initial_delay_secs: 5,
            run_timeout_secs: None,
        });

        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.initial_delay, Duration::from_secs(5));
        assert_eq!(config.run_timeout, None);
        assert_eq!(SchedulerConfig::default().tick_interval, Duration::from_secs(60));
    }

    // Test 13: Manual trigger is served during the initial delay
    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_during_initial_delay() {
        let syncer = FakeSyncer::new(Mode::Complete);
        let config = SchedulerConfig {
            initial_delay: Duration::from_secs(600),
            ..config()
        };
        let handle = AccountScheduler::new(config, syncer.clone(), vec![account("acme", 3600)]).start();

        let runs = tokio::time::timeout(Duration::from_secs(5), handle.trigger_now("acme"))
            .await
            .unwrap()
            .unwrap();
        assert!(!runs.is_empty());

        handle.stop().await;
    }

    // Test 14: A panicking cycle is recorded as failed and rescheduled
    #[tokio::test(start_paused = true)]
    async fn test_panicking_cycle_is_rescheduled() {
        let syncer = FakeSyncer::new(Mode::Panic);
        let accounts = vec![account("acme", 0).with_operations([OperationType::Offers])];
        let handle = AccountScheduler::new(config(), syncer.clone(), accounts).start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = handle.status().await;
        assert_eq!(status[0].status, ScheduleStatus::Failed);
        assert!(status[0].last_sync_at.is_some());
        assert!(status[0]
            .last_error
            .as_deref()
            .unwrap()
            .starts_with("Sync cycle aborted"));

        // Later ticks still pick the account up
        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(syncer.calls(), 3);

        // Manual triggers report the failure instead of hanging
        let result = handle.trigger_now("acme").await;
        assert!(matches!(result, Err(SyncError::CycleAborted(_))));

        handle.stop().await;
    }
}
