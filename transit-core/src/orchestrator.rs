//! Run orchestration
//!
//! `TrackingRun` owns the listener and poller tasks of one correlation run.
//! `TransferTest` drives a full end-to-end test on top of it: generate files,
//! start tracking, upload, request replicas and wait for the report.

use crate::config::TransferConfig;
use crate::context::RunContext;
use crate::control::{ControlPlane, UploadItem};
use crate::handler::CorrelationHandler;
use crate::listener::{Listener, ListenerStats};
use crate::poller::CompletionPoller;
use crate::RunError;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use transit_broker::{ConnectError, Connector};
use transit_tracker::{EntityId, RunOutcome, RunReport, WatchSet};
use uuid::Uuid;

/// Listener and poller tasks of one correlation run
pub struct TrackingRun {
    ctx: RunContext,
    listener: JoinHandle<Result<ListenerStats, RunError>>,
    poller: JoinHandle<RunOutcome>,
}

impl TrackingRun {
    /// Register `watch` and spawn the listener and poller
    pub fn start<C>(
        mut listener: Listener<C>,
        watch: &WatchSet,
        poller: CompletionPoller,
        ctx: RunContext,
    ) -> Result<Self, RunError>
    where
        C: Connector + 'static,
        C::Session: 'static,
    {
        if watch.is_empty() {
            return Err(RunError::EmptyWatchSet);
        }
        let registered = ctx.engine().track(watch);
        info!(
            registered,
            interval_secs = poller.interval().as_secs(),
            deadline_secs = poller.deadline().as_secs(),
            "Tracking transfers"
        );

        let listen = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let mut handler = CorrelationHandler::new(ctx.engine().clone());
                let result = listener.run(&mut handler, &ctx).await;
                let stats = handler.stats();
                debug!(
                    applied = stats.applied,
                    ignored = stats.ignored,
                    malformed = stats.malformed,
                    "Correlation handler finished"
                );
                result
            })
        };
        let listener_task = {
            let ctx = ctx.clone();
            tokio::spawn(supervise_listener(listen, ctx))
        };

        let poller_task = {
            let ctx = ctx.clone();
            tokio::spawn(async move { poller.run(ctx.engine(), ctx.shutdown()).await })
        };

        Ok(Self {
            ctx,
            listener: listener_task,
            poller: poller_task,
        })
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Wait until the listener holds its subscription
    ///
    /// Returns false when the run stopped first; `finish` then reports why.
    pub async fn wait_subscribed(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.ctx.subscribed() => true,
            _ = self.ctx.shutdown().triggered() => false,
        }
    }

    /// Wait for the poller's verdict, stop the listener and build the report
    ///
    /// When a task failed the report is still built and returned inside
    /// `RunError::Aborted`.
    pub async fn finish(self) -> Result<RunReport, RunError> {
        let outcome = match self.poller.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Completion poller failed");
                self.ctx.shutdown().trigger();
                RunOutcome::Interrupted
            }
        };
        let listened = self
            .listener
            .await
            .unwrap_or_else(|e| Err(RunError::Task(format!("listener: {e}"))));
        let report = self.ctx.engine().report(outcome);

        match listened {
            Ok(stats) => {
                info!(
                    outcome = %outcome,
                    received = stats.received,
                    acked = stats.acked,
                    "Run finished"
                );
                Ok(report)
            }
            Err(error) => Err(RunError::Aborted {
                error: Box::new(error),
                report: Box::new(report),
            }),
        }
    }

    /// Stop the run early and collect what was observed
    pub async fn interrupt(self) -> Result<RunReport, RunError> {
        self.ctx.shutdown().trigger();
        self.finish().await
    }
}

/// Await the listener task and stop the run if it fails or panics
async fn supervise_listener(
    task: JoinHandle<Result<ListenerStats, ConnectError>>,
    ctx: RunContext,
) -> Result<ListenerStats, RunError> {
    let result = match task.await {
        Ok(result) => result.map_err(RunError::from),
        Err(e) => Err(RunError::Task(format!("listener: {e}"))),
    };
    if let Err(e) = &result {
        error!(error = %e, "Listener failed");
        ctx.shutdown().trigger();
    }
    result
}

/// Write `count` files of `size` bytes named by fresh UUIDs
///
/// Each file repeats the bytes of its own UUID, so no two files share content.
pub async fn generate_files(dir: &Path, count: usize, size: usize) -> Result<Vec<PathBuf>, RunError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| RunError::Io(dir.to_path_buf(), e))?;

    let mut paths = Vec::with_capacity(count);
    for _ in 0..count {
        let id = Uuid::new_v4();
        let content: Vec<u8> = id.as_bytes().iter().copied().cycle().take(size).collect();
        let path = dir.join(id.to_string());
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| RunError::Io(path.clone(), e))?;
        paths.push(path);
    }
    debug!(dir = %dir.display(), count, size, "Generated test files");
    Ok(paths)
}

/// End-to-end transfer test against a control plane
pub struct TransferTest<P: ControlPlane> {
    config: TransferConfig,
    control: P,
}

impl<P: ControlPlane> TransferTest<P> {
    pub fn new(config: TransferConfig, control: P) -> Self {
        Self { config, control }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn control(&self) -> &P {
        &self.control
    }

    pub async fn run<C>(
        &self,
        listener: Listener<C>,
        poller: CompletionPoller,
        ctx: RunContext,
    ) -> Result<RunReport, RunError>
    where
        C: Connector + 'static,
        C::Session: 'static,
    {
        self.config.validate()?;

        let dir = self.config.data_dir();
        let paths = generate_files(&dir, self.config.files, self.config.file_size).await?;
        let names: Vec<String> = paths
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        let watch = WatchSet::product(&self.config.scope, &names, &self.config.destinations);

        let run = TrackingRun::start(listener, &watch, poller, ctx)?;
        if !run.wait_subscribed().await {
            return run.finish().await;
        }

        if let Err(e) = self.submit(&paths, &names).await {
            error!(error = %e, "Transfer submission failed");
            if let Err(run_error) = run.interrupt().await {
                warn!(error = %run_error, "Run ended with an error after failed submission");
            }
            return Err(e);
        }

        run.finish().await
    }

    /// Upload the files, group them in a dataset and request one rule per destination
    async fn submit(&self, paths: &[PathBuf], names: &[String]) -> Result<(), RunError> {
        let config = &self.config;
        for path in paths {
            let item = UploadItem {
                path: path.clone(),
                rse: config.source.clone(),
                scope: config.scope.clone(),
                lifetime_secs: config.lifetime_secs,
                transfer_timeout_secs: config.upload_timeout_secs,
            };
            self.control.upload(&item).await?;
        }

        let files: Vec<EntityId> = names
            .iter()
            .map(|name| EntityId::new(&config.scope, name))
            .collect();
        let dataset_name = format!("dataset-{}", Uuid::new_v4());
        let dataset = self
            .control
            .create_dataset(&config.scope, &dataset_name, &files, config.lifetime_secs)
            .await?;

        for destination in &config.destinations {
            let rule = self
                .control
                .add_rule(&dataset, destination, config.copies, config.lifetime_secs)
                .await?;
            info!(dataset = %dataset, destination = %destination, rule_id = %rule, "Added replication rule");
        }
        Ok(())
    }
}
