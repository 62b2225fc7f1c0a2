//! Build-if-absent cache of fast-start remuxes.
//!
//! Each target path moves through `Building -> Optimized` or
//! `Building -> Failed`. Existence on disk is the only record of `Optimized`;
//! the in-memory registry only tracks builds that are running or that failed
//! recently. The first caller for a target registers a watch channel and
//! spawns the build; every concurrent caller clones the receiver and waits on
//! the same outcome.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    error::{MediaError, MediaResult},
    naming::{is_optimized_name, is_video_file, optimized_path},
    tools::{Remuxer, check_output},
};

/// Terminal result of one build, observed by every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
}

/// Which file a playback request should be answered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Playable {
    /// Already optimized (or asked for by its optimized name); serve it.
    Ready(PathBuf),
    /// Optimized by the build this request waited on; redirect to it.
    Built(PathBuf),
    /// A recent build failed; serve the raw source as-is.
    Unoptimized(PathBuf),
}

enum TargetState {
    Building(watch::Receiver<Option<BuildOutcome>>),
    Failed { at: Instant },
}

enum Claim {
    Ready,
    Wait(watch::Receiver<Option<BuildOutcome>>),
    CoolingDown,
}

#[derive(Clone)]
pub struct DerivativeCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    remuxer: Arc<dyn Remuxer>,
    targets: Mutex<HashMap<PathBuf, TargetState>>,
    timeout: Duration,
    retry_after: Duration,
}

impl DerivativeCache {
    /// `timeout` bounds a single remux; `retry_after` is how long a failed
    /// target keeps being served unoptimized before a request may rebuild it.
    pub fn new(remuxer: Arc<dyn Remuxer>, timeout: Duration, retry_after: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                remuxer,
                targets: Mutex::new(HashMap::new()),
                timeout,
                retry_after,
            }),
        }
    }

    /// Resolves `source` to a servable file, building its optimized variant
    /// first if needed. Builds run on their own task, so a caller going away
    /// does not cancel them.
    pub async fn ensure_playable(&self, source: &Path) -> MediaResult<Playable> {
        let name = source
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| is_video_file(name))
            .ok_or_else(|| MediaError::NotFound(source.display().to_string()))?;

        if is_optimized_name(name) {
            return if tokio::fs::metadata(source).await.is_ok_and(|m| m.is_file()) {
                Ok(Playable::Ready(source.to_path_buf()))
            } else {
                Err(MediaError::NotFound(name.to_owned()))
            };
        }

        let target = optimized_path(source)
            .ok_or_else(|| MediaError::NotFound(name.to_owned()))?;

        let source_exists = tokio::fs::metadata(source).await.is_ok_and(|m| m.is_file());
        let mut receiver = match self.claim(source, source_exists, &target)? {
            Claim::Ready => return Ok(Playable::Ready(target)),
            Claim::CoolingDown => return Ok(Playable::Unoptimized(source.to_path_buf())),
            Claim::Wait(receiver) => receiver,
        };

        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        }
        .unwrap_or_else(|| BuildOutcome::Failed("build task ended without a result".into()));

        let target_name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match outcome {
            BuildOutcome::Succeeded => Ok(Playable::Built(target)),
            BuildOutcome::Failed(reason) => Err(MediaError::BuildFailed {
                target: target_name,
                reason,
            }),
            BuildOutcome::TimedOut => Err(MediaError::BuildTimedOut {
                target: target_name,
            }),
        }
    }

    /// Number of targets with a build currently running.
    pub fn building(&self) -> usize {
        self.inner
            .targets
            .lock()
            .values()
            .filter(|state| matches!(state, TargetState::Building(_)))
            .count()
    }

    /// Atomic check-and-register for `target`. Expired failures are pruned
    /// here.
    fn claim(&self, source: &Path, source_exists: bool, target: &Path) -> MediaResult<Claim> {
        let mut targets = self.inner.targets.lock();
        let retry_after = self.inner.retry_after;
        targets.retain(|_, state| match state {
            TargetState::Failed { at } => at.elapsed() < retry_after,
            TargetState::Building(_) => true,
        });
        // The one stat taken under the lock: a finished build renames its
        // output before it leaves the registry.
        if target.is_file() {
            return Ok(Claim::Ready);
        }

        match targets.get(target) {
            // A closed channel means the build task died without reporting.
            Some(TargetState::Building(receiver)) if receiver.has_changed().is_ok() => {
                debug!(path = %target.display(), "joining running build");
                return Ok(Claim::Wait(receiver.clone()));
            }
            Some(TargetState::Failed { .. }) => {
                return if source_exists {
                    Ok(Claim::CoolingDown)
                } else {
                    Err(MediaError::NotFound(source.display().to_string()))
                };
            }
            _ => {}
        }

        if !source_exists {
            return Err(MediaError::NotFound(source.display().to_string()));
        }

        let (sender, receiver) = watch::channel(None);
        targets.insert(target.to_path_buf(), TargetState::Building(receiver.clone()));
        tokio::spawn(run_build(
            self.inner.clone(),
            source.to_path_buf(),
            target.to_path_buf(),
            sender,
        ));
        Ok(Claim::Wait(receiver))
    }
}

async fn run_build(
    inner: Arc<CacheInner>,
    source: PathBuf,
    target: PathBuf,
    sender: watch::Sender<Option<BuildOutcome>>,
) {
    info!(source = %source.display(), path = %target.display(), "optimizing video");
    let started = Instant::now();
    let outcome = build(&inner, &source, &target).await;

    match &outcome {
        BuildOutcome::Succeeded => info!(
            path = %target.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "video optimized"
        ),
        BuildOutcome::Failed(reason) => {
            warn!(path = %target.display(), %reason, "video optimization failed")
        }
        BuildOutcome::TimedOut => warn!(
            path = %target.display(),
            timeout_secs = inner.timeout.as_secs(),
            "video optimization timed out"
        ),
    }

    {
        let mut targets = inner.targets.lock();
        if outcome == BuildOutcome::Succeeded {
            targets.remove(&target);
        } else {
            targets.insert(target, TargetState::Failed { at: Instant::now() });
        }
    }
    sender.send_replace(Some(outcome));
}

/// Remuxes into a temporary sibling of `target` and renames it into place.
/// The temporary file is deleted on every path that does not persist it.
async fn build(inner: &CacheInner, source: &Path, target: &Path) -> BuildOutcome {
    let Some(dir) = target.parent() else {
        return BuildOutcome::Failed("target has no parent directory".into());
    };
    let prefix = format!(
        ".{}-",
        target.file_stem().and_then(|s| s.to_str()).unwrap_or("build")
    );
    let partial = match tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".partial")
        .tempfile_in(dir)
    {
        Ok(file) => file.into_temp_path(),
        Err(err) => return BuildOutcome::Failed(format!("cannot create temporary output: {err}")),
    };

    let remux = inner.remuxer.remux(source, &partial);
    match tokio::time::timeout(inner.timeout, remux).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return BuildOutcome::Failed(err.to_string()),
        Err(_) => return BuildOutcome::TimedOut,
    }
    if let Err(err) = check_output(&partial).await {
        return BuildOutcome::Failed(err.to_string());
    }

    if let Ok(metadata) = tokio::fs::metadata(source).await
        && let Err(err) = tokio::fs::set_permissions(&partial, metadata.permissions()).await
    {
        debug!(%err, "keeping default permissions on optimized output");
    }
    match partial.persist(target) {
        Ok(()) => BuildOutcome::Succeeded,
        Err(err) => BuildOutcome::Failed(format!("cannot move output into place: {}", err.error)),
    }
}
