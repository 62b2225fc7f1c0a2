//! Fire-and-forget preview generation.
//!
//! [`ThumbnailGenerator::ensure`] never waits for the capture: it either sees
//! the JPEG on disk, sees a capture for the same target already running, or
//! registers the target and spawns one. The registry check and insert happen
//! under one lock so concurrent listings launch a single job per target.
//!
//! A capture writes into a hidden temporary sibling of the target and only
//! renames it into place once the tool succeeded and left a non-empty image,
//! so the public name never points at a half-written file. A failed target is
//! left alone for `retry_after` before another capture is attempted.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::ToolError,
    tools::{ThumbnailJob, Thumbnailer, check_output},
};

/// Seek position of the captured frame.
pub const CAPTURE_OFFSET: Duration = Duration::from_secs(10);
/// Width of the captured frame in pixels.
pub const CAPTURE_WIDTH: u32 = 320;

/// What [`ThumbnailGenerator::ensure`] found for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbnailState {
    Present,
    InProgress,
    /// The last capture failed recently; nothing was launched.
    CoolingDown,
    Launched,
}

enum CaptureState {
    Running,
    Failed { at: Instant },
}

#[derive(Clone)]
pub struct ThumbnailGenerator {
    inner: Arc<GeneratorInner>,
}

struct GeneratorInner {
    thumbnailer: Arc<dyn Thumbnailer>,
    targets: Mutex<HashMap<PathBuf, CaptureState>>,
    timeout: Duration,
    retry_after: Duration,
}

/// Records how the capture task ended, including when it panicked.
struct CaptureGuard {
    inner: Arc<GeneratorInner>,
    target: PathBuf,
    failed: bool,
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        let mut targets = self.inner.targets.lock();
        if self.failed {
            let failed = CaptureState::Failed { at: Instant::now() };
            targets.insert(self.target.clone(), failed);
        } else {
            targets.remove(&self.target);
        }
    }
}

impl ThumbnailGenerator {
    /// `timeout` bounds a single capture; `retry_after` is how long a failed
    /// target is skipped before another capture is launched.
    pub fn new(
        thumbnailer: Arc<dyn Thumbnailer>,
        timeout: Duration,
        retry_after: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(GeneratorInner {
                thumbnailer,
                targets: Mutex::new(HashMap::new()),
                timeout,
                retry_after,
            }),
        }
    }

    /// Makes sure `dest_dir/file_name` will exist. Must be called from within a
    /// Tokio runtime; returns without waiting for the capture.
    pub fn ensure(&self, source: &Path, dest_dir: &Path, file_name: &str) -> ThumbnailState {
        let target = dest_dir.join(file_name);
        {
            let mut targets = self.inner.targets.lock();
            let retry_after = self.inner.retry_after;
            targets.retain(|_, state| match state {
                CaptureState::Failed { at } => at.elapsed() < retry_after,
                CaptureState::Running => true,
            });
            match targets.get(&target) {
                Some(CaptureState::Running) => return ThumbnailState::InProgress,
                Some(CaptureState::Failed { .. }) => return ThumbnailState::CoolingDown,
                None => {}
            }
            // Checked under the lock: a finished job renames its file into
            // place before it drops its marker.
            if target.is_file() {
                return ThumbnailState::Present;
            }
            targets.insert(target.clone(), CaptureState::Running);
        }

        let job = ThumbnailJob {
            input: source.to_path_buf(),
            offset: CAPTURE_OFFSET,
            width: CAPTURE_WIDTH,
        };
        let guard = CaptureGuard {
            inner: self.inner.clone(),
            target,
            failed: false,
        };
        tokio::spawn(run_capture(guard, job));
        ThumbnailState::Launched
    }

    /// Number of captures currently running.
    pub fn in_flight(&self) -> usize {
        self.inner
            .targets
            .lock()
            .values()
            .filter(|state| matches!(state, CaptureState::Running))
            .count()
    }
}

async fn run_capture(mut guard: CaptureGuard, job: ThumbnailJob) {
    let target = guard.target.clone();
    debug!(path = %target.display(), "capturing thumbnail");
    match capture(&guard.inner, &job, &target).await {
        Ok(()) => info!(path = %target.display(), "thumbnail ready"),
        Err(CaptureError::TimedOut) => {
            guard.failed = true;
            warn!(
                path = %target.display(),
                timeout_secs = guard.inner.timeout.as_secs(),
                "thumbnail capture timed out"
            );
        }
        Err(CaptureError::Failed(err)) => {
            guard.failed = true;
            warn!(path = %target.display(), %err, "thumbnail capture failed");
        }
    }
}

enum CaptureError {
    Failed(ToolError),
    TimedOut,
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Failed(ToolError::Other(err.to_string()))
    }
}

/// Captures into a temporary file next to `target` and renames it into
/// place. The temporary file is deleted on every path that does not persist
/// it.
async fn capture(
    inner: &GeneratorInner,
    job: &ThumbnailJob,
    target: &Path,
) -> Result<(), CaptureError> {
    let dir = target.parent().ok_or_else(|| {
        CaptureError::Failed(ToolError::Other("target has no parent directory".into()))
    })?;
    tokio::fs::create_dir_all(dir).await?;
    let prefix = format!(
        ".{}-",
        target.file_stem().and_then(|s| s.to_str()).unwrap_or("thumb")
    );
    let partial = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".partial")
        .tempfile_in(dir)?
        .into_temp_path();

    let run = inner.thumbnailer.capture(job, &partial);
    match tokio::time::timeout(inner.timeout, run).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(CaptureError::Failed(err)),
        Err(_) => return Err(CaptureError::TimedOut),
    }
    check_output(&partial).await.map_err(CaptureError::Failed)?;
    partial.persist(target).map_err(|err| CaptureError::from(err.error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fake::{FAKE_JPEG, FakeOutcome, FakeThumbnailer};
    use tempfile::tempdir;

    const LONG_RETRY: Duration = Duration::from_secs(60);

    async fn wait_idle(generator: &ThumbnailGenerator) {
        for _ in 0..200 {
            if generator.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("thumbnail capture did not finish");
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn existing_thumbnail_is_left_alone() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("a.jpg"), b"jpg").unwrap();
        let fake = Arc::new(FakeThumbnailer::new(Duration::ZERO, FakeOutcome::Succeed));
        let generator = ThumbnailGenerator::new(fake.clone(), Duration::from_secs(5), LONG_RETRY);

        let state = generator.ensure(&temp.path().join("a.mp4"), temp.path(), "a.jpg");
        assert_eq!(state, ThumbnailState::Present);
        assert_eq!(fake.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_launch_one_capture() {
        let temp = tempdir().unwrap();
        let dest = temp.path().join("thumbs").join("viajes");
        let fake = Arc::new(FakeThumbnailer::new(
            Duration::from_millis(200),
            FakeOutcome::Succeed,
        ));
        let generator = ThumbnailGenerator::new(fake.clone(), Duration::from_secs(5), LONG_RETRY);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let generator = generator.clone();
            let dest = dest.clone();
            let source = temp.path().join("a.mp4");
            handles.push(tokio::spawn(async move {
                generator.ensure(&source, &dest, "a.jpg")
            }));
        }
        let mut launched = 0;
        for handle in handles {
            if handle.await.unwrap() == ThumbnailState::Launched {
                launched += 1;
            }
        }
        assert_eq!(launched, 1);

        wait_idle(&generator).await;
        assert_eq!(fake.calls(), 1);
        assert_eq!(std::fs::read(dest.join("a.jpg")).unwrap(), FAKE_JPEG);
        assert_eq!(dir_entries(&dest), vec!["a.jpg"]);
        assert_eq!(
            generator.ensure(&temp.path().join("a.mp4"), &dest, "a.jpg"),
            ThumbnailState::Present
        );
    }

    #[tokio::test]
    async fn unfinished_capture_is_not_visible_under_final_name() {
        let temp = tempdir().unwrap();
        let fake = Arc::new(FakeThumbnailer::new(
            Duration::from_millis(300),
            FakeOutcome::Succeed,
        ));
        let generator = ThumbnailGenerator::new(fake.clone(), Duration::from_secs(5), LONG_RETRY);
        let source = temp.path().join("a.mp4");
        let target = temp.path().join("a.jpg");

        assert_eq!(generator.ensure(&source, temp.path(), "a.jpg"), ThumbnailState::Launched);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(generator.in_flight(), 1);
        assert!(!target.exists());
        assert_eq!(generator.ensure(&source, temp.path(), "a.jpg"), ThumbnailState::InProgress);

        wait_idle(&generator).await;
        assert_eq!(std::fs::read(&target).unwrap(), FAKE_JPEG);
        assert_eq!(dir_entries(temp.path()), vec!["a.jpg"]);
    }

    #[tokio::test]
    async fn failed_capture_leaves_no_file_and_cools_down() {
        let temp = tempdir().unwrap();
        let fake = Arc::new(FakeThumbnailer::new(Duration::ZERO, FakeOutcome::Fail));
        let generator = ThumbnailGenerator::new(fake.clone(), Duration::from_secs(5), LONG_RETRY);
        let source = temp.path().join("a.mp4");

        assert_eq!(generator.ensure(&source, temp.path(), "a.jpg"), ThumbnailState::Launched);
        wait_idle(&generator).await;
        assert!(dir_entries(temp.path()).is_empty());

        assert_eq!(generator.ensure(&source, temp.path(), "a.jpg"), ThumbnailState::CoolingDown);
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn failed_capture_is_retried_after_cool_down() {
        let temp = tempdir().unwrap();
        let fake = Arc::new(FakeThumbnailer::new(Duration::ZERO, FakeOutcome::Fail));
        let generator =
            ThumbnailGenerator::new(fake.clone(), Duration::from_secs(5), Duration::ZERO);
        let source = temp.path().join("a.mp4");

        assert_eq!(generator.ensure(&source, temp.path(), "a.jpg"), ThumbnailState::Launched);
        wait_idle(&generator).await;
        assert_eq!(generator.ensure(&source, temp.path(), "a.jpg"), ThumbnailState::Launched);
        wait_idle(&generator).await;
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn clean_exit_without_image_is_a_failure() {
        let temp = tempdir().unwrap();
        let fake = Arc::new(FakeThumbnailer::new(Duration::ZERO, FakeOutcome::NoOutput));
        let generator = ThumbnailGenerator::new(fake.clone(), Duration::from_secs(5), LONG_RETRY);
        let source = temp.path().join("short.mp4");

        assert_eq!(
            generator.ensure(&source, temp.path(), "short.jpg"),
            ThumbnailState::Launched
        );
        wait_idle(&generator).await;
        assert!(dir_entries(temp.path()).is_empty());

        for _ in 0..3 {
            assert_eq!(
                generator.ensure(&source, temp.path(), "short.jpg"),
                ThumbnailState::CoolingDown
            );
        }
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn hung_capture_is_abandoned_after_timeout() {
        let temp = tempdir().unwrap();
        let fake = Arc::new(FakeThumbnailer::new(
            Duration::from_secs(30),
            FakeOutcome::Succeed,
        ));
        let generator =
            ThumbnailGenerator::new(fake.clone(), Duration::from_millis(50), LONG_RETRY);

        generator.ensure(&temp.path().join("a.mp4"), temp.path(), "a.jpg");
        assert_eq!(generator.in_flight(), 1);
        wait_idle(&generator).await;
        assert!(dir_entries(temp.path()).is_empty());
    }
}
