//! Capabilities backed by external media tools.
//!
//! Request handling only ever sees the [`Remuxer`] and [`Thumbnailer`] traits;
//! [`FfmpegTools`] is the production implementation and the fakes in
//! [`fake`] stand in for it under test.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::ToolError;

/// Keeps tool error messages readable in logs.
const STDERR_LIMIT: usize = 2_000;

/// Container-only rewrite of a video so playback can start before the whole
/// file has been downloaded.
#[async_trait]
pub trait Remuxer: Send + Sync {
    /// Stream-copies `input` into `output` with the fast-start flag set.
    async fn remux(&self, input: &Path, output: &Path) -> Result<(), ToolError>;
}

/// Single-frame still capture.
#[async_trait]
pub trait Thumbnailer: Send + Sync {
    /// Writes one JPEG frame of `job.input` to `output`, whatever its
    /// extension.
    async fn capture(&self, job: &ThumbnailJob, output: &Path) -> Result<(), ToolError>;
}

/// What to capture for one preview image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailJob {
    pub input: PathBuf,
    pub offset: Duration,
    /// Target width in pixels; height follows the aspect ratio.
    pub width: u32,
}

/// Fails unless `path` holds at least one byte. Tools can exit cleanly
/// without writing anything, e.g. when seeking past the end of a video.
pub async fn check_output(path: &Path) -> Result<(), ToolError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.len() > 0 => Ok(()),
        _ => Err(ToolError::EmptyOutput {
            path: path.display().to_string(),
        }),
    }
}

/// Both capabilities implemented by spawning `ffmpeg`.
///
/// Children are spawned with `kill_on_drop`, so dropping the returned future
/// (for instance when a timeout fires) also terminates the process.
#[derive(Debug, Clone)]
pub struct FfmpegTools {
    binary: PathBuf,
}

impl FfmpegTools {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin", "-y"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<(), ToolError> {
        let program = self.binary.display().to_string();
        let output = cmd.output().await.map_err(|source| ToolError::Spawn {
            program: program.clone(),
            source,
        })?;
        if output.status.success() {
            return Ok(());
        }

        let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.len() > STDERR_LIMIT {
            let mut cut = STDERR_LIMIT;
            while !stderr.is_char_boundary(cut) {
                cut -= 1;
            }
            stderr.truncate(cut);
        }
        Err(ToolError::Exited {
            program,
            status: output.status,
            stderr,
        })
    }
}

#[async_trait]
impl Remuxer for FfmpegTools {
    async fn remux(&self, input: &Path, output: &Path) -> Result<(), ToolError> {
        debug!(input = %input.display(), output = %output.display(), "ffmpeg remux");
        let mut cmd = self.command();
        cmd.arg("-i")
            .arg(input)
            .args(["-map", "0", "-c", "copy", "-movflags", "+faststart", "-f", "mp4"])
            .arg(output);
        self.run(cmd).await
    }
}

#[async_trait]
impl Thumbnailer for FfmpegTools {
    async fn capture(&self, job: &ThumbnailJob, output: &Path) -> Result<(), ToolError> {
        debug!(input = %job.input.display(), output = %output.display(), "ffmpeg thumbnail");
        let mut cmd = self.command();
        cmd.arg("-ss")
            .arg(format!("{:.3}", job.offset.as_secs_f64()))
            .arg("-i")
            .arg(&job.input)
            .args(["-frames:v", "1", "-q:v", "3"])
            .arg("-vf")
            .arg(format!("scale={}:-2", job.width))
            .args(["-f", "image2", "-c:v", "mjpeg", "-update", "1"])
            .arg(output);
        self.run(cmd).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_or_missing_output_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let written = temp.path().join("a.jpg");
        std::fs::write(&written, b"x").unwrap();
        let empty = temp.path().join("b.jpg");
        std::fs::write(&empty, b"").unwrap();

        assert!(check_output(&written).await.is_ok());
        assert!(matches!(
            check_output(&empty).await,
            Err(ToolError::EmptyOutput { .. })
        ));
        assert!(matches!(
            check_output(&temp.path().join("c.jpg")).await,
            Err(ToolError::EmptyOutput { .. })
        ));
    }

    #[tokio::test]
    async fn missing_binary_reports_spawn_error() {
        let tools = FfmpegTools::new("/nonexistent/ffmpeg-binary");
        let err = tools
            .remux(Path::new("/tmp/in.mp4"), Path::new("/tmp/out.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
