//! Transcode module backed by the external `ffmpeg` binary.
//!
//! Progress is read from ffmpeg's machine-readable `-progress` output and
//! pushed into the shared status snapshot once per second while the encode
//! runs; the monitor loop exits when the process terminates.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::TaskError;
use crate::heartbeat::Heartbeat;
use crate::modules::TaskModule;

static FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^frame=(\d+)$").expect("frame pattern compiles"));

#[derive(Debug, Clone, Deserialize)]
struct FfmpegPayload {
    source: PathBuf,
    destination: PathBuf,
    #[serde(default)]
    video: VideoSettings,
    #[serde(default)]
    audio: AudioSettings,
    /// Raw arguments appended before the destination, for anything the
    /// structured fields do not cover.
    #[serde(default)]
    extra_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct VideoSettings {
    #[serde(default = "default_video_codec")]
    codec: String,
    preset: Option<String>,
    crf: Option<u32>,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            codec: default_video_codec(),
            preset: None,
            crf: None,
        }
    }
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct AudioSettings {
    #[serde(default = "default_audio_codec")]
    codec: String,
    bitrate: Option<String>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            codec: default_audio_codec(),
            bitrate: None,
        }
    }
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

pub struct FfmpegModule {
    data: serde_json::Value,
    payload: Option<FfmpegPayload>,
    heartbeat: Arc<Heartbeat>,
    started: Instant,
}

impl FfmpegModule {
    pub fn new(data: serde_json::Value, heartbeat: Arc<Heartbeat>) -> Result<Self, TaskError> {
        Ok(Self {
            data,
            payload: None,
            heartbeat,
            started: Instant::now(),
        })
    }

    fn payload(&self) -> Result<&FfmpegPayload, TaskError> {
        self.payload
            .as_ref()
            .ok_or_else(|| TaskError::Run("task was not validated".into()))
    }

    fn push_progress(&self, frame: u64, total_frames: Option<u64>) {
        let mut fields = serde_json::Map::new();
        fields.insert("task".into(), self.name().into());
        fields.insert("current_frame".into(), frame.into());
        if let Some(total) = total_frames.filter(|t| *t > 0) {
            fields.insert("total_frames".into(), total.into());
            let percent = (frame as f64 / total as f64 * 100.0).min(100.0);
            fields.insert("percent".into(), serde_json::json!(percent));
        }
        self.heartbeat.update_progress(fields);
    }

    /// Supervise the spawned encode: one tick per second, drain whatever
    /// progress lines arrived, leave when the process has terminated.
    async fn monitor(
        &self,
        mut child: tokio::process::Child,
        total_frames: Option<u64>,
    ) -> Result<std::process::ExitStatus, TaskError> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut reader = child.stdout.take().map(|stdout| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(caps) = FRAME_RE.captures(line.trim()) {
                        if let Ok(frame) = caps[1].parse::<u64>() {
                            if tx.send(frame).is_err() {
                                return;
                            }
                        }
                    }
                }
            })
        });

        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;

            self.drain_progress(&mut rx, total_frames);

            match child.try_wait() {
                Ok(Some(status)) => {
                    // Pick up lines emitted between the last tick and exit.
                    if let Some(handle) = reader.take() {
                        let _ = handle.await;
                    }
                    self.drain_progress(&mut rx, total_frames);
                    return Ok(status);
                }
                Ok(None) => {}
                Err(e) => return Err(TaskError::Run(format!("could not poll ffmpeg: {e}"))),
            }
        }
    }

    fn drain_progress(
        &self,
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<u64>,
        total_frames: Option<u64>,
    ) {
        let mut latest = None;
        while let Ok(frame) = rx.try_recv() {
            latest = Some(frame);
        }
        if let Some(frame) = latest {
            self.push_progress(frame, total_frames);
        }
    }
}

fn build_command(payload: &FfmpegPayload) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-hide_banner", "-nostats", "-progress", "pipe:1", "-y"]);
    cmd.arg("-i").arg(&payload.source);
    cmd.args(["-c:v", &payload.video.codec]);
    if let Some(preset) = &payload.video.preset {
        cmd.args(["-preset", preset]);
    }
    if let Some(crf) = payload.video.crf {
        cmd.args(["-crf", &crf.to_string()]);
    }
    cmd.args(["-c:a", &payload.audio.codec]);
    if let Some(bitrate) = &payload.audio.bitrate {
        cmd.args(["-b:a", bitrate]);
    }
    for arg in &payload.extra_args {
        cmd.arg(arg);
    }
    cmd.arg(&payload.destination);
    cmd
}

/// Total frame count of the source's first video stream, via ffprobe.
/// `None` when the container does not carry it.
async fn probe_frames(source: &Path) -> Option<u64> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-count_packets",
            "-show_entries",
            "stream=nb_read_packets",
            "-of",
            "csv=p=0",
        ])
        .arg(source)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

#[async_trait]
impl TaskModule for FfmpegModule {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn validate(&mut self) -> Result<(), TaskError> {
        let payload: FfmpegPayload = serde_json::from_value(self.data.clone())
            .map_err(|e| TaskError::Validation(e.to_string()))?;

        if payload.source.as_os_str().is_empty() {
            return Err(TaskError::Validation("'source' must not be empty".into()));
        }
        if payload.destination.as_os_str().is_empty() {
            return Err(TaskError::Validation(
                "'destination' must not be empty".into(),
            ));
        }
        if !payload.source.exists() {
            return Err(TaskError::Validation(format!(
                "source file does not exist: {:?}",
                payload.source
            )));
        }

        self.payload = Some(payload);
        tracing::debug!("Task data validated");
        Ok(())
    }

    async fn run(&mut self) -> Result<(), TaskError> {
        let payload = self.payload()?.clone();

        if let Some(parent) = payload.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TaskError::Run(format!("could not create {parent:?}: {e}")))?;
        }

        let total_frames = probe_frames(&payload.source).await;

        let mut cmd = build_command(&payload);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        tracing::info!(source = ?payload.source, "Running ffmpeg encoding task");
        tracing::debug!(command = ?cmd, "Spawning ffmpeg");

        let child = cmd
            .spawn()
            .map_err(|e| TaskError::Run(format!("could not spawn ffmpeg: {e}")))?;

        let status = self.monitor(child, total_frames).await?;
        if !status.success() {
            return Err(TaskError::Run(format!(
                "ffmpeg exited with {} for {:?}",
                status, payload.source
            )));
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<(), TaskError> {
        // The finished encode is the deliverable; nothing temporary to drop.
        Ok(())
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn heartbeat() -> Arc<Heartbeat> {
        let api = crate::api::ApiClient::new(
            "http://127.0.0.1:1",
            Uuid::new_v4(),
            Duration::from_secs(1),
        )
        .unwrap();
        Arc::new(Heartbeat::new(
            api,
            "test-host".into(),
            "0.0.0",
            Duration::from_secs(5),
        ))
    }

    fn module(data: serde_json::Value) -> FfmpegModule {
        FfmpegModule::new(data, heartbeat()).unwrap()
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn missing_source_field_fails_validation() {
        let mut m = module(serde_json::json!({"destination": "/out/a.mp4"}));
        let err = m.validate().await.unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
        assert!(err.to_string().contains("source"));
    }

    #[tokio::test]
    async fn nonexistent_source_fails_validation() {
        let mut m = module(serde_json::json!({
            "source": "/no/such/file.mkv",
            "destination": "/out/a.mp4"
        }));
        let err = m.validate().await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn validated_payload_survives_to_run() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("in.mkv");
        std::fs::write(&src, "not really video").unwrap();

        let mut m = module(serde_json::json!({
            "source": src,
            "destination": tmp.path().join("out.mp4")
        }));
        assert!(m.validate().await.is_ok());
        assert!(m.payload.is_some());
    }

    #[test]
    fn command_includes_progress_and_codecs() {
        let payload = FfmpegPayload {
            source: "/in/a.mkv".into(),
            destination: "/out/a.mp4".into(),
            video: VideoSettings {
                codec: "libx265".into(),
                preset: Some("slow".into()),
                crf: Some(20),
            },
            audio: AudioSettings {
                codec: "aac".into(),
                bitrate: Some("192k".into()),
            },
            extra_args: vec!["-movflags".into(), "+faststart".into()],
        };

        let args = args_of(&build_command(&payload));
        let joined = args.join(" ");
        assert!(joined.contains("-progress pipe:1"));
        assert!(joined.contains("-nostats"));
        assert!(joined.contains("-i /in/a.mkv"));
        assert!(joined.contains("-c:v libx265 -preset slow -crf 20"));
        assert!(joined.contains("-c:a aac -b:a 192k"));
        assert!(joined.contains("-movflags +faststart"));
        assert_eq!(args.last().map(String::as_str), Some("/out/a.mp4"));
    }

    #[test]
    fn command_defaults_apply_without_settings() {
        let payload: FfmpegPayload = serde_json::from_value(serde_json::json!({
            "source": "/in/a.mkv",
            "destination": "/out/a.mp4"
        }))
        .unwrap();

        let joined = args_of(&build_command(&payload)).join(" ");
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-c:a aac"));
        assert!(!joined.contains("-preset"));
        assert!(!joined.contains("-crf"));
    }

    #[test]
    fn frame_lines_parse_and_noise_does_not() {
        assert!(FRAME_RE.captures("frame=123").is_some());
        assert_eq!(&FRAME_RE.captures("frame=123").unwrap()[1], "123");
        assert!(FRAME_RE.captures("fps=25.0").is_none());
        assert!(FRAME_RE.captures("out_time_us=4880000").is_none());
        assert!(FRAME_RE.captures("progress=continue").is_none());
    }

    #[test]
    fn progress_fields_reach_the_snapshot() {
        let hb = heartbeat();
        hb.set_in_progress("j-1", "t");
        let m = FfmpegModule::new(serde_json::Value::Null, Arc::clone(&hb)).unwrap();

        m.push_progress(50, Some(200));
        let progress = hb.snapshot().progress;
        assert_eq!(progress["current_frame"], serde_json::json!(50));
        assert_eq!(progress["total_frames"], serde_json::json!(200));
        assert_eq!(progress["percent"], serde_json::json!(25.0));
    }

    #[test]
    fn progress_without_total_omits_percent() {
        let hb = heartbeat();
        hb.set_in_progress("j-1", "t");
        let m = FfmpegModule::new(serde_json::Value::Null, Arc::clone(&hb)).unwrap();

        m.push_progress(50, None);
        let progress = hb.snapshot().progress;
        assert_eq!(progress["current_frame"], serde_json::json!(50));
        assert!(progress.get("percent").is_none());
    }

    #[tokio::test]
    async fn monitor_exits_when_the_process_does() {
        // Stand-in for ffmpeg: emits two progress blocks, then exits 0.
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo frame=10; echo frame=20; exit 0"]);
        cmd.stdout(Stdio::piped());

        let hb = heartbeat();
        hb.set_in_progress("j-1", "t");
        let m = FfmpegModule::new(serde_json::Value::Null, Arc::clone(&hb)).unwrap();

        let child = cmd.spawn().unwrap();
        let status = m.monitor(child, Some(20)).await.unwrap();
        assert!(status.success());

        let progress = hb.snapshot().progress;
        assert_eq!(progress["current_frame"], serde_json::json!(20));
        assert_eq!(progress["percent"], serde_json::json!(100.0));
    }

    #[tokio::test]
    async fn monitor_reports_nonzero_exit() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        cmd.stdout(Stdio::piped());

        let m = FfmpegModule::new(serde_json::Value::Null, heartbeat()).unwrap();
        let status = m.monitor(cmd.spawn().unwrap(), None).await.unwrap();
        assert!(!status.success());
    }
}
