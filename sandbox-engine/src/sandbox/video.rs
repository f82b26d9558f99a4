/// Screen recording of sample execution
///
/// Starts a virtual framebuffer inside the container, records it with
/// ffmpeg and takes periodic screenshots until the run's stop marker
/// appears. Recording is best effort: any failure leaves the report
/// without a video handle.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::container::ContainerRuntime;
use crate::error::SandboxError;

/// X display the framebuffer listens on; samples get `DISPLAY` set to it
pub const DISPLAY: &str = ":99";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoCaptureConfig {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub codec: String,
    pub preset: String,
    pub max_duration_secs: u64,
    pub capture_screenshots: bool,
    pub screenshot_interval_ms: u64,
}

impl Default for VideoCaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            width: 1280,
            height: 720,
            frame_rate: 15,
            codec: "libx264".to_string(),
            preset: "ultrafast".to_string(),
            max_duration_secs: 300,
            capture_screenshots: true,
            screenshot_interval_ms: 5000,
        }
    }
}

fn is_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

impl VideoCaptureConfig {
    pub fn validate(&self) -> Result<(), SandboxError> {
        let invalid = |field: &'static str, reason: &str| SandboxError::InvalidConfig {
            field,
            reason: reason.to_string(),
        };

        if self.width == 0 || self.height == 0 {
            return Err(invalid("video_capture.resolution", "width and height must be greater than 0"));
        }
        if self.frame_rate == 0 {
            return Err(invalid("video_capture.frame_rate", "must be greater than 0"));
        }
        if self.max_duration_secs == 0 {
            return Err(invalid("video_capture.max_duration_secs", "must be greater than 0"));
        }
        if self.capture_screenshots && self.screenshot_interval_ms == 0 {
            return Err(invalid("video_capture.screenshot_interval_ms", "must be greater than 0"));
        }
        if !is_token(&self.codec) {
            return Err(invalid("video_capture.codec", "must be an encoder name"));
        }
        if !is_token(&self.preset) {
            return Err(invalid("video_capture.preset", "must be a preset name"));
        }
        Ok(())
    }
}

/// Handle to a finished recording inside the run directory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoRecording {
    pub path: String,
    pub duration_ms: u64,
    pub resolution: (u32, u32),
    pub frame_rate: u32,
    pub file_size: u64,
    pub codec: String,
    pub format: String,
}

/// Shell script that starts the framebuffer, recorder and screenshot loop
pub fn start_script(
    config: &VideoCaptureConfig,
    video_path: &str,
    screenshots_dir: &str,
    stop_marker: &str,
) -> String {
    let mut script = format!(
        "Xvfb {display} -screen 0 {w}x{h}x24 -nolisten tcp >/dev/null 2>&1 &\n\
         sleep 1\n\
         ffmpeg -nostdin -loglevel error -y -f x11grab -video_size {w}x{h} -framerate {fps} -i {display} \
         -c:v {codec} -preset {preset} -pix_fmt yuv420p -t {max} '{video}' >/dev/null 2>&1 &\n",
        display = DISPLAY,
        w = config.width,
        h = config.height,
        fps = config.frame_rate,
        codec = config.codec,
        preset = config.preset,
        max = config.max_duration_secs,
        video = video_path,
    );

    if config.capture_screenshots {
        script.push_str(&format!(
            "mkdir -p '{dir}'\n\
             (while [ ! -e '{stop}' ]; do \
             import -window root -display {display} '{dir}'/screenshot_$(date +%s%N).png 2>/dev/null; \
             sleep {interval}; done) >/dev/null 2>&1 &\n",
            dir = screenshots_dir,
            stop = stop_marker,
            display = DISPLAY,
            interval = config.screenshot_interval_ms as f64 / 1000.0,
        ));
    }

    script
}

/// Stops the recorder gracefully so the container is finalized, then prints its size
pub fn stop_script(video_path: &str) -> String {
    format!(
        "pkill -INT -x ffmpeg 2>/dev/null\n\
         for _ in 1 2 3 4 5; do pgrep -x ffmpeg >/dev/null || break; sleep 1; done\n\
         pkill -x Xvfb 2>/dev/null\n\
         stat -c %s '{video}' 2>/dev/null || echo 0",
        video = video_path,
    )
}

/// A recording in progress
pub struct VideoRecorder {
    config: VideoCaptureConfig,
    video_path: String,
    started: Instant,
}

impl VideoRecorder {
    /// Start recording. Returns `None` when recording is disabled or could not start.
    pub async fn start(
        runtime: &dyn ContainerRuntime,
        container_id: &str,
        config: &VideoCaptureConfig,
        video_path: &str,
        screenshots_dir: &str,
        stop_marker: &str,
    ) -> Option<Self> {
        if !config.enabled {
            return None;
        }

        let script = start_script(config, video_path, screenshots_dir, stop_marker);
        let cmd = vec!["sh".to_string(), "-c".to_string(), script];
        if let Err(e) = runtime.exec_detached(container_id, &cmd).await {
            warn!(container_id = %container_id, "Video recording did not start: {:#}", e);
            return None;
        }

        info!(
            container_id = %container_id,
            "Recording display {} at {}x{}@{}fps",
            DISPLAY,
            config.width,
            config.height,
            config.frame_rate
        );
        Some(Self {
            config: config.clone(),
            video_path: video_path.to_string(),
            started: Instant::now(),
        })
    }

    pub async fn stop(self, runtime: &dyn ContainerRuntime, container_id: &str) -> Option<VideoRecording> {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            stop_script(&self.video_path),
        ];

        let output = match runtime.exec(container_id, &cmd).await {
            Ok(output) => output,
            Err(e) => {
                warn!(container_id = %container_id, "Failed to stop video recording: {:#}", e);
                return None;
            }
        };

        let file_size: u64 = output
            .stdout
            .lines()
            .last()
            .and_then(|l| l.trim().parse().ok())
            .unwrap_or(0);
        if file_size == 0 {
            warn!(container_id = %container_id, "Video recording produced no output");
            return None;
        }
        debug!(file_size, "Video recording finalized");

        Some(VideoRecording {
            path: self.video_path,
            duration_ms: elapsed_ms.min(self.config.max_duration_secs * 1000),
            resolution: (self.config.width, self.config.height),
            frame_rate: self.config.frame_rate,
            file_size,
            codec: self.config.codec,
            format: "mp4".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBehavior, FakeRuntime};

    fn enabled() -> VideoCaptureConfig {
        VideoCaptureConfig {
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_and_validation() {
        let config = VideoCaptureConfig::default();
        assert!(!config.enabled);
        assert_eq!((config.width, config.height, config.frame_rate), (1280, 720, 15));
        assert!(config.validate().is_ok());

        let config = VideoCaptureConfig {
            frame_rate: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SandboxError::InvalidConfig { field: "video_capture.frame_rate", .. })
        ));

        let config = VideoCaptureConfig {
            codec: "x264; rm -rf /".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_start_script() {
        let script = start_script(
            &enabled(),
            "/sandbox/output/s1/recording.mp4",
            "/sandbox/output/screenshots/s1",
            "/sandbox/output/s1/stop_simulation",
        );
        assert!(script.contains("Xvfb :99 -screen 0 1280x720x24"));
        assert!(script.contains("-f x11grab -video_size 1280x720 -framerate 15 -i :99"));
        assert!(script.contains("-c:v libx264 -preset ultrafast"));
        assert!(script.contains("-t 300 '/sandbox/output/s1/recording.mp4'"));
        assert!(script.contains("while [ ! -e '/sandbox/output/s1/stop_simulation' ]"));
        assert!(script.contains("sleep 5;"));
    }

    #[tokio::test]
    async fn test_record_round_trip_with_runtime() {
        let fake = FakeRuntime::new(FakeBehavior {
            video_size: 48_213,
            ..Default::default()
        });
        let recorder = VideoRecorder::start(&fake, "ctr", &enabled(), "/v.mp4", "/shots", "/stop")
            .await
            .unwrap();
        let recording = recorder.stop(&fake, "ctr").await.unwrap();
        assert_eq!(recording.file_size, 48_213);
        assert_eq!(recording.resolution, (1280, 720));
        assert_eq!(recording.codec, "libx264");
        assert_eq!(fake.state().detached.len(), 1);
    }

    #[tokio::test]
    async fn test_failures_leave_no_handle() {
        let fake = FakeRuntime::new(FakeBehavior {
            fail_detached: true,
            ..Default::default()
        });
        assert!(VideoRecorder::start(&fake, "ctr", &enabled(), "/v.mp4", "/s", "/stop")
            .await
            .is_none());

        let fake = FakeRuntime::new(FakeBehavior::default());
        let recorder = VideoRecorder::start(&fake, "ctr", &enabled(), "/v.mp4", "/s", "/stop")
            .await
            .unwrap();
        assert!(recorder.stop(&fake, "ctr").await.is_none());

        let disabled = VideoCaptureConfig::default();
        assert!(VideoRecorder::start(&fake, "ctr", &disabled, "/v.mp4", "/s", "/stop")
            .await
            .is_none());
    }
}
