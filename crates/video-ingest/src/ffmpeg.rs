use std::{
    ffi::OsStr,
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    source::{FrameSource, SourceKind, parse_device_index},
    types::{CaptureError, Frame, FrameFormat},
};

/// Frames decoded by an `ffmpeg` child process and read as raw BGR24 from its
/// stdout. The child is killed when the source is dropped.
pub struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    target_size: (u32, u32),
    buffer: Vec<u8>,
}

impl FfmpegSource {
    pub fn spawn(
        uri: &str,
        kind: SourceKind,
        target_size: (u32, u32),
        realtime: bool,
    ) -> Result<Self, CaptureError> {
        let mut cmd = reader_command(uri, kind, target_size, realtime);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(CaptureError::Spawn)?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                return Err(CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")));
            }
        };

        Ok(Self {
            child,
            stdout,
            target_size,
            buffer: vec![0u8; Frame::byte_len(target_size.0, target_size.1)],
        })
    }
}

impl FrameSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        match self.stdout.read_exact(&mut self.buffer) {
            Ok(()) => Ok(Frame {
                data: self.buffer.clone(),
                width: self.target_size.0,
                height: self.target_size.1,
                timestamp_ms: Utc::now().timestamp_millis(),
                format: FrameFormat::Bgr8,
            }),
            // ffmpeg exits (closing stdout) at end of input and when the
            // device goes away alike; the caller decides what that means.
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(CaptureError::EndOfStream),
            Err(err) => Err(CaptureError::Read(err)),
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Build the ffmpeg invocation that decodes `uri` into raw BGR24 at `target_size`.
pub(crate) fn reader_command(
    uri: &str,
    kind: SourceKind,
    target_size: (u32, u32),
    realtime: bool,
) -> Command {
    let scale_arg = format!("scale={}:{}", target_size.0, target_size.1);
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");

    match kind {
        SourceKind::Device => {
            let device = match parse_device_index(uri) {
                Some(index) => format!("/dev/video{index}"),
                None => uri.to_string(),
            };
            cmd.arg("-f").arg("video4linux2").arg("-i").arg(device);
        }
        SourceKind::Rtsp => {
            cmd.arg("-rtsp_transport")
                .arg("tcp")
                .arg("-fflags")
                .arg("nobuffer")
                .arg("-flags")
                .arg("low_delay")
                .arg("-i")
                .arg(uri);
        }
        SourceKind::File => {
            if realtime {
                cmd.arg("-re");
            }
            cmd.arg("-i").arg(uri);
        }
    }

    cmd.arg("-an")
        .arg("-vf")
        .arg(&scale_arg)
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");
    cmd
}

/// Annotated video output written through an `ffmpeg` child fed raw BGR24 on
/// stdin.
pub struct FfmpegWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    size: (u32, u32),
    path: PathBuf,
    frames_written: u64,
}

impl FfmpegWriter {
    pub fn create(path: &Path, size: (u32, u32), fps: f64) -> Result<Self, CaptureError> {
        let mut cmd = writer_command(path, size, fps);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(CaptureError::Spawn)?;
        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = child.kill();
                return Err(CaptureError::Other(anyhow!("failed to capture ffmpeg stdin")));
            }
        };
        debug!(path = %path.display(), width = size.0, height = size.1, fps, "video writer started");

        Ok(Self {
            child,
            stdin: Some(stdin),
            size,
            path: path.to_path_buf(),
            frames_written: 0,
        })
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), CaptureError> {
        let expected = Frame::byte_len(self.size.0, self.size.1);
        if frame.data.len() != expected {
            return Err(CaptureError::FrameSize {
                expected,
                actual: frame.data.len(),
            });
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CaptureError::Other(anyhow!("video writer already finished")))?;
        stdin
            .write_all(&frame.data)
            .map_err(|err| CaptureError::Other(err.into()))?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Close the input pipe and wait for ffmpeg to finalise the container.
    pub fn finish(mut self) -> Result<PathBuf, CaptureError> {
        drop(self.stdin.take());
        let status = self
            .child
            .wait()
            .map_err(|err| CaptureError::Other(err.into()))?;
        if !status.success() {
            return Err(CaptureError::Other(anyhow!(
                "ffmpeg exited with {status} while writing {}",
                self.path.display()
            )));
        }
        Ok(self.path.clone())
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            warn!(path = %self.path.display(), "video writer dropped before finish");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

pub(crate) fn writer_command(path: &Path, size: (u32, u32), fps: f64) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-y")
        .arg("-f")
        .arg("rawvideo")
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-s")
        .arg(format!("{}x{}", size.0, size.1))
        .arg("-r")
        .arg(format!("{fps:.3}"))
        .arg("-i")
        .arg("-")
        .arg("-an")
        .arg("-c:v")
        .arg("mpeg4")
        .arg("-q:v")
        .arg("5")
        .arg(path.as_os_str());
    cmd
}

/// Ask `ffprobe` for the nominal frame rate of the first video stream.
pub fn probe_frame_rate(uri: impl AsRef<OsStr>) -> Option<f64> {
    parse_frame_rate(&probe_stream_entry(uri, "stream=r_frame_rate")?)
}

/// Ask `ffprobe` for the native `(width, height)` of the first video stream.
pub fn probe_dimensions(uri: impl AsRef<OsStr>) -> Option<(u32, u32)> {
    parse_dimensions(&probe_stream_entry(uri, "stream=width,height")?)
}

fn probe_stream_entry(uri: impl AsRef<OsStr>, entries: &str) -> Option<String> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg(entries)
        .arg("-of")
        .arg("csv=p=0")
        .arg(uri)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        debug!(entries, status = %output.status, "ffprobe failed");
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Parse ffprobe geometry such as `1920,1080`. Odd sizes are rounded down to
/// even ones, which the mpeg4 encoder requires.
pub(crate) fn parse_dimensions(raw: &str) -> Option<(u32, u32)> {
    let (width, height) = raw.lines().next()?.split_once(',')?;
    let width: u32 = width.trim().parse().ok()?;
    let height: u32 = height.trim().trim_end_matches(',').parse().ok()?;
    let (width, height) = (width & !1, height & !1);
    (width > 0 && height > 0).then_some((width, height))
}

/// Parse ffprobe rates such as `30000/1001` or `25`.
pub(crate) fn parse_frame_rate(raw: &str) -> Option<f64> {
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn device_reader_uses_v4l2() {
        let cmd = reader_command("1", SourceKind::Device, (640, 480), false);
        let args = args(&cmd);
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input - 1], "video4linux2");
        assert_eq!(args[input + 1], "/dev/video1");
        assert!(args.contains(&"scale=640:480".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn file_reader_paces_only_when_realtime() {
        let paced = args(&reader_command("clip.mp4", SourceKind::File, (320, 240), true));
        let unpaced = args(&reader_command("clip.mp4", SourceKind::File, (320, 240), false));
        assert!(paced.contains(&"-re".to_string()));
        assert!(!unpaced.contains(&"-re".to_string()));
    }

    #[test]
    fn rtsp_reader_forces_tcp() {
        let args = args(&reader_command("rtsp://cam/1", SourceKind::Rtsp, (640, 480), false));
        let transport = args.iter().position(|a| a == "-rtsp_transport").unwrap();
        assert_eq!(args[transport + 1], "tcp");
    }

    #[test]
    fn writer_declares_raw_input_geometry() {
        let cmd = writer_command(Path::new("out.mp4"), (640, 480), 20.0);
        let args = args(&cmd);
        let size = args.iter().position(|a| a == "-s").unwrap();
        assert_eq!(args[size + 1], "640x480");
        let rate = args.iter().position(|a| a == "-r").unwrap();
        assert_eq!(args[rate + 1], "20.000");
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn dimension_parsing() {
        assert_eq!(parse_dimensions("1920,1080"), Some((1920, 1080)));
        assert_eq!(parse_dimensions("1280,720,\n"), Some((1280, 720)));
        assert_eq!(parse_dimensions("853,481"), Some((852, 480)));
        assert_eq!(parse_dimensions("0,480"), None);
        assert_eq!(parse_dimensions("N/A,N/A"), None);
        assert_eq!(parse_dimensions(""), None);
    }

    #[test]
    fn frame_rate_parsing() {
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        let ntsc = parse_frame_rate("30000/1001").unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate(""), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }
}
