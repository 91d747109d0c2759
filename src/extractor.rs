#![forbid(unsafe_code)]

//! Adapter around the external extraction/transcode tool.
//!
//! The runner only ever sees the [`Extractor`] trait: a single blocking call
//! that relays raw progress numbers through a [`ProgressSink`] and honours a
//! [`CancellationToken`] on a best-effort basis. [`YtDlpExtractor`] is the
//! production implementation and drives the `yt-dlp` binary; how quickly it
//! reacts to cancellation is bounded by [`POLL_INTERVAL`].

use std::{
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::mpsc as std_mpsc,
    thread,
    time::Duration,
};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::jobs::MediaKind;

pub const AUDIO_CODEC: &str = "mp3";
pub const DEFAULT_AUDIO_BITRATE: &str = "192";

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const PROGRESS_PREFIX: &str = "cleantube-progress:";
const TITLE_PREFIX: &str = "cleantube-title:";
const PROGRESS_TEMPLATE: &str = "download:cleantube-progress:%(progress.status)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.eta)s";
const TITLE_TEMPLATE: &str = "after_move:cleantube-title:%(title)s";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const REFERER: &str = "https://www.youtube.com/";
const MAX_ERROR_LINES: usize = 8;

/// Raw progress relayed from the extractor. No bookkeeping happens here.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    Transfer {
        downloaded: u64,
        /// Exact size when known, otherwise the extractor's estimate.
        total: Option<u64>,
        /// Bytes per second.
        speed: Option<f64>,
        /// Seconds remaining.
        eta: Option<u64>,
    },
    /// Raw transfer done; post-processing may still be running.
    TransferFinished,
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// The runner hands the extractor the sending half of a bounded per-job
/// channel. Only valid from blocking threads.
impl ProgressSink for mpsc::Sender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        if self.blocking_send(event).is_err() {
            debug!("progress receiver dropped; discarding event");
        }
    }
}

#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub target_id: String,
    pub kind: MediaKind,
    pub quality: String,
    /// Output files must be named `<artifact_stem>.<ext>` inside `output_dir`.
    pub artifact_stem: String,
    pub output_dir: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchOutcome {
    pub artifact_stem: String,
    pub title: String,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("failed to launch extractor: {0}")]
    Launch(#[source] std::io::Error),
    #[error("{0}")]
    Failed(String),
    #[error("download cancelled")]
    Cancelled,
    #[error("extractor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Extractor: Send + Sync {
    fn fetch(
        &self,
        request: &FetchRequest,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, ExtractionError>;
}

/// Concrete format policy derived from kind and quality.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatSelection {
    pub format: String,
    /// `Some(bitrate)` when the result must be transcoded to [`AUDIO_CODEC`].
    pub audio_bitrate: Option<String>,
}

/// Audio: best audio transcoded at the numeric bitrate in `quality`, else
/// 192 kbps. Video: `best` or anything non-numeric means unrestricted best;
/// a number caps the height.
pub fn select_format(kind: MediaKind, quality: &str) -> FormatSelection {
    let quality = quality.trim();
    match kind {
        MediaKind::Audio => {
            let bitrate = quality
                .trim_end_matches(['k', 'K'])
                .parse::<u32>()
                .ok()
                .filter(|bitrate| *bitrate > 0)
                .map(|bitrate| bitrate.to_string())
                .unwrap_or_else(|| DEFAULT_AUDIO_BITRATE.to_string());
            FormatSelection {
                format: "bestaudio/best".to_string(),
                audio_bitrate: Some(bitrate),
            }
        }
        MediaKind::Video => {
            let format = match quality.parse::<u32>() {
                Ok(height) if height > 0 => {
                    format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]")
                }
                _ => "bestvideo+bestaudio/best".to_string(),
            };
            FormatSelection {
                format,
                audio_bitrate: None,
            }
        }
    }
}

pub fn watch_url(target_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={target_id}")
}

/// Drives a local `yt-dlp` binary.
#[derive(Clone, Debug)]
pub struct YtDlpExtractor {
    binary: PathBuf,
    cookies: Option<PathBuf>,
}

impl YtDlpExtractor {
    pub fn new(binary: impl Into<PathBuf>, cookies: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cookies,
        }
    }

    fn build_args(&self, request: &FetchRequest) -> Vec<String> {
        let selection = select_format(request.kind, &request.quality);
        let output = request
            .output_dir
            .join(format!("{}.%(ext)s", request.artifact_stem));

        let mut args = vec![
            "--newline".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--progress".to_string(),
            "--no-simulate".to_string(),
            // Artifacts are aged by mtime; keep it at write time, not upload date.
            "--no-mtime".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
            "--print".to_string(),
            TITLE_TEMPLATE.to_string(),
            "--user-agent".to_string(),
            USER_AGENT.to_string(),
            "--referer".to_string(),
            REFERER.to_string(),
            "--format".to_string(),
            selection.format,
            "--output".to_string(),
            output.to_string_lossy().into_owned(),
        ];
        if let Some(bitrate) = selection.audio_bitrate {
            args.extend([
                "--extract-audio".to_string(),
                "--audio-format".to_string(),
                AUDIO_CODEC.to_string(),
                "--audio-quality".to_string(),
                format!("{bitrate}K"),
            ]);
        }
        if let Some(cookies) = self.cookies.as_deref().filter(|path| path.exists()) {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }
        args.push("--".to_string());
        args.push(watch_url(&request.target_id));
        args
    }
}

impl Extractor for YtDlpExtractor {
    fn fetch(
        &self,
        request: &FetchRequest,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, ExtractionError> {
        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }

        let mut child = Command::new(&self.binary)
            .args(self.build_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ExtractionError::Launch)?;

        let (line_tx, line_rx) = std_mpsc::channel::<String>();
        let readers = [
            child.stdout.take().map(|out| spawn_line_reader(out, line_tx.clone())),
            child.stderr.take().map(|err| spawn_line_reader(err, line_tx.clone())),
        ];
        drop(line_tx);

        let mut title: Option<String> = None;
        let mut errors: Vec<String> = Vec::new();
        let mut finished_sent = false;

        loop {
            if cancel.is_cancelled() {
                // Grandchildren (ffmpeg) may still hold the pipes, so the
                // reader threads are left to finish on their own.
                kill_child(&mut child);
                drop(readers);
                return Err(ExtractionError::Cancelled);
            }
            match line_rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => match parse_output_line(&line) {
                    Some(OutputLine::Progress(event)) => {
                        if event == ProgressEvent::TransferFinished {
                            finished_sent = true;
                        }
                        progress.emit(event);
                    }
                    Some(OutputLine::Title(value)) => title = Some(value),
                    Some(OutputLine::Error(message)) => {
                        if errors.len() < MAX_ERROR_LINES {
                            errors.push(message);
                        }
                    }
                    None => {}
                },
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = child.wait()?;
        join_readers(readers);

        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }
        if !status.success() {
            let message = errors
                .last()
                .cloned()
                .unwrap_or_else(|| format!("yt-dlp exited with {status}"));
            return Err(ExtractionError::Failed(message));
        }
        if !finished_sent {
            progress.emit(ProgressEvent::TransferFinished);
        }

        Ok(FetchOutcome {
            artifact_stem: request.artifact_stem.clone(),
            title: title
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| "video".to_string()),
        })
    }
}

fn spawn_line_reader<R>(source: R, sink: std_mpsc::Sender<String>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        for line in BufReader::new(source).lines() {
            let Ok(line) = line else {
                break;
            };
            if sink.send(line).is_err() {
                break;
            }
        }
    })
}

fn join_readers(readers: [Option<thread::JoinHandle<()>>; 2]) {
    for reader in readers.into_iter().flatten() {
        if reader.join().is_err() {
            warn!("extractor output reader panicked");
        }
    }
}

fn kill_child(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!("extractor already exited before kill: {err}");
    }
    if let Err(err) = child.wait() {
        warn!("failed to reap extractor process: {err}");
    }
}

#[derive(Debug, PartialEq)]
enum OutputLine {
    Progress(ProgressEvent),
    Title(String),
    Error(String),
}

fn parse_output_line(line: &str) -> Option<OutputLine> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(PROGRESS_PREFIX) {
        return parse_progress_fields(rest).map(OutputLine::Progress);
    }
    if let Some(rest) = line.strip_prefix(TITLE_PREFIX) {
        return Some(OutputLine::Title(rest.trim().to_string()));
    }
    if let Some(rest) = line.strip_prefix("ERROR:") {
        return Some(OutputLine::Error(rest.trim().to_string()));
    }
    None
}

/// `status|downloaded|total|estimate|speed|eta`, with `NA` for missing values.
fn parse_progress_fields(raw: &str) -> Option<ProgressEvent> {
    let mut fields = raw.split('|').map(str::trim);
    let status = fields.next()?;
    match status {
        "finished" => Some(ProgressEvent::TransferFinished),
        "downloading" => {
            let downloaded = parse_number(fields.next())?.max(0.0) as u64;
            let total = parse_number(fields.next());
            let estimate = parse_number(fields.next());
            let speed = parse_number(fields.next());
            let eta = parse_number(fields.next());
            Some(ProgressEvent::Transfer {
                downloaded,
                total: total.or(estimate).map(|value| value.max(0.0) as u64),
                speed,
                eta: eta.map(|value| value.max(0.0) as u64),
            })
        }
        _ => None,
    }
}

fn parse_number(value: Option<&str>) -> Option<f64> {
    value?.parse::<f64>().ok().filter(|number| number.is_finite())
}

pub fn is_partial_artifact(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("part" | "ytdl" | "tmp" | "temp")
    ) || path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.contains(".part-Frag") || name.contains(".temp."))
}
