//! The composition worker (component C4).
//!
//! One invocation of [`compose_videos`] performs one task, walking five
//! stages with a fixed progress budget:
//!
//! | stage | range  | work |
//! |-------|--------|------|
//! | S1    | 0–30   | resolve and verify each source video |
//! | S2    | 30–70  | decode-probe each clip |
//! | S3    | 70–80  | build the concat timeline |
//! | S4    | 80–95  | encode the output container |
//! | S5    | 95–100 | register the output artifact |
//!
//! The cancel signal is polled before every source lookup, before every
//! probe, before the merge, before the output file is opened, and on every
//! encoder progress event. The supervisor in the facade guarantees the
//! finalizer (scratch and partial-output removal, in-memory cleanup) runs on
//! every exit path, including panics.

use std::path::{Path, PathBuf};

use ffmpeg_sidecar::command::FfmpegCommand;
use ffmpeg_sidecar::event::{FfmpegEvent, LogLevel};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::manager::WorkerContext;
use crate::repository::VideoMeta;
use crate::types::{TaskId, WorkerError};

/// Per-task scratch directory (concat lists, temporary artifacts).
pub fn scratch_dir(output_root: &Path, task_id: TaskId) -> PathBuf {
    output_root.join("tmp").join(task_id.to_string())
}

/// Absolute path of the task's output artifact. Unique per task, so no
/// cross-task file coordination is needed.
pub fn output_path(output_root: &Path, task_id: TaskId) -> PathBuf {
    output_root
        .join("composed")
        .join(format!("composed_{task_id}.mp4"))
}

/// The path stored on the task record, relative to the output root.
pub(crate) fn output_file_ref(task_id: TaskId) -> String {
    format!("composed/composed_{task_id}.mp4")
}

/// Run one composition task to a terminal state.
pub async fn compose_videos(ctx: WorkerContext) -> Result<(), WorkerError> {
    let task_id = ctx.task_id();
    let videos = ctx.manager().video_repository();
    let output_root = ctx.manager().config().output_root.clone();

    // ── S1: verify inputs (0 → 30) ───────────────────────────────────────────
    let ids = ctx.video_ids().to_vec();
    let total = ids.len();
    let mut sources: Vec<VideoMeta> = Vec::with_capacity(total);
    let mut total_duration = 0f64;

    for (index, video_id) in ids.iter().enumerate() {
        if ctx.is_cancelled() {
            ctx.finish_cancelled().await;
            return Ok(());
        }
        let meta = match videos.get(*video_id).await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                warn!(task_id = %task_id, video_id, "source video missing or inactive");
                continue;
            }
            Err(e) => {
                warn!(task_id = %task_id, video_id, error = %e, "video lookup failed");
                continue;
            }
        };
        ctx.report(
            verify_progress(index, total),
            format!("正在验证视频文件 ({}/{}): {}", index + 1, total, meta.title),
        )
        .await;
        if !tokio::fs::try_exists(&meta.file_path).await.unwrap_or(false) {
            warn!(
                task_id = %task_id,
                path = %meta.file_path.display(),
                "video file not found on disk"
            );
            continue;
        }
        if let Some(duration) = meta.duration_secs {
            total_duration += duration;
        }
        sources.push(meta);
    }

    if sources.len() < 2 {
        return Err(WorkerError::InvalidInput(
            "not enough valid source videos".into(),
        ));
    }
    ctx.report(30, "视频文件验证完成，准备开始合成...").await;

    // ── S2: load clips (30 → 70) ─────────────────────────────────────────────
    let total = sources.len();
    let mut clips: Vec<VideoMeta> = Vec::with_capacity(total);
    for (index, meta) in sources.into_iter().enumerate() {
        if ctx.is_cancelled() {
            ctx.finish_cancelled().await;
            return Ok(());
        }
        ctx.report(
            load_progress(index, total),
            format!("正在加载视频片段 ({}/{}): {}", index + 1, total, meta.title),
        )
        .await;
        let path = meta.file_path.clone();
        let probe = tokio::task::spawn_blocking(move || probe_clip(&path))
            .await
            .map_err(|e| WorkerError::Encoder(format!("probe worker died: {e}")))?;
        match probe {
            Ok(()) => clips.push(meta),
            Err(e) => {
                warn!(task_id = %task_id, video_id = meta.id, error = %e, "failed to open clip");
            }
        }
    }
    if clips.is_empty() {
        return Err(WorkerError::InvalidInput("no decodable source clips".into()));
    }

    // ── S3: merge timeline (70 → 80) ─────────────────────────────────────────
    if ctx.is_cancelled() {
        ctx.finish_cancelled().await;
        return Ok(());
    }
    ctx.report(70, "正在合并视频片段...").await;
    let scratch = scratch_dir(&output_root, task_id);
    tokio::fs::create_dir_all(&scratch).await?;
    let list_path = scratch.join("concat.txt");
    let mut list = String::new();
    for clip in &clips {
        list.push_str(&concat_entry(&clip.file_path));
    }
    tokio::fs::write(&list_path, list).await?;

    // ── S4: encode (80 → 95) ─────────────────────────────────────────────────
    if ctx.is_cancelled() {
        ctx.finish_cancelled().await;
        return Ok(());
    }
    ctx.report(80, "正在写入合成视频文件...").await;
    let output = output_path(&output_root, task_id);
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let cancel = ctx.cancel_receiver();
    let encode_list = list_path.clone();
    let encode_output = output.clone();
    let encoder =
        tokio::task::spawn_blocking(move || encode_concat(&encode_list, &encode_output, cancel, event_tx));

    let mut last_reported = 80u8;
    while let Some(EncodeEvent::Progress(secs)) = event_rx.recv().await {
        let progress = encode_progress(secs, total_duration);
        if progress > last_reported {
            last_reported = progress;
            ctx.report(progress, "正在写入合成视频文件...").await;
        }
    }

    let outcome = encoder
        .await
        .map_err(|e| WorkerError::Encoder(format!("encoder worker died: {e}")))??;
    if outcome == EncodeOutcome::Cancelled {
        remove_partial(&output).await;
        ctx.finish_cancelled().await;
        return Ok(());
    }

    // ── S5: finalize (95 → 100) ──────────────────────────────────────────────
    if ctx.is_cancelled() {
        remove_partial(&output).await;
        ctx.finish_cancelled().await;
        return Ok(());
    }
    ctx.report(95, "正在登记输出文件...").await;
    let size = tokio::fs::metadata(&output).await.map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        return Err(WorkerError::Encoder("output file missing".into()));
    }
    let duration_secs = (total_duration > 0.0).then(|| total_duration.round() as i64);
    ctx.complete(output_file_ref(task_id), duration_secs).await;
    info!(task_id = %task_id, output = %output.display(), size, "composition finished");
    Ok(())
}

// ── Encoder plumbing ─────────────────────────────────────────────────────────

#[derive(Debug)]
enum EncodeEvent {
    Progress(f64),
}

#[derive(Debug, PartialEq, Eq)]
enum EncodeOutcome {
    Finished,
    Cancelled,
}

/// Concatenate the listed clips into one H.264/AAC container.
///
/// Runs on a blocking thread. Checks the cancel signal on every encoder
/// event (ffmpeg emits progress roughly twice a second); on cancellation the
/// child is killed and the partial output is left for the caller to delete.
fn encode_concat(
    list_path: &Path,
    output_path: &Path,
    cancel: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<EncodeEvent>,
) -> Result<EncodeOutcome, WorkerError> {
    let list = path_str(list_path)?;
    let out = path_str(output_path)?;

    let mut child = FfmpegCommand::new()
        .hide_banner()
        .overwrite()
        .args(["-f", "concat", "-safe", "0"])
        .input(list)
        .args(["-c:v", "libx264", "-c:a", "aac", "-movflags", "+faststart"])
        .output(out)
        .spawn()
        .map_err(|e| WorkerError::Encoder(e.to_string()))?;

    let mut last_error: Option<String> = None;
    let mut cancelled = false;
    let iter = child
        .iter()
        .map_err(|e| WorkerError::Encoder(e.to_string()))?;
    for event in iter {
        if *cancel.borrow() {
            cancelled = true;
            if let Err(e) = child.kill() {
                warn!(error = %e, "failed to kill encoder child");
            }
            break;
        }
        match event {
            FfmpegEvent::Progress(p) => {
                if let Some(secs) = parse_timestamp(&p.time) {
                    let _ = events.send(EncodeEvent::Progress(secs));
                }
            }
            FfmpegEvent::Log(LogLevel::Error | LogLevel::Fatal, msg) => {
                warn!(message = %msg, "encoder error output");
                last_error = Some(msg);
            }
            FfmpegEvent::Error(msg) => {
                last_error = Some(msg);
            }
            FfmpegEvent::Done => debug!("encoder finished writing"),
            _ => {}
        }
    }
    drop(events);

    if cancelled {
        let _ = child.wait();
        return Ok(EncodeOutcome::Cancelled);
    }
    let status = child.wait().map_err(WorkerError::Io)?;
    if status.success() {
        Ok(EncodeOutcome::Finished)
    } else {
        Err(WorkerError::Encoder(last_error.unwrap_or_else(|| {
            "ffmpeg exited with an error".into()
        })))
    }
}

/// Decode a single frame to the null muxer to prove the clip is readable.
fn probe_clip(path: &Path) -> Result<(), String> {
    let input = path
        .to_str()
        .ok_or_else(|| "clip path is not valid UTF-8".to_owned())?;
    let mut child = FfmpegCommand::new()
        .hide_banner()
        .input(input)
        .args(["-frames:v", "1", "-f", "null"])
        .output("-")
        .spawn()
        .map_err(|e| e.to_string())?;

    let mut last_error: Option<String> = None;
    let iter = child.iter().map_err(|e| e.to_string())?;
    for event in iter {
        match event {
            FfmpegEvent::Error(msg) | FfmpegEvent::Log(LogLevel::Error | LogLevel::Fatal, msg) => {
                last_error = Some(msg);
            }
            _ => {}
        }
    }
    let status = child.wait().map_err(|e| e.to_string())?;
    if status.success() {
        Ok(())
    } else {
        Err(last_error.unwrap_or_else(|| "ffmpeg could not decode the clip".into()))
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!(path = %path.display(), "partial output removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial output"),
    }
}

fn path_str(path: &Path) -> Result<&str, WorkerError> {
    path.to_str()
        .ok_or_else(|| WorkerError::InvalidInput(format!("path is not valid UTF-8: {}", path.display())))
}

// ── Stage math ───────────────────────────────────────────────────────────────

/// S1 progress for the clip at `index` out of `total`.
fn verify_progress(index: usize, total: usize) -> u8 {
    (index * 30 / total.max(1)) as u8
}

/// S2 progress for the clip at `index` out of `total`.
fn load_progress(index: usize, total: usize) -> u8 {
    30 + (index * 40 / total.max(1)) as u8
}

/// S4 progress for `encoded_secs` out of `total_secs` of timeline.
fn encode_progress(encoded_secs: f64, total_secs: f64) -> u8 {
    if total_secs <= 0.0 {
        return 80;
    }
    let fraction = (encoded_secs / total_secs).clamp(0.0, 1.0);
    80 + (fraction * 15.0) as u8
}

/// Parse an ffmpeg `HH:MM:SS.cc` progress timestamp into seconds.
fn parse_timestamp(time: &str) -> Option<f64> {
    let mut parts = time.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// One line of an ffconcat list file. Single quotes inside the path use the
/// close-escape-reopen form the concat demuxer expects.
fn concat_entry(path: &Path) -> String {
    let escaped = path.to_string_lossy().replace('\'', "'\\''");
    format!("file '{escaped}'\n")
}

#[cfg(test)]
mod test {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn stage_ranges_stay_in_budget() {
        for total in 1..=10usize {
            for index in 0..total {
                let v = verify_progress(index, total);
                assert!(v < 30, "verify {v} out of range");
                let l = load_progress(index, total);
                assert!((30..70).contains(&l), "load {l} out of range");
            }
        }
        assert_eq!(verify_progress(0, 5), 0);
        assert_eq!(load_progress(0, 5), 30);
    }

    #[test]
    fn encode_progress_maps_onto_80_95() {
        assert_eq!(encode_progress(0.0, 100.0), 80);
        assert_eq!(encode_progress(50.0, 100.0), 87);
        assert_eq!(encode_progress(100.0, 100.0), 95);
        // Encoder running past the estimated duration stays clamped.
        assert_eq!(encode_progress(250.0, 100.0), 95);
        // Unknown total duration pins the stage start.
        assert_eq!(encode_progress(42.0, 0.0), 80);
    }

    #[test]
    fn timestamps_parse() {
        assert_eq!(parse_timestamp("00:00:00.00"), Some(0.0));
        assert_eq!(parse_timestamp("00:01:30.50"), Some(90.5));
        assert_eq!(parse_timestamp("02:00:00.00"), Some(7200.0));
        assert_eq!(parse_timestamp("N/A"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn concat_entries_escape_quotes() {
        let plain = concat_entry(Path::new("/media/videos/a.mp4"));
        assert_eq!(plain, "file '/media/videos/a.mp4'\n");
        let quoted = concat_entry(Path::new("/media/it's here.mp4"));
        assert_eq!(quoted, "file '/media/it'\\''s here.mp4'\n");
    }

    #[test]
    fn output_paths_derive_from_task_id() {
        let id = Uuid::new_v4();
        let root = Path::new("/srv/media");
        assert_eq!(
            output_path(root, id),
            root.join("composed").join(format!("composed_{id}.mp4"))
        );
        assert_eq!(output_file_ref(id), format!("composed/composed_{id}.mp4"));
        assert_eq!(scratch_dir(root, id), root.join("tmp").join(id.to_string()));
    }
}
