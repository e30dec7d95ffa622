//! Encoder pipeline: runs `ab-av1 encode` at the chosen CRF, then swaps
//! the re-encoded file in place of the original.

use super::{Dispatcher, OutputTail, RateLimiter};
use crate::classify::{self, Action, ExitKind};
use crate::config::EncoderConfig;
use crate::events::{Event, EventBus, EncodingProgress};
use crate::parsers::abav1::{self, EncodeEvent};
use crate::process;
use crate::rules::{self, ArgContext};
use crate::state::StateMachine;
use crate::store::{
    EncodeCandidate, FailureCategory, FailureStage, NewFailure, Store, Video,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const AB_AV1_BIN: &str = "ab-av1";
const OUTPUT_TAIL_LINES: usize = 20;
const QUEUE_PREVIEW: usize = 5;

enum EncodeOutcome {
    Success,
    Failed(ExitKind, String),
    MissingOutput(String),
    TimedOut,
    Cancelled,
}

pub struct EncoderPipeline {
    store: Store,
    bus: EventBus,
    machine: StateMachine,
    config: EncoderConfig,
    temp_dir: PathBuf,
    dispatcher: Dispatcher,
}

impl EncoderPipeline {
    pub fn new(
        store: Store,
        bus: EventBus,
        config: EncoderConfig,
        temp_dir: PathBuf,
        dispatcher: Dispatcher,
    ) -> Self {
        let machine = StateMachine::new(store.clone(), bus.clone());
        Self {
            store,
            bus,
            machine,
            config,
            temp_dir,
            dispatcher,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut limiter = RateLimiter::new(self.config.rate_limit, self.config.interval());
        info!("Encoder pipeline started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            limiter.admit().await;

            let candidates = match self.store.encode_candidates(QUEUE_PREVIEW as i64).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    error!("Encoder refill failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let Some(candidate) = candidates.first().cloned() else {
                self.bus.emit(Event::EncoderIdle);
                tokio::select! {
                    _ = self.dispatcher.wait() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            self.emit_queue_snapshot(&candidates).await;
            self.process(candidate, &mut shutdown).await;
        }

        info!("Encoder pipeline stopped");
    }

    async fn emit_queue_snapshot(&self, candidates: &[EncodeCandidate]) {
        let queue_size = self
            .store
            .count_in_state(crate::state::VideoState::CrfSearched)
            .await
            .unwrap_or(0) as usize;
        self.bus.emit(Event::QueueChanged {
            pipeline: "encoder".into(),
            queue_size,
            next_videos: candidates.iter().map(|c| c.video.filename()).collect(),
        });
    }

    async fn process(&self, candidate: EncodeCandidate, shutdown: &mut watch::Receiver<bool>) {
        let EncodeCandidate { video, vmaf } = candidate;
        let filename = video.filename();
        self.bus.emit(Event::EncoderStarted {
            filename: filename.clone(),
        });

        let video = match self.machine.mark_as_encoding(&video).await {
            Ok(video) => video,
            Err(e) => {
                warn!("Video {} skipped by encoder: {}", video.id, e);
                return;
            }
        };

        let output = self.temp_dir.join(format!("{}.mkv", video.id));
        let base_args: Vec<String> = vec![
            "encode".into(),
            "--crf".into(),
            vmaf.crf.to_string(),
            "--output".into(),
            output.to_string_lossy().into_owned(),
            "--input".into(),
            video.path.clone(),
        ];
        let args = rules::build_args(&video, ArgContext::Encode, &vmaf.params, &base_args);
        info!("Encoding video {} at crf {}: {:?}", video.id, vmaf.crf, args);

        let outcome = match self.run_encode(&video, &args, &output, shutdown).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Encode of video {} errored: {}", video.id, e);
                EncodeOutcome::Failed(ExitKind::Exception, e.to_string())
            }
        };

        match outcome {
            EncodeOutcome::Success => {
                if let Err(e) = self.post_process(&video, &output).await {
                    error!("Post-processing failed for video {}: {}", video.id, e);
                    self.record_encode_failure(
                        &video,
                        FailureStage::PostProcess,
                        FailureCategory::FileOperations,
                        "POST_PROCESS",
                        &e.to_string(),
                        serde_json::json!({ "output": output.to_string_lossy() }),
                    )
                    .await;
                    self.bus.emit(Event::EncoderFailed { filename });
                    return;
                }

                match self.machine.mark_as_encoded(&video).await {
                    Ok(_) => {
                        info!("Video {} encoded and replaced", video.id);
                        self.bus.emit(Event::EncoderCompleted { filename });
                    }
                    Err(e) => error!("Video {} could not be marked encoded: {}", video.id, e),
                }
            }
            EncodeOutcome::TimedOut => {
                self.bus.emit(Event::EncoderTimedOut {
                    filename: filename.clone(),
                });
                self.record_encode_failure(
                    &video,
                    FailureStage::Encoding,
                    FailureCategory::Timeout,
                    "ENCODE_TIMEOUT",
                    &format!("encode exceeded {}s", self.config.timeout_secs),
                    serde_json::json!({ "args": args }),
                )
                .await;
                self.bus.emit(Event::EncoderFailed { filename });
            }
            EncodeOutcome::MissingOutput(tail) => {
                self.record_encode_failure(
                    &video,
                    FailureStage::Encoding,
                    FailureCategory::ProcessFailure,
                    "NO_OUTPUT",
                    "encode exited cleanly but produced no output file",
                    serde_json::json!({ "args": args, "output_tail": tail }),
                )
                .await;
                self.bus.emit(Event::EncoderFailed { filename });
            }
            EncodeOutcome::Failed(kind, tail) => {
                let verdict = classify::classify(kind);
                if verdict.action == Action::Pause {
                    warn!(
                        "Systemic encode failure on video {} ({}), continuing per policy",
                        video.id, verdict.message
                    );
                }
                let message = match abav1::extract_ffmpeg_error(&tail) {
                    Some(detail) => format!("{} ({})", verdict.message, detail),
                    None => verdict.message.to_string(),
                };
                self.record_encode_failure(
                    &video,
                    FailureStage::Encoding,
                    verdict.category,
                    &verdict.code,
                    &message,
                    serde_json::json!({
                        "command": AB_AV1_BIN,
                        "args": args,
                        "full_output_tail": tail,
                        "action": verdict.action,
                    }),
                )
                .await;
                self.bus.emit(Event::EncoderFailed { filename });
            }
            EncodeOutcome::Cancelled => {}
        }

        self.dispatcher.dispatch_available();
    }

    async fn run_encode(
        &self,
        video: &Video,
        args: &[String],
        output: &Path,
        shutdown: &mut watch::Receiver<bool>,
    ) -> crate::error::Result<EncodeOutcome> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        let mut child = process::spawn(AB_AV1_BIN, args)?;
        let mut tail = OutputTail::new(OUTPUT_TAIL_LINES);
        let mut progress = EncodingProgress {
            filename: video.filename(),
            ..Default::default()
        };
        let deadline = tokio::time::Instant::now() + self.config.timeout();

        loop {
            tokio::select! {
                line = child.next_line() => {
                    let Some(line) = line else { break };
                    tail.push(&line);
                    match abav1::parse_encode_line(&line) {
                        Some(EncodeEvent::Started { video_id }) => {
                            debug!("ab-av1 confirmed encode start for video {}", video_id);
                        }
                        Some(EncodeEvent::Progress { percent, fps, eta_seconds }) => {
                            let incoming = EncodingProgress {
                                filename: String::new(),
                                percent,
                                fps,
                                eta_seconds,
                            };
                            progress = EncodingProgress::merge(&progress, &incoming);
                            self.bus.emit(Event::EncoderProgress(progress.clone()));
                        }
                        // Observed but unused; the percent stream above is
                        // the authoritative progress signal.
                        Some(EncodeEvent::SizeProgress { .. }) | None => {}
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Encode of video {} timed out, killing child", video.id);
                    child.kill().await;
                    return Ok(EncodeOutcome::TimedOut);
                }
                _ = shutdown.changed() => {
                    warn!("Shutdown requested, killing encode of video {}", video.id);
                    child.kill().await;
                    return Ok(EncodeOutcome::Cancelled);
                }
            }
        }

        match child.wait().await? {
            ExitKind::Code(0) => {
                if tokio::fs::try_exists(output).await.unwrap_or(false) {
                    Ok(EncodeOutcome::Success)
                } else {
                    Ok(EncodeOutcome::MissingOutput(tail.to_text()))
                }
            }
            kind => Ok(EncodeOutcome::Failed(kind, tail.to_text())),
        }
    }

    /// Move the finished encode next to the original, hand it to the
    /// library service for refresh, then replace the original.
    async fn post_process(&self, video: &Video, encoded: &Path) -> crate::error::Result<()> {
        let original = PathBuf::from(&video.path);
        let intermediate = intermediate_path(&original);

        move_file(encoded, &intermediate).await?;
        info!(
            "Moved encode for video {} to {:?}",
            video.id, intermediate
        );

        // The refresh/rename round-trip with the owning service happens
        // here; the core only logs the hand-off point.
        debug!(
            "Requesting {} refresh for service item {}",
            video.service_type, video.service_id
        );

        tokio::fs::rename(&intermediate, &original).await?;
        info!("Replaced original file {:?}", original);
        Ok(())
    }

    async fn record_encode_failure(
        &self,
        video: &Video,
        stage: FailureStage,
        category: FailureCategory,
        code: &str,
        message: &str,
        context: serde_json::Value,
    ) {
        warn!("Encode failure for video {}: {}", video.id, message);
        let failure = NewFailure {
            video_id: video.id,
            stage,
            category,
            code: code.to_string(),
            message: message.to_string(),
            system_context: context,
        };
        if let Err(e) = self.store.record_failure(&failure).await {
            error!("Could not record encode failure for {}: {}", video.id, e);
        }
    }
}

/// `/dir/name.mkv` -> `/dir/name.reencoded.mkv`
fn intermediate_path(original: &Path) -> PathBuf {
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = original
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    original.with_file_name(format!("{}.reencoded{}", stem, ext))
}

/// Rename, falling back to copy + delete across filesystems. A failed
/// delete after a good copy is only a warning.
async fn move_file(from: &Path, to: &Path) -> crate::error::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            debug!("Rename {:?} -> {:?} crossed devices, copying", from, to);
            tokio::fs::copy(from, to).await?;
            if let Err(e) = tokio::fs::remove_file(from).await {
                warn!("Could not remove {:?} after copy: {}", from, e);
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn is_cross_device(e: &std::io::Error) -> bool {
    // EXDEV; stable ErrorKind has no variant for it yet.
    e.raw_os_error() == Some(18)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intermediate_sits_next_to_the_original() {
        assert_eq!(
            intermediate_path(Path::new("/tv/Show/S01/e1.mkv")),
            PathBuf::from("/tv/Show/S01/e1.reencoded.mkv")
        );
        assert_eq!(
            intermediate_path(Path::new("/movies/bare")),
            PathBuf::from("/movies/bare.reencoded")
        );
    }

    #[tokio::test]
    async fn move_file_renames_within_a_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.mkv");
        let to = dir.path().join("b.mkv");
        tokio::fs::write(&from, b"payload").await.unwrap();

        move_file(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn post_process_replaces_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("show.mkv");
        let encoded = dir.path().join("42.mkv");
        tokio::fs::write(&original, b"old").await.unwrap();
        tokio::fs::write(&encoded, b"new").await.unwrap();

        let store = Store::in_memory().await.unwrap();
        let video = store
            .upsert_video(
                original.to_str().unwrap(),
                3,
                crate::store::ServiceType::Radarr,
                "7",
                None,
            )
            .await
            .unwrap();

        let pipeline = EncoderPipeline::new(
            store,
            EventBus::new(16),
            EncoderConfig::default(),
            dir.path().to_path_buf(),
            Dispatcher::new(),
        );
        pipeline.post_process(&video, &encoded).await.unwrap();

        assert_eq!(std::fs::read(&original).unwrap(), b"new");
        assert!(!encoded.exists());
        assert!(!dir.path().join("show.reencoded.mkv").exists());
    }
}
