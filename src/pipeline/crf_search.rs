//! CRF-searcher pipeline: runs `ab-av1 crf-search` over `analyzed`
//! videos, ingests the VMAF samples it reports, and elects the sample
//! that will drive the encode.

use super::{Dispatcher, OutputTail, RateLimiter, STAGE_RETRY_BUDGET};
use crate::classify::{self, Action, ExitKind};
use crate::config::CrfSearchConfig;
use crate::events::{Event, EventBus, SearchProgress};
use crate::hints;
use crate::parsers::abav1;
use crate::process;
use crate::rules::{self, ArgContext};
use crate::state::{StateMachine, VideoState};
use crate::store::{
    FailureCategory, FailureStage, NewFailure, NewVmaf, Store, Video,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const AB_AV1_BIN: &str = "ab-av1";
const OUTPUT_TAIL_LINES: usize = 20;

enum SearchOutcome {
    /// Exit 0 with at least one sample; carries the last sample's row id.
    Chosen(i64),
    /// Exit 0 but no sample line was observed.
    NoSamples,
    Failed(ExitKind, String),
    Cancelled,
}

pub struct CrfSearchPipeline {
    store: Store,
    bus: EventBus,
    machine: StateMachine,
    config: CrfSearchConfig,
    temp_dir: PathBuf,
    dispatcher: Dispatcher,
    downstream: Dispatcher,
}

impl CrfSearchPipeline {
    pub fn new(
        store: Store,
        bus: EventBus,
        config: CrfSearchConfig,
        temp_dir: PathBuf,
        dispatcher: Dispatcher,
        downstream: Dispatcher,
    ) -> Self {
        let machine = StateMachine::new(store.clone(), bus.clone());
        Self {
            store,
            bus,
            machine,
            config,
            temp_dir,
            dispatcher,
            downstream,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut limiter = RateLimiter::new(self.config.rate_limit, self.config.interval());
        info!("CRF-search pipeline started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            limiter.admit().await;

            let next = match self.store.next_analyzed(1).await {
                Ok(mut batch) => batch.pop(),
                Err(e) => {
                    error!("CRF-search refill failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            let Some(video) = next else {
                self.bus.emit(Event::CrfSearchIdle);
                tokio::select! {
                    _ = self.dispatcher.wait() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            self.process(video, &mut shutdown).await;
        }

        info!("CRF-search pipeline stopped");
    }

    async fn process(&self, video: Video, shutdown: &mut watch::Receiver<bool>) {
        let filename = video.filename();
        self.bus.emit(Event::CrfSearchStarted {
            filename: filename.clone(),
        });

        let video = match self.machine.mark_as_crf_searching(&video).await {
            Ok(video) => video,
            Err(e) => {
                warn!("Video {} skipped: {}", video.id, e);
                return;
            }
        };

        let target = rules::vmaf_target(&video) as f64;
        let success = match self.search_with_retry(&video, target, shutdown).await {
            Ok(success) => success,
            Err(e) => {
                error!("CRF search for video {} errored: {}", video.id, e);
                false
            }
        };

        self.bus.emit(Event::CrfSearchCompleted {
            filename,
            success,
        });
        if success {
            self.downstream.dispatch_available();
        }
        self.dispatcher.dispatch_available();
    }

    /// One search, then a single retry over the default range when the
    /// first run yields no samples.
    async fn search_with_retry(
        &self,
        video: &Video,
        target: f64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> crate::error::Result<bool> {
        let own = self.store.own_samples(video.id).await?;
        let siblings = self.store.sibling_samples(video).await?;
        let (min_crf, max_crf) = hints::crf_range(&own, &siblings, target, false);
        debug!(
            "Video {}: target VMAF {} within crf [{}, {}]",
            video.id, target, min_crf, max_crf
        );

        match self
            .run_search(video, target, min_crf, max_crf, &[], shutdown)
            .await?
        {
            SearchOutcome::Chosen(vmaf_id) => {
                self.finish(video, vmaf_id).await?;
                return Ok(true);
            }
            SearchOutcome::Cancelled => return Ok(false),
            SearchOutcome::NoSamples => {
                self.record_search_failure(
                    video,
                    FailureCategory::CrfOptimization,
                    "NO_SAMPLES",
                    "crf-search finished without reporting any usable sample",
                    serde_json::json!({ "target": target }),
                )
                .await;
            }
            SearchOutcome::Failed(kind, tail) => {
                self.handle_process_failure(video, kind, tail).await;
                return Ok(false);
            }
        }

        // Retry once: default bounds plus any configured preset fallback.
        info!("Retrying crf-search for video {} with default bounds", video.id);
        self.revive_for_retry(video.id).await?;
        let (min_crf, max_crf) = hints::crf_range(&own, &siblings, target, true);
        let fallback = self.config.preset_fallback.clone();

        match self
            .run_search(video, target, min_crf, max_crf, &fallback, shutdown)
            .await?
        {
            SearchOutcome::Chosen(vmaf_id) => {
                self.finish(video, vmaf_id).await?;
                Ok(true)
            }
            SearchOutcome::Cancelled => Ok(false),
            SearchOutcome::NoSamples => {
                self.record_search_failure(
                    video,
                    FailureCategory::PresetRetry,
                    "RETRY_NO_SAMPLES",
                    "crf-search retry with default bounds also produced no samples",
                    serde_json::json!({ "target": target, "fallback": fallback }),
                )
                .await;
                Ok(false)
            }
            SearchOutcome::Failed(kind, tail) => {
                self.handle_process_failure(video, kind, tail).await;
                Ok(false)
            }
        }
    }

    async fn run_search(
        &self,
        video: &Video,
        target: f64,
        min_crf: f64,
        max_crf: f64,
        overrides: &[String],
        shutdown: &mut watch::Receiver<bool>,
    ) -> crate::error::Result<SearchOutcome> {
        let search_dir = self.temp_dir.join(format!("crf-search-{}", video.id));
        tokio::fs::create_dir_all(&search_dir).await?;

        let base_args: Vec<String> = vec![
            "crf-search".into(),
            "-i".into(),
            video.path.clone(),
            "--min-vmaf".into(),
            target.to_string(),
            "--temp-dir".into(),
            search_dir.to_string_lossy().into_owned(),
            "--min-crf".into(),
            min_crf.to_string(),
            "--max-crf".into(),
            max_crf.to_string(),
        ];
        let args = rules::build_args(video, ArgContext::CrfSearch, overrides, &base_args);
        let params = rules::build_fragment(video, ArgContext::CrfSearch, overrides);

        let mut child = process::spawn(AB_AV1_BIN, &args)?;
        let mut tail = OutputTail::new(OUTPUT_TAIL_LINES);
        let mut last_vmaf_id: Option<i64> = None;
        let filename = video.filename();

        loop {
            tokio::select! {
                line = child.next_line() => {
                    let Some(line) = line else { break };
                    tail.push(&line);
                    if let Some(sample) = abav1::parse_crf_sample(&line) {
                        match self.ingest_sample(video, &sample, &params).await {
                            Ok(vmaf_id) => {
                                last_vmaf_id = Some(vmaf_id);
                                self.bus.emit(Event::CrfSearchProgress(SearchProgress {
                                    filename: filename.clone(),
                                    percent: sample.percent,
                                    crf: sample.crf,
                                    score: sample.score,
                                }));
                            }
                            Err(e) => error!(
                                "Failed to persist sample for video {}: {}",
                                video.id, e
                            ),
                        }
                    }
                }
                _ = shutdown.changed() => {
                    warn!("Shutdown requested, killing crf-search for video {}", video.id);
                    child.kill().await;
                    return Ok(SearchOutcome::Cancelled);
                }
            }
        }

        match child.wait().await? {
            ExitKind::Code(0) => match last_vmaf_id {
                Some(vmaf_id) => Ok(SearchOutcome::Chosen(vmaf_id)),
                None => Ok(SearchOutcome::NoSamples),
            },
            kind => Ok(SearchOutcome::Failed(kind, tail.to_text())),
        }
    }

    async fn ingest_sample(
        &self,
        video: &Video,
        sample: &abav1::CrfSample,
        params: &[String],
    ) -> crate::error::Result<i64> {
        let savings = sample
            .size
            .map(|size| video.size - size)
            .or_else(|| Some((video.size as f64 * (100.0 - sample.percent) / 100.0) as i64));

        let vmaf = self
            .store
            .upsert_vmaf(
                video.id,
                &NewVmaf {
                    crf: sample.crf,
                    score: sample.score,
                    percent: sample.percent,
                    size: sample.size,
                    time: sample.time_seconds,
                    savings,
                    params: params.to_vec(),
                },
            )
            .await?;
        self.bus.emit(Event::VmafUpserted { id: vmaf.id });
        Ok(vmaf.id)
    }

    /// The external binary reports its accepted sample last; that one
    /// drives the encode.
    async fn finish(&self, video: &Video, vmaf_id: i64) -> crate::error::Result<()> {
        self.store.choose_vmaf(video.id, vmaf_id).await?;
        let video = self
            .store
            .video(video.id)
            .await?
            .ok_or(crate::error::ReforgeError::VideoNotFound(video.id))?;
        self.machine.mark_as_crf_searched(&video).await?;
        Ok(())
    }

    /// A failure record moved the video to `failed`; bring it back to
    /// `crf_searching` for the in-message retry, keeping the audit trail.
    async fn revive_for_retry(&self, video_id: i64) -> crate::error::Result<()> {
        self.store.resolve_failures_for_video(video_id).await?;
        self.store
            .update_video_state(video_id, VideoState::CrfSearching)
            .await?;
        Ok(())
    }

    async fn record_search_failure(
        &self,
        video: &Video,
        category: FailureCategory,
        code: &str,
        message: &str,
        context: serde_json::Value,
    ) {
        warn!("CRF search failure for video {}: {}", video.id, message);
        let failure = NewFailure {
            video_id: video.id,
            stage: FailureStage::CrfSearch,
            category,
            code: code.to_string(),
            message: message.to_string(),
            system_context: context,
        };
        if let Err(e) = self.store.record_failure(&failure).await {
            error!("Could not record crf-search failure for {}: {}", video.id, e);
        }
    }

    /// Classify a non-zero exit and either leave the video failed or roll
    /// it back to `analyzed` for another attempt. The classifier's pause
    /// verdict is recorded, never acted on.
    async fn handle_process_failure(&self, video: &Video, kind: ExitKind, tail: String) {
        let verdict = classify::classify(kind);
        if verdict.action == Action::Pause {
            warn!(
                "Systemic crf-search failure on video {} ({}), continuing per policy",
                video.id, verdict.message
            );
        }

        self.record_search_failure(
            video,
            verdict.category,
            &verdict.code,
            verdict.message,
            serde_json::json!({
                "action": verdict.action,
                "output_tail": tail,
            }),
        )
        .await;

        if verdict.category.is_systemic() {
            return;
        }

        let attempts = self
            .store
            .unresolved_failure_count(video.id, FailureStage::CrfSearch)
            .await
            .unwrap_or(STAGE_RETRY_BUDGET);
        if attempts < STAGE_RETRY_BUDGET {
            debug!(
                "Rolling video {} back to analyzed (attempt {}/{})",
                video.id, attempts, STAGE_RETRY_BUDGET
            );
            if let Err(e) = self
                .store
                .update_video_state(video.id, VideoState::Analyzed)
                .await
            {
                error!("Could not roll back video {}: {}", video.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ServiceType;

    async fn searched_video(store: &Store) -> Video {
        let video = store
            .upsert_video("/tv/Show/S01/e1.mkv", 1_000_000, ServiceType::Sonarr, "9", None)
            .await
            .unwrap();
        store
            .update_video_state(video.id, VideoState::Analyzed)
            .await
            .unwrap();
        store
            .update_video_state(video.id, VideoState::CrfSearching)
            .await
            .unwrap()
    }

    fn pipeline(store: &Store, bus: &EventBus) -> CrfSearchPipeline {
        CrfSearchPipeline::new(
            store.clone(),
            bus.clone(),
            CrfSearchConfig::default(),
            std::env::temp_dir(),
            Dispatcher::new(),
            Dispatcher::new(),
        )
    }

    #[tokio::test]
    async fn ingesting_a_sample_computes_savings_from_percent() {
        let store = Store::in_memory().await.unwrap();
        let bus = EventBus::new(16);
        let pipeline = pipeline(&store, &bus);
        let video = searched_video(&store).await;

        let sample = abav1::CrfSample {
            crf: 24.0,
            score: 95.5,
            percent: 40.0,
            size: None,
            time_seconds: None,
        };
        pipeline
            .ingest_sample(&video, &sample, &["--pix-format".into()])
            .await
            .unwrap();

        let vmafs = store.vmafs_for_video(video.id).await.unwrap();
        assert_eq!(vmafs.len(), 1);
        // 1_000_000 input bytes at 40% predicted size saves 600_000.
        assert_eq!(vmafs[0].savings, Some(600_000));
        assert_eq!(vmafs[0].params, vec!["--pix-format".to_string()]);
    }

    #[tokio::test]
    async fn finish_elects_the_sample_and_advances() {
        let store = Store::in_memory().await.unwrap();
        let bus = EventBus::new(16);
        let pipeline = pipeline(&store, &bus);
        let video = searched_video(&store).await;

        let sample = abav1::CrfSample {
            crf: 26.0,
            score: 95.0,
            percent: 30.0,
            size: Some(300_000),
            time_seconds: Some(600),
        };
        let vmaf_id = pipeline.ingest_sample(&video, &sample, &[]).await.unwrap();
        pipeline.finish(&video, vmaf_id).await.unwrap();

        let video = store.video(video.id).await.unwrap().unwrap();
        assert_eq!(video.state, VideoState::CrfSearched);
        assert_eq!(video.chosen_vmaf_id, Some(vmaf_id));
    }

    #[tokio::test]
    async fn systemic_failures_keep_the_video_failed() {
        let store = Store::in_memory().await.unwrap();
        let bus = EventBus::new(16);
        let pipeline = pipeline(&store, &bus);
        let video = searched_video(&store).await;

        pipeline
            .handle_process_failure(&video, ExitKind::Code(2), "bad flag".into())
            .await;

        let video = store.video(video.id).await.unwrap().unwrap();
        assert_eq!(video.state, VideoState::Failed);
        let failures = store.failures_for_video(video.id).await.unwrap();
        assert_eq!(failures[0].category, FailureCategory::Configuration);
    }

    #[tokio::test]
    async fn recoverable_failures_roll_back_to_analyzed() {
        let store = Store::in_memory().await.unwrap();
        let bus = EventBus::new(16);
        let pipeline = pipeline(&store, &bus);
        let video = searched_video(&store).await;

        pipeline
            .handle_process_failure(&video, ExitKind::Code(1), "encoder blew up".into())
            .await;

        let video = store.video(video.id).await.unwrap().unwrap();
        assert_eq!(video.state, VideoState::Analyzed);
    }
}
