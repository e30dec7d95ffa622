//! Analyzer pipeline: batches `needs_analysis` videos through mediainfo
//! and promotes them to `analyzed`.

use super::{Dispatcher, OutputTail, RateLimiter};
use crate::config::AnalyzerConfig;
use crate::events::{Event, EventBus};
use crate::parsers::mediainfo::{self, MediaProbe};
use crate::process;
use crate::rules;
use crate::state::{StateMachine, VideoState};
use crate::store::{
    FailureCategory, FailureStage, LibraryIndex, MediaAttributes, NewFailure, Store, Video,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const MEDIAINFO_BIN: &str = "mediainfo";
const QUEUE_PREVIEW: usize = 5;

/// Rolling throughput window and emission cadence for analyzer telemetry.
const MONITOR_WINDOW: Duration = Duration::from_secs(120);
const MONITOR_EMIT_INTERVAL: Duration = Duration::from_secs(30);

/// Rolling-window throughput tracking for one analyzer instance.
///
/// Dynamic rate-limit and batch-size adjustment is disabled; the monitor
/// only reports averages so an operator can tune by hand.
pub struct PerformanceMonitor {
    samples: VecDeque<(Instant, f64)>,
    last_emit: Instant,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            last_emit: Instant::now(),
        }
    }

    pub fn record(&mut self, throughput: f64) {
        self.samples.push_back((Instant::now(), throughput));
        self.prune();
    }

    fn prune(&mut self) {
        let Some(cutoff) = Instant::now().checked_sub(MONITOR_WINDOW) else {
            return;
        };
        while matches!(self.samples.front(), Some((at, _)) if *at < cutoff) {
            self.samples.pop_front();
        }
    }

    pub fn average_throughput(&mut self) -> f64 {
        self.prune();
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|(_, t)| t).sum::<f64>() / self.samples.len() as f64
    }

    fn maybe_emit(&mut self, bus: &EventBus) {
        if self.last_emit.elapsed() >= MONITOR_EMIT_INTERVAL {
            self.last_emit = Instant::now();
            let throughput = self.average_throughput();
            bus.emit(Event::AnalyzerProgress { throughput });
        }
    }
}

pub struct AnalyzerPipeline {
    store: Store,
    bus: EventBus,
    machine: StateMachine,
    config: Arc<RwLock<AnalyzerConfig>>,
    dispatcher: Dispatcher,
    downstream: Dispatcher,
}

impl AnalyzerPipeline {
    pub fn new(
        store: Store,
        bus: EventBus,
        config: AnalyzerConfig,
        dispatcher: Dispatcher,
        downstream: Dispatcher,
    ) -> Self {
        let machine = StateMachine::new(store.clone(), bus.clone());
        Self {
            store,
            bus,
            machine,
            config: Arc::new(RwLock::new(config)),
            dispatcher,
            downstream,
        }
    }

    /// Operator tuning endpoint; values are clamped to supported ranges.
    pub async fn set_tuning(&self, rate_limit: u32, batch_size: usize) {
        let mut config = self.config.write().await;
        config.apply_override(rate_limit, batch_size);
        info!(
            "Analyzer tuning set to rate_limit={} batch_size={}",
            config.rate_limit, config.mediainfo_batch_size
        );
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let (allowed, interval) = {
            let config = self.config.read().await;
            (config.rate_limit, config.interval())
        };
        let mut limiter = RateLimiter::new(allowed, interval);
        let mut monitor = PerformanceMonitor::new();
        info!("Analyzer pipeline started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            limiter.admit().await;

            let batch_size = self.config.read().await.mediainfo_batch_size;
            let batch = match self.store.next_needs_analysis(batch_size as i64).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!("Analyzer refill failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            if batch.is_empty() {
                self.bus.emit(Event::AnalyzerIdle);
                tokio::select! {
                    _ = self.dispatcher.wait() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            self.emit_queue_snapshot(&batch).await;

            let started = Instant::now();
            let processed = self.process_batch(batch).await;
            let elapsed = started.elapsed().as_secs_f64().max(0.001);
            let throughput = processed as f64 / elapsed;
            monitor.record(throughput);
            monitor.maybe_emit(&self.bus);

            self.bus.emit(Event::AnalyzerCompleted {
                batch_size: processed,
                throughput,
            });
        }

        info!("Analyzer pipeline stopped");
    }

    async fn emit_queue_snapshot(&self, batch: &[Video]) {
        let queue_size = self
            .store
            .count_in_state(VideoState::NeedsAnalysis)
            .await
            .unwrap_or(0) as usize;
        let next_videos: Vec<String> = batch
            .iter()
            .take(QUEUE_PREVIEW)
            .map(|v| v.filename())
            .collect();
        self.bus.emit(Event::AnalyzerStarted {
            batch_size: batch.len(),
            queue_size,
            next_videos: next_videos.clone(),
        });
        self.bus.emit(Event::QueueChanged {
            pipeline: "analyzer".into(),
            queue_size,
            next_videos,
        });
    }

    /// Probe one batch and upsert the results. Returns how many videos
    /// were handled (including skips and failures).
    async fn process_batch(&self, batch: Vec<Video>) -> usize {
        let mut to_probe = Vec::new();
        for video in batch {
            // Already analyzed once and never reset: no need to probe again.
            if video.has_complete_media_info() {
                debug!("Video {} already has media info, skipping probe", video.id);
                if let Err(e) = self.machine.mark_as_analyzed(&video).await {
                    warn!("Could not promote pre-analyzed video {}: {}", video.id, e);
                }
                continue;
            }
            to_probe.push(video);
        }

        if to_probe.is_empty() {
            return 0;
        }
        let count = to_probe.len();

        match self.probe_paths(&to_probe).await {
            Ok(probes) => {
                let index = self.store.library_index().await.unwrap_or_default();
                for video in &to_probe {
                    self.apply_probe(video, probes.iter().find(|p| p.path == video.path), &index)
                        .await;
                }
            }
            Err(failure) => {
                // One bad run fails the whole batch; each video gets its
                // own audit record.
                for video in &to_probe {
                    self.record_failure(video, FailureCategory::MediainfoParsing, &failure)
                        .await;
                }
            }
        }

        count
    }

    async fn probe_paths(&self, videos: &[Video]) -> std::result::Result<Vec<MediaProbe>, String> {
        let mut args = vec!["--Output=JSON".to_string()];
        args.extend(videos.iter().map(|v| v.path.clone()));

        let mut child = match process::spawn(MEDIAINFO_BIN, &args) {
            Ok(child) => child,
            Err(e) => return Err(format!("failed to start mediainfo: {}", e)),
        };

        let mut output = String::new();
        let mut tail = OutputTail::new(10);
        while let Some(line) = child.next_line().await {
            tail.push(&line);
            output.push_str(&line);
            output.push('\n');
        }

        match child.wait().await {
            Ok(crate::classify::ExitKind::Code(0)) => {}
            Ok(kind) => {
                return Err(format!(
                    "mediainfo exited abnormally ({:?}): {}",
                    kind,
                    tail.to_text()
                ))
            }
            Err(e) => return Err(format!("mediainfo wait failed: {}", e)),
        }

        mediainfo::parse(&output).map_err(|e| e.to_string())
    }

    async fn apply_probe(&self, video: &Video, probe: Option<&MediaProbe>, index: &LibraryIndex) {
        let Some(probe) = probe else {
            self.record_failure(
                video,
                FailureCategory::MediainfoParsing,
                "mediainfo returned no record for this path",
            )
            .await;
            return;
        };

        if probe.file_size.is_none() {
            self.record_failure(
                video,
                FailureCategory::FileAccess,
                "mediainfo reported no file size",
            )
            .await;
            return;
        }

        let attrs = MediaAttributes {
            size: probe.file_size.unwrap_or(video.size),
            duration: probe.duration,
            width: probe.width,
            height: probe.height,
            frame_rate: probe.frame_rate,
            bitrate: probe.derived_bitrate(),
            video_codecs: probe.video_codecs.clone(),
            audio_codecs: probe.audio_codecs.clone(),
            max_audio_channels: probe.max_audio_channels,
            atmos: probe.atmos,
            hdr: probe.hdr.clone(),
            content_year: video.content_year.or_else(|| rules::extract_year(&video.path)),
        };

        let updated = match self.store.update_media_attributes(video.id, &attrs).await {
            Ok(updated) => updated,
            Err(e) => {
                error!("Failed to persist analysis for video {}: {}", video.id, e);
                return;
            }
        };
        if let Some(library_id) = index.match_path(&updated.path) {
            if updated.library_id != Some(library_id) {
                if let Err(e) = self.store.set_video_library(updated.id, library_id).await {
                    warn!("Could not assign library to video {}: {}", updated.id, e);
                }
            }
        }

        if !updated.has_complete_media_info() {
            // Keeps its place in the queue; the updated_at bump sends it
            // to the back.
            warn!(
                "Video {} analysis incomplete (bitrate={}), leaving in needs_analysis",
                updated.id, updated.bitrate
            );
            return;
        }

        match self.machine.mark_as_analyzed(&updated).await {
            Ok(_) => {
                self.bus.emit(Event::VideoUpserted { id: updated.id });
                self.downstream.dispatch_available();
            }
            Err(e) => warn!("Video {} could not leave analysis: {}", updated.id, e),
        }
    }

    async fn record_failure(&self, video: &Video, category: FailureCategory, message: &str) {
        warn!("Analysis failure for video {}: {}", video.id, message);
        let failure = NewFailure {
            video_id: video.id,
            stage: FailureStage::Analysis,
            category,
            code: category.to_string().to_uppercase(),
            message: message.to_string(),
            system_context: serde_json::json!({ "path": video.path }),
        };
        if let Err(e) = self.store.record_failure(&failure).await {
            error!("Could not record analysis failure for {}: {}", video.id, e);
        }
    }
}
