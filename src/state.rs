use crate::error::{ReforgeError, Result};
use crate::events::{Event, EventBus};
use crate::store::{Store, Video};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Lifecycle state of a video.
///
/// Videos enter at `NeedsAnalysis` and advance through the pipelines to
/// `Encoded`. `Failed` is terminal until an operator bulk-reset.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum VideoState {
    NeedsAnalysis,
    Analyzed,
    CrfSearching,
    CrfSearched,
    Encoding,
    Encoded,
    Failed,
}

impl std::fmt::Display for VideoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VideoState::NeedsAnalysis => "needs_analysis",
            VideoState::Analyzed => "analyzed",
            VideoState::CrfSearching => "crf_searching",
            VideoState::CrfSearched => "crf_searched",
            VideoState::Encoding => "encoding",
            VideoState::Encoded => "encoded",
            VideoState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl VideoState {
    /// States a video may be in immediately before entering `target`.
    pub fn allowed_predecessors(target: VideoState) -> &'static [VideoState] {
        use VideoState::*;
        match target {
            Analyzed => &[NeedsAnalysis, CrfSearching],
            NeedsAnalysis => &[Analyzed],
            CrfSearching => &[Analyzed],
            CrfSearched => &[CrfSearching, Encoding],
            Encoding => &[CrfSearched],
            Encoded => &[Encoding],
            Failed => &[NeedsAnalysis, Analyzed, CrfSearching, CrfSearched, Encoding],
        }
    }

    pub fn can_transition_to(self, target: VideoState) -> bool {
        VideoState::allowed_predecessors(target).contains(&self)
    }
}

/// Applies legal state transitions and broadcasts each one.
///
/// Bulk operator resets bypass this machine; they act on the store
/// directly and are documented with the maintenance operations.
#[derive(Clone)]
pub struct StateMachine {
    store: Store,
    bus: EventBus,
}

impl StateMachine {
    pub fn new(store: Store, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub async fn mark_as_analyzed(&self, video: &Video) -> Result<Video> {
        self.transition(video, VideoState::Analyzed).await
    }

    pub async fn mark_as_crf_searching(&self, video: &Video) -> Result<Video> {
        self.transition(video, VideoState::CrfSearching).await
    }

    pub async fn mark_as_crf_searched(&self, video: &Video) -> Result<Video> {
        self.transition(video, VideoState::CrfSearched).await
    }

    pub async fn mark_as_encoding(&self, video: &Video) -> Result<Video> {
        self.transition(video, VideoState::Encoding).await
    }

    pub async fn mark_as_encoded(&self, video: &Video) -> Result<Video> {
        self.transition(video, VideoState::Encoded).await
    }

    pub async fn mark_as_failed(&self, video: &Video) -> Result<Video> {
        self.transition(video, VideoState::Failed).await
    }

    pub async fn mark_as_needs_analysis(&self, video: &Video) -> Result<Video> {
        self.transition(video, VideoState::NeedsAnalysis).await
    }

    async fn transition(&self, video: &Video, target: VideoState) -> Result<Video> {
        if !video.state.can_transition_to(target) {
            return Err(ReforgeError::InvalidTransition {
                from: video.state,
                to: target,
            });
        }

        // Leaving needs_analysis requires a usable analysis result.
        if video.state == VideoState::NeedsAnalysis
            && target == VideoState::Analyzed
            && !video.has_complete_media_info()
        {
            return Err(ReforgeError::InvalidTransition {
                from: video.state,
                to: target,
            });
        }

        let previous_state = video.state;
        let updated = self.store.update_video_state(video.id, target).await?;
        debug!("Video {} transitioned {} -> {}", video.id, previous_state, target);
        self.bus.emit(Event::VideoStateChanged {
            video: Box::new(updated.clone()),
            previous_state,
            new_state: target,
        });
        Ok(updated)
    }
}
