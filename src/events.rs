use crate::state::VideoState;
use crate::store::{ServiceType, Video};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Snapshot of one encode in flight, suitable for dashboards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EncodingProgress {
    pub filename: String,
    pub percent: f64,
    pub fps: f64,
    pub eta_seconds: u64,
}

impl EncodingProgress {
    /// Fold a partial update into the current snapshot. Zero-valued fields
    /// in `incoming` keep the current value, except `percent` where zero is
    /// a real reading.
    pub fn merge(current: &EncodingProgress, incoming: &EncodingProgress) -> EncodingProgress {
        EncodingProgress {
            filename: if incoming.filename.is_empty() {
                current.filename.clone()
            } else {
                incoming.filename.clone()
            },
            percent: incoming.percent,
            fps: if incoming.fps == 0.0 {
                current.fps
            } else {
                incoming.fps
            },
            eta_seconds: if incoming.eta_seconds == 0 {
                current.eta_seconds
            } else {
                incoming.eta_seconds
            },
        }
    }
}

/// Snapshot of one crf-search in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchProgress {
    pub filename: String,
    pub percent: f64,
    pub crf: f64,
    pub score: f64,
}

impl SearchProgress {
    pub fn merge(current: &SearchProgress, incoming: &SearchProgress) -> SearchProgress {
        SearchProgress {
            filename: if incoming.filename.is_empty() {
                current.filename.clone()
            } else {
                incoming.filename.clone()
            },
            percent: incoming.percent,
            crf: if incoming.crf == 0.0 {
                current.crf
            } else {
                incoming.crf
            },
            score: if incoming.score == 0.0 {
                current.score
            } else {
                incoming.score
            },
        }
    }
}

/// Every event observable on the bus. Subscribers (the dashboard, logs,
/// tests) receive these; nothing in the core reads them back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    AnalyzerStarted {
        batch_size: usize,
        queue_size: usize,
        next_videos: Vec<String>,
    },
    AnalyzerProgress {
        throughput: f64,
    },
    AnalyzerCompleted {
        batch_size: usize,
        throughput: f64,
    },
    AnalyzerPaused,
    AnalyzerIdle,

    CrfSearchStarted {
        filename: String,
    },
    CrfSearchProgress(SearchProgress),
    CrfSearchCompleted {
        filename: String,
        success: bool,
    },
    CrfSearchPaused,
    CrfSearchIdle,

    EncoderStarted {
        filename: String,
    },
    EncoderProgress(EncodingProgress),
    EncoderCompleted {
        filename: String,
    },
    EncoderFailed {
        filename: String,
    },
    EncoderTimedOut {
        filename: String,
    },
    EncoderIdle,

    SyncStarted {
        service_type: ServiceType,
    },
    SyncProgress {
        service_type: ServiceType,
        progress: u8,
    },
    SyncCompleted {
        service_type: ServiceType,
    },

    VideoUpserted {
        id: i64,
    },
    VmafUpserted {
        id: i64,
    },
    VideoStateChanged {
        video: Box<Video>,
        previous_state: VideoState,
        new_state: VideoState,
    },

    QueueChanged {
        pipeline: String,
        queue_size: usize,
        next_videos: Vec<String>,
    },
}

/// In-process publish/subscribe fabric for the pipelines.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Stream view for subscribers built on `Stream` combinators. Slow
    /// subscribers see lag errors instead of blocking publishers.
    pub fn stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.tx.subscribe())
    }
}
