//! Query language, search orchestration, and the engine context that
//! owns the per-volume indexes and change monitors.

use core_types::FileRecord;
use uuid::Uuid;

pub mod engine;
pub mod orchestrator;
pub mod predicate;
pub mod query;

pub use engine::{BuildProgress, BuildStage, Engine, SearchHandle};
pub use orchestrator::{run_search, Scope};
pub use query::{parse_query, Query, QueryFilters};

/// Streaming result unit: up to `MAX_BATCH` record projections with a
/// monotonically increasing sequence number and the originating search's
/// opaque id. Batches arrive in match order; ranking is the UI's job.
#[derive(Debug, Clone)]
pub struct ResultBatch {
    pub search_id: Uuid,
    pub seq: u64,
    pub records: Vec<FileRecord>,
}

/// Hard cap on records per batch.
pub const MAX_BATCH: usize = 200;

/// Receives one search's output stream. Implementations must tolerate a
/// partial stream: a cancelled search just stops emitting.
pub trait SearchSink: Send {
    fn on_batch(&self, batch: ResultBatch);
    fn on_finished(&self, elapsed_seconds: f64);
    fn on_error(&self, message: &str);
}

/// Everything a search emits, for channel-backed consumers.
#[derive(Debug, Clone)]
pub enum SearchMessage {
    Batch(ResultBatch),
    Finished(f64),
    Error(String),
}

/// `SearchSink` adapter over a crossbeam channel.
pub struct ChannelSink {
    tx: crossbeam_channel::Sender<SearchMessage>,
}

impl ChannelSink {
    pub fn new(tx: crossbeam_channel::Sender<SearchMessage>) -> Self {
        Self { tx }
    }
}

impl SearchSink for ChannelSink {
    fn on_batch(&self, batch: ResultBatch) {
        let _ = self.tx.send(SearchMessage::Batch(batch));
    }

    fn on_finished(&self, elapsed_seconds: f64) {
        let _ = self.tx.send(SearchMessage::Finished(elapsed_seconds));
    }

    fn on_error(&self, message: &str) {
        let _ = self.tx.send(SearchMessage::Error(message.to_string()));
    }
}

/// Optional content-search collaborator. When no probe is installed a
/// `content:` term matches everything: absence of the facility must not
/// silently drop matches.
pub trait ContentProbe: Send + Sync {
    fn content_contains(&self, drive: char, id: core_types::RecordId, phrase: &str) -> bool;
}
