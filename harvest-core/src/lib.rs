pub mod browser;
pub mod config;
pub mod cursor;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod extract;
pub mod filters;
pub mod metrics;
pub mod sqlite;
pub mod visit;

pub use config::{
    load_harvest_config, DeliverySection, ExtractionSection, FiltersSection, HarvestConfig,
    ListingSection, LocationUpdate, PacingSection, RunSection, StateSection, WebhookSection,
};
pub use cursor::{
    compute_batch, BatchSource, Cursor, CursorStore, KeyValueStore, PageBatch, PaginationState,
    Paginator, RunPlan, SqliteStateStore, SqliteStateStoreBuilder, StateError, StateResult,
};
pub use delivery::{
    DatasetEntry, DatasetSink, DeliveryError, DeliveryPipeline, DeliveryReceipt, DeliveryResult,
    ForwardStatus, Forwarder, JsonlDataset, WebhookForwarder,
};
pub use engine::{
    preview_batch, search_context_from, EngineError, EngineResult, HarvestEngine, RunOverrides,
    RunReport,
};
pub use error::{ConfigError, Result};
pub use extract::{
    ExtractionOrigin, ExtractionOutcome, ExtractionRace, Record, RecordSourceResolver, SkipReason,
};
pub use filters::{FilterReport, SearchFilters};
pub use metrics::HarvestMetrics;
pub use visit::{PageReport, PageVisitController};
