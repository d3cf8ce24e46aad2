mod error;
mod pagination;
mod store;

pub use error::{StateError, StateResult};
pub use pagination::{
    compute_batch, BatchSource, Cursor, PageBatch, PaginationState, Paginator, RunPlan,
};
pub use store::{
    CursorStore, KeyValueStore, SqliteStateStore, SqliteStateStoreBuilder,
};
