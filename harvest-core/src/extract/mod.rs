mod race;
mod record;
mod resolver;

pub use race::ExtractionRace;
pub use record::{ExtractionOrigin, ExtractionOutcome, Record, SkipReason};
pub use resolver::{
    resolve_identifier, ListingFields, RecordSourceResolver, RenderedListing,
    RENDERED_EXTRACTION_SCRIPT,
};
