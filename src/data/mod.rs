//! Data layer: upstream sources, the ingestion ledger and the series store

pub mod ledger;
pub mod sources;
pub mod store;

pub use ledger::{batch_fingerprint, IngestLogEntry, IngestStatus, Ledger, LedgerEntry};
pub use sources::{FetchRequest, InMemorySource, SourceRegistry, UpstreamSource};
pub use store::{CommitBatch, CommitSummary, CursorUpdate, ModelArtifact, SeriesStore};
