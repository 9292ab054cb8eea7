use crate::model::Ms;

/// Earliest accepted record timestamp (1970-01-01T00:00:00Z).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// Latest accepted record timestamp (2100-01-01T00:00:00Z).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Segments used to approximate a circle when buffering.
pub const BUFFER_SEGMENTS: usize = 32;

/// Fires with more parts than this are reconciled with their unbuffered shape.
pub const MULTIPOLYGON_BUFFER_PART_LIMIT: usize = 200;

/// Upper bound on records accepted from one fetch or ingest.
pub const MAX_RECORDS_PER_ACQUIRE: usize = 5_000_000;

/// Upper bound on the worker pool size.
pub const MAX_WORKERS: usize = 256;

/// Upper bound on a configured strategy attribute value.
pub const MAX_ATTRIBUTE_LEN: usize = 4096;

/// Upper bound on one encoded job history record. Larger length prefixes are a corrupt tail.
pub const MAX_HISTORY_RECORD_BYTES: usize = 1 << 20;
