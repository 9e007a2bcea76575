//! Default constants for VM configuration.
//!
//! Centralizes the sizing and tuning numbers shared by the heap, the
//! collector, the heuristics and the configuration loader.

/// Default maximum heap size in bytes (384 MB).
pub const DEFAULT_HEAP_SIZE: usize = 384 * 1024 * 1024;

/// Smallest region size the heap will use.
pub const MIN_REGION_SIZE: usize = 64 * 1024;

/// Largest region size the heap will use.
pub const MAX_REGION_SIZE: usize = 32 * 1024 * 1024;

/// Number of regions the heap aims for when the region size is derived.
pub const TARGET_REGION_COUNT: usize = 2048;

/// Size of the object header in bytes (class id, mark word, forwarding slot).
pub const OBJECT_HEADER_BYTES: usize = 16;

/// Object sizes are rounded up to this alignment.
pub const OBJECT_ALIGNMENT: usize = 8;

/// Width of a reference field with compressed references enabled.
pub const COMPRESSED_REF_BYTES: usize = 4;

/// Width of a reference field without compressed references.
pub const FULL_REF_BYTES: usize = 8;

/// Oldest age an object header can record.
pub const MAX_OBJECT_AGE: u8 = 15;

/// Per-mutator SATB buffer capacity before it spills into the global queue.
pub const DEFAULT_SATB_BUFFER_SIZE: usize = 256;

/// How often the GC control thread consults the heuristics (milliseconds).
pub const DEFAULT_CONTROL_INTERVAL_MS: u64 = 2;

/// Objects traced by a marking worker between SATB queue drains.
pub const MARK_STEP_OBJECTS: usize = 512;

/// With fault injection enabled, one evacuation allocation in this many fails.
pub const EVAC_FAILURE_ONE_IN: u32 = 64;

/// Weight of the newest sample in the decaying allocation-rate average.
pub const ALLOC_RATE_DECAY: f64 = 0.3;

/// Headroom (fraction of capacity) adaptive heuristics keep free.
pub const MIN_FREE_THRESHOLD: f64 = 0.10;
