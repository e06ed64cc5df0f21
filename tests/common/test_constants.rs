//! Shared constants for integration tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Placing shared constants under `tests/common/` avoids creating an
//! additional integration test binary while still allowing reuse via:
//!
//! ```rust
//! #[path = "common/test_constants.rs"]
//! mod test_constants;
//! ```

/// Name of the simulated storage backend registered by the tests.
pub const SIM_BACKEND: &str = "sim";

/// Name of the simulated OS driver registered by the tests.
pub const SIM_OS: &str = "sim-os";

/// Default volume size, in GiB, when nothing overrides it.
pub const DEFAULT_VOLUME_SIZE_GIB: u64 = 16;
