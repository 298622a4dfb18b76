//! Feature flag evaluation and rule-set synchronization for Split.
//!
//! # Overview
//!
//! The crate has two halves that meet at [`RuleSetStorage`]:
//!
//! - The [`Evaluator`] computes a treatment for a [`Key`] and a flag name. Evaluation is a pure,
//!   deterministic function of the key, its [`Attributes`] and the current [`RuleSetSnapshot`].
//!   It never performs network I/O.
//! - The [`SyncManager`] keeps storage up to date. It fetches rule-set changes identified by
//!   monotonically increasing change numbers, retries with capped exponential backoff, bypasses
//!   CDN caches when stuck, and falls back to a legacy wire format when an outdated proxy sits
//!   in front of the Split API.
//!
//! Storage publishes every update as a new immutable snapshot, so evaluations running
//! concurrently with a sync observe either the old rule set or the new one in full.
//!
//! Outcomes of synchronization are reported to an [`EventListener`] as [`SyncEvent`]s.
//!
//! # Error Handling
//!
//! Evaluation never fails: anything that goes wrong yields the `control` treatment (or a
//! configured [`FallbackTreatment`]) with a label explaining why. See [`eval::labels`].
//!
//! Synchronization returns [`SyncOutcome`] for the result of a pass and [`Error`] for setup
//! failures. Failed fetches are classified by [`FetchError`].
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate with the `split` target and
//! structured key-values. Consider integrating a `log`-compatible logger implementation for
//! better visibility into sync operations.

#![warn(rustdoc::missing_crate_level_docs)]

mod attributes;
mod config;
mod error;
pub mod eval;
mod events;
mod fallback;
mod fetcher;
pub mod hasher;
pub mod rules;
mod snapshot;
mod storage;
pub mod sync;

pub use attributes::{AttributeValue, Attributes};
pub use config::{SplitFilter, SyncConfig};
pub use error::{Error, FetchError, Result};
pub use eval::{EvaluationResult, Evaluator};
pub use events::{EventListener, SyncEvent};
pub use fallback::{FallbackTreatment, FallbackTreatments};
pub use fetcher::{Fetch, FetchParams, HttpFetcher};
pub use rules::Key;
pub use snapshot::{ChangeNumbers, ChangeSet, RuleSetSnapshot};
pub use storage::{InMemorySegments, InMemoryStorage, RuleSetStorage, SegmentMembership};
pub use sync::{StreamingStatus, SyncManager, SyncOutcome, SyncTarget};
