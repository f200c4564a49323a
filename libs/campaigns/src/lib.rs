//! Bulk campaign fan-out.
//!
//! Campaign ids travel over a Redis stream consumer group; any number of
//! worker tasks (in this process or others) join the same group and pull
//! from it, which is the whole scale-out story. Recipient rows are the
//! per-message ledger, claimed in `SKIP LOCKED` batches.

pub mod service;
pub mod stream;
pub mod worker;

pub use service::{CampaignService, RecipientSpec};
pub use stream::{CampaignStream, StreamEntry};
pub use worker::{spawn_workers, CampaignWorker};

/// Stream and group names are fixed; extra processes join by convention.
pub const STREAM_NAME: &str = "campaigns";
pub const GROUP_NAME: &str = "campaign-workers";
