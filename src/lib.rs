pub mod core;
pub mod error;
pub mod inference;
pub mod job;
pub mod orchestrator;
pub mod recovery;
pub mod serve;
pub mod storage;

pub use error::UpscaleError;
pub use job::{JobSettings, JobStatus, JobStore, OutputFormat};
pub use orchestrator::{Orchestrator, PolicyConfig};
pub use recovery::{JobWatcher, WatchConfig};
