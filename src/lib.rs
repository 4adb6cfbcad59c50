#![warn(clippy::pedantic)]
// Noisy doc/signature lints — would require annotating most pub functions
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// Intentional casts at the storage boundary (row counts, token counts, sizes)
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
// Module structure — search::SearchParams etc. is by design
#![allow(clippy::module_name_repetitions)]

pub mod chunker;
pub mod config;
pub mod errors;
pub mod projection;
pub mod providers;
pub mod queue;
pub mod search;
pub mod service;
pub mod store;
pub mod vectors;

pub use config::ServiceConfig;
pub use errors::{MemodexError, Result};
pub use providers::{EmbeddingBatch, EmbeddingProvider, MockProvider, OpenAiProvider};
pub use queue::{QueueItem, QueueStats};
pub use search::{SearchHit, SearchParams};
pub use service::{ProcessSummary, Service};
pub use store::{EmbeddingService, NewService, ServiceStats};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
