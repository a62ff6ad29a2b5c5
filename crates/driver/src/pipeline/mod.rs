//! Pipeline — per-container log processing.
//!
//! ```text
//! frames → PartialBuffer → MultilineAggregator → enrich → { LocalStore, send queue → Sender }
//! ```

pub mod container;
pub mod enrich;
pub mod manager;
pub mod model;
pub mod multiline;
pub mod partial;

pub use container::{ContainerPipeline, PipelineParts, PipelineSettings};
pub use enrich::{Metadata, OutboundMessage};
pub use manager::{PipelineManager, SenderFactory, SenderTarget};
pub use model::{AggregatedEvent, ContainerInfo, LogFragment, LogRecord};
pub use multiline::{MultilineAggregator, MultilineError};
pub use partial::PartialBuffer;
