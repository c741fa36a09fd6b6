//! Actor-based pipeline
//!
//! Each actor runs as an independent task with an mpsc command channel and is
//! controlled through a cloneable handle.
//!
//! ```text
//!  ┌────────────────┐  publish   ┌──────────┐  deliver   ┌───────────────┐
//!  │ PublisherActor │ ─────────▶ │  queue   │ ─────────▶ │ ConsumerActor │
//!  └───────┬────────┘            └──────────┘ prefetch=1 └───────┬───────┘
//!          │ list_active                                         │ process
//!          ▼                                                     ▼
//!  ┌────────────────┐                                   ┌─────────────────┐
//!  │SensorDirectory │                                   │ReadingProcessor │
//!  └────────────────┘                                   └─────────────────┘
//! ```
//!
//! Both actors reach the broker through a shared `ConnectionManager`.

pub mod consumer;
pub mod messages;
pub mod publisher;

pub use consumer::{ConsumerActor, ConsumerHandle};
pub use messages::{ConsumerCommand, ConsumerStats, PublisherCommand, PublisherStats};
pub use publisher::{PublisherActor, PublisherHandle};
