//! The execution core: store, queue drivers, idempotency inbox, outbox
//! relay, handler registry, runner, worker loop, and recovery operations.
//!
//! ```text
//! control surface
//!     │  create run + steps, enqueue step.ready
//!     ▼
//! QueueDriver ──► StepWorker ──► StepRunner ──► ToolHandler
//!     ▲                │              │
//!     │                │              └─► Store (runs, steps, events, inbox)
//!     │                └─► Store outbox ◄─┘
//!     └──────────── OutboxRelay ◄─────────┘
//! ```

pub mod deps;
pub mod error;
pub mod inbox;
pub mod metrics;
pub mod model;
pub mod outbox;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod runner;
pub mod store;
pub mod worker;

pub use deps::CoreDeps;
pub use error::{QueueError, StoreError};
pub use inbox::Inbox;
pub use model::{
    EventRecord, JobStatus, OutboxEnvelope, OutboxRow, QueueCounts, QueueJob, Run, RunPatch,
    RunStatus, Step, StepPatch, StepReadyEnvelope, StepStatus,
};
pub use outbox::{OutboxRelay, OutboxRelayConfig};
pub use queue::{
    EnqueueOptions, JobHandler, MemoryQueue, PostgresQueue, QueueDriver, RedisQueue,
    TOPIC_OUTBOX, TOPIC_STEP_DLQ, TOPIC_STEP_READY,
};
pub use registry::{HandlerRegistry, ToolHandler};
pub use runner::StepRunner;
pub use store::{MemoryStore, PostgresStore, Store};
pub use worker::{Heartbeat, StepWorker, StepWorkerConfig};
