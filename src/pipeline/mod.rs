//! Streaming pipeline engine.
//!
//! Every run flows through:
//! 1. `Source::produce()`: lazy stream of raw items
//! 2. `Pipeline::run()`: ordered stages, one item end to end at a time
//! 3. `Consumer::consume()`: accumulation with de-duplication
//!
//! `WorkflowExecutor` drives the three and reports through `RunObserver`.

pub mod consumer;
pub mod executor;
pub mod links;
pub mod source;
pub mod stage;
pub mod stages;
pub mod types;
