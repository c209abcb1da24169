//! Kernel bookkeeping for the swingset kernel.
//!
//! [`KernelKeeper`] owns the typed view of the kernel's key-value state: boot
//! configuration, ID allocators and name tables, kernel objects and promises,
//! the run and acceptance queues, meters, stats, and per-vat c-lists and
//! transcripts through [`VatKeeper`]. All state lives in a
//! [`swing_store::SwingStore`]; the keeper holds nothing durable of its own.

mod config;
mod error;
mod keeper;
mod message;
mod meter;
mod promise;
mod queue;
pub mod slots;
pub mod stats;
mod vat_keeper;

pub use config::{KernelConfig, ManagerType, ReapInterval};
pub use error::{KernelError, KernelResult};
pub use keeper::{KernelKeeper, ObjectRefCount, RefCountOptions};
pub use message::{CapData, Message, RunQueueEvent, VatOptionsChange};
pub use meter::{Meter, MeterRemaining};
pub use promise::{KernelPromise, PromisePolicy};
pub use stats::{KernelStats, MetricDefinition, MetricType, SerializedStats};
pub use vat_keeper::{VatKeeper, VatOptions, VatSource, WorkerOptions};
