pub mod controller;
pub mod error;
pub mod item;
pub mod memory;
pub mod metrics;
pub mod priority;

pub use controller::{BoxError, Controller, ControllerConf, DrainFn};
pub use error::{BufferError, ControllerError};
pub use item::{DELIVERY_FAILURE_NAME, Item, ItemBatch, ItemKind, Priority};
pub use memory::{MemoryProbe, ProcMemoryProbe};
pub use metrics::{BufferMetrics, DROP_REASON_AGE, DROP_REASON_HEAP};
pub use priority::PriorityBuffer;
