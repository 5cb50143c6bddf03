//! Flow identity, the shared flow table, and its idle sweeper.

mod id;
mod sweeper;
mod table;

pub use id::{FlowId, Protocol};
pub use sweeper::IdleSweeper;
pub use table::{FlowTable, ManagedFlow, DEFAULT_IDLE_TICKS};
