pub mod availability;
pub mod engine;
pub mod hours;
pub mod lifecycle;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod partition;
pub mod report;
pub mod store;
pub mod sweeper;
pub mod wal;
