pub mod audit;
pub mod billing;
pub mod lifecycle;
pub mod notify;
pub mod progress;
pub mod report;
pub mod roster;
