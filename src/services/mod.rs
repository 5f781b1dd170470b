pub mod cache;
pub mod completion;
pub mod coordinator;
pub mod queue;
pub mod resize;
pub mod worker;
