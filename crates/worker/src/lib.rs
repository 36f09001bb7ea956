pub mod consumer;
pub mod maintenance;
