pub mod agents;
pub mod api;
pub mod bus;
pub mod cli;
pub mod engine;
pub mod error;
pub mod lua;
pub mod planner;
pub mod storage;
pub mod stream;
pub mod workspace;
