pub mod cli;
pub mod engine;
pub mod error;
pub mod extract;
pub mod merge;
pub mod refresh;
pub mod staging;
pub mod storage;
