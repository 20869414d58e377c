pub mod bench;
pub mod bench_file;
pub mod classify;
pub mod config;
pub mod error;
pub mod launcher;
pub mod report;
pub mod retry;
pub mod stats;
