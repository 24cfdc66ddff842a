#![doc = include_str!("../Readme.md")]

pub mod app;
pub mod config;
pub mod database;
pub mod housekeeper;
pub mod media;
pub mod plan;
pub mod polling;
pub mod shutdown;
pub mod submission;
pub mod task_monitor;
pub mod token_pool;
pub mod upstream;
pub mod utils;
