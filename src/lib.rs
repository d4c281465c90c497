pub mod config;
pub mod db;
pub mod index;
pub mod jobs;
pub mod model;
pub mod retry;
pub mod scanner;
pub mod security;
pub mod storage;
pub mod sync;
