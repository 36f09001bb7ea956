pub mod config;
pub mod db;
pub mod devlist;
pub mod error;
pub mod types;
