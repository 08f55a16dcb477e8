pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod mastery;
pub mod models;
pub mod report;
pub mod risk;
pub mod store;
