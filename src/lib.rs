pub mod academic_year;
pub mod config;
pub mod db;
pub mod ipc;
pub mod logging;
pub mod results;
