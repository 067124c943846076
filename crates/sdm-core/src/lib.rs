pub mod config;
pub mod logging;

pub mod adaptive;
pub mod checksum;
pub mod part_file;
pub mod planner;
pub mod probe;
pub mod queue;
pub mod retry;
pub mod sidecar;
pub mod speed;
pub mod transfer;
pub mod url_policy;
