pub mod collab_config;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod executor;
pub mod health;
pub mod logging;
pub mod merge;
pub mod pipeline;
pub mod report;
pub mod retrospect;
pub mod review;
pub mod role;
pub mod splitter;
pub mod stages;
pub mod task;
pub mod util;
pub mod verify;
