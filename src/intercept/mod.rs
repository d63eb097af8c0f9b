pub mod classify;
pub mod command;
pub mod dispatch;
pub mod logging;
pub mod options;
pub mod process;
pub mod trace;
pub mod tracker;
