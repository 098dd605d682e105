//! Scripter dispatcher: feeds player scripts and intents to runner processes.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod runner;
pub mod status;
