pub mod app;
pub mod backend;
pub mod channels;
pub mod config;
pub mod convert;
pub mod error;
pub mod events;
pub mod logs;
pub mod model;
pub mod protocol;
pub mod session;
pub mod socket;
pub mod status;
