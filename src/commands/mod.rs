pub mod compose;
pub mod config;
pub mod resolve;
pub mod serve;
pub mod template;
