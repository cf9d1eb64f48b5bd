pub mod config;
pub mod content;
pub mod netselect;
pub mod server;
pub mod ui;
