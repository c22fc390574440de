pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod lims;
pub mod output;
pub mod server;
pub mod tool;
