pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod inference;
pub mod models;
pub mod session;

pub use error::{LocalmindError, Result};
