#![forbid(unsafe_code)]

pub mod catalog;
pub mod cli;
pub mod config;
pub mod convert;
pub mod download;
pub mod error;
pub mod extract;
pub mod formats;
pub mod fsio;
pub mod layout;
pub mod logging;
pub mod pdf;
pub mod pool;
pub mod resolve;
pub mod sync;
pub mod transport;
