#![doc = include_str!("../README.md")]

mod error;

pub mod config;
pub mod idb;
pub mod io;
pub mod pipeline;
pub mod processing;
pub mod products;
pub mod time;
pub mod tmtc;

pub use error::{Error, Result};
