#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod alert;
pub mod auth;
pub mod bus;
pub mod error;
pub mod hooks;
pub mod types;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

pub use crate::bus::{EventBus, Handler, Subscription, handler};
pub use crate::ws::{Config, ConnectionManager, ConnectionState};
