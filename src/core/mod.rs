//! Core device management logic

pub mod bridge;
pub mod error;
pub mod events;
pub mod handle;
pub mod manager;
pub mod sequencer;
pub mod store;
pub mod types;
