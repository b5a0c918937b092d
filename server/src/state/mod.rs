//! Authoritative device state tracked by the server

mod store;

pub use store::{DeviceSnapshot, StateStore};
