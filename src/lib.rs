//! pairsync: ephemeral relay and last-write-wins sync for local-first
//! devices.
//!
//! Each device keeps a complete replica in a local [`store`]. Devices pair
//! out of band, meet in a short-lived relay session ([`gateway`]), and
//! reconcile with the [`sync`] engine. The relay stores nothing.

pub mod config;
pub mod gateway;
pub mod store;
pub mod sync;
pub mod util;
