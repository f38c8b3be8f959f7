//! Local alert persistence (encrypted at rest).

mod encrypted;

pub use encrypted::{AlertStore, DeliveryStatus, StoredAlert};
