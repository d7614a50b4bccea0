//! Background maintenance for the device store.

pub mod cleanup;

pub use cleanup::{run_cleanup, run_periodic, CleanupReport};
