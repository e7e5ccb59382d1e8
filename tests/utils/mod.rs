pub mod assertions;
pub mod setup;

// Re-export main utilities for use by test files
#[allow(unused_imports)]
pub use assertions::{wait_for_item, wait_for_state, wait_for_status, EventLog, WAIT};
#[allow(unused_imports)]
pub use setup::{device_on, TestSetup, TestSetupBuilder};
