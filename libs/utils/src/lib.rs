//! Process-level helpers shared by the arataga binaries.

pub mod logging;
pub mod shutdown;
