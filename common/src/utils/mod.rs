pub mod alloy_tools;
pub mod logging;
