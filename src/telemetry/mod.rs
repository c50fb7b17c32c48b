pub mod logging;
pub mod trace;
