pub mod b64;
pub mod logging;
pub mod time;
