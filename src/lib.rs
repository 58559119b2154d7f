pub mod automation;
pub mod commands;
pub mod debounce;
pub mod hardware;
pub mod input;
pub mod radio;
pub mod session;
pub mod state;
pub mod storage;
pub mod system;
pub mod types;
pub mod worker;

pub use types::*;
