pub mod controller;
pub mod retry;

pub use controller::*;
pub use retry::*;
