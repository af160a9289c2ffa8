pub mod http;
pub mod input;
pub mod output;

pub use http::*;
pub use input::*;
pub use output::*;
