pub mod outcome;
pub mod record;
pub mod stage;

pub use outcome::*;
pub use record::*;
pub use stage::*;
