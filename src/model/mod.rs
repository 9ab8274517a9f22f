pub mod comparison;
pub mod patch;
pub mod state;
pub mod tag;
pub mod version;

pub use comparison::*;
pub use patch::*;
pub use state::*;
pub use tag::*;
pub use version::*;
