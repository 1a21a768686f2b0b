mod auth;
mod store;
mod util;

pub use auth::*;
pub use store::*;
pub use util::*;
