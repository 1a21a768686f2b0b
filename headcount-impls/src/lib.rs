mod auth;
mod stores;

pub use auth::*;
pub use stores::*;
