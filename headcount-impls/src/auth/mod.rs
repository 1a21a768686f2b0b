mod local_auth;

pub use local_auth::LocalAuthProvider;
