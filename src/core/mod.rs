pub mod models;
pub mod session;
pub mod traits;
