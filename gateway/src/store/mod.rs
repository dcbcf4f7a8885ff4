pub mod secure_file;
pub mod tokens;

pub use tokens::TokenStore;
