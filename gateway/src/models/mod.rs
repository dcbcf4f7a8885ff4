pub mod catalog;
pub mod chat;
pub mod token;
