pub mod handler;
pub mod stream;
pub mod stream_bridge;
pub mod translate;
pub mod upstream;
