pub mod error;
pub mod event;
pub mod ids;
pub mod poll;
pub mod source;
pub mod stream;
