pub mod key;
pub mod stream;
