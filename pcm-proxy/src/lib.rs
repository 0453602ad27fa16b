pub mod config;
pub mod decoder;
pub mod hooks;
pub mod range;
pub mod server;
pub mod session;
pub mod wav_header;
