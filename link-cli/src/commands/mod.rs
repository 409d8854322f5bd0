//! CLI command implementations.

pub mod decrypt;
pub mod demo;
pub mod init;
pub mod qr;
pub mod status;
