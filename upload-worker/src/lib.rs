//! Watch a directory for finished image files and upload each one to a remote endpoint,
//! deleting the local copy only once the remote confirmed it.
pub mod config;
pub mod error;
pub mod lock;
pub mod reconcile;
pub mod scanner;
pub mod upload;
pub mod worker;
