//! kni node library.
//!
//! Components of the `kni-node` binary, exposed for testing and embedding.

pub mod cli;
pub mod config;
pub mod node;
pub mod shutdown;
