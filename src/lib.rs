#![forbid(unsafe_code)]

//! Public entry point for the videoteca crate.
//!
//! The backend binary is a thin shell around [`server::router`]; everything
//! that touches the catalog, the derivative artifacts, or byte-range delivery
//! lives in the modules below so it can be exercised without a socket.

pub mod catalog;
pub mod config;
pub mod derivative;
pub mod error;
pub mod naming;
pub mod server;
pub mod streaming;
pub mod thumbnail;
pub mod tools;
