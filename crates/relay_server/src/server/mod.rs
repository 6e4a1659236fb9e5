#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod http;
pub mod registry;
pub mod router;
pub mod session;
pub mod store;



#[cfg(test)]
mod router_tests;
