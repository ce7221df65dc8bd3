pub mod auth;
pub mod bus;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod relay;
pub mod router;
pub mod session;
pub mod ws;

#[cfg(test)]
pub mod testing;
