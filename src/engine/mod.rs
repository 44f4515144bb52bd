//! Auction engine: targeting, bid generation and resolution.

pub mod targeting;
pub mod bidder;
pub mod resolver;
pub mod orchestrator;
pub mod simulation;
