pub mod client;


pub use client::{AccrualClient, AccrualOracle, AccrualResponse, AccrualStatus, OracleReply};
