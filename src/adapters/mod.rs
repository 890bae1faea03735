//! Broker adapters: TopstepX REST for orders and positions, the SignalR
//! market hub for trades.

pub mod topstep_hub;
pub mod topstep_rest;

pub use topstep_hub::{parse_hub_frames, HubFrame, TopstepMarketHub};
pub use topstep_rest::TopstepClient;
