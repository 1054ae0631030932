//! Taskmill - Run NIP-90 task processors with subscription-tier gating
//!
//! This crate provides the runtime for NIP-90 data vending machines:
//! - Advertise a compute capability on the Nostr network (NIP-89)
//! - Receive job request events, validate and translate them into
//!   backend job specifications
//! - Dispatch jobs to pluggable external compute services and poll
//!   until completion
//! - Publish job results and feedback back to the network
//! - Gate access behind paid NIP-88 subscription tiers
//!
//! The signed-event transport is abstracted behind [`bus::EventBus`];
//! compute engines behind [`dispatch::JobBackend`]. Neither the
//! signature scheme nor relay networking is implemented here.

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod identifier;
pub mod orchestrator;
pub mod processor;
pub mod tier;
pub mod translate;
