//! Multi-zone irrigation controller: relay-driven zones behind a safety
//! relay, scheduled and manual watering programs, and a supervisor that
//! forces the hardware back into a consistent state.

pub mod clock;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod io;
pub mod programs;
pub mod record;
pub mod scheduler;
pub mod supervisor;
pub mod valve;
pub mod web;
pub mod zones;

#[cfg(test)]
mod testkit;
