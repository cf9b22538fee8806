//! boardlink-test-harness: Test utilities for boardlink.
//!
//! This crate provides [`MockBoard`], a scripted device end of an in-memory
//! pipe for deterministic unit tests of the client, and [`Simulator`], a
//! virtual Uno that answers every recognized command so applications can
//! run end to end without hardware.

pub mod mock_board;
pub mod simulator;

pub use mock_board::{MockBoard, ReceivedRequest};
pub use simulator::{Simulator, SimulatorConfig, SimulatorLink};
