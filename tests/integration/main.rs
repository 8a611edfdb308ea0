//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises one part of the kernel
//! through its public API, using the journaling `Scripted` module from
//! `mock_modules`.  Everything runs on the host with no hardware.

mod bus_tests;
mod mock_modules;
mod orchestrator_tests;
