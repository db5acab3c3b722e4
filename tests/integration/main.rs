//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises one flow against the
//! mock broker, transport, storage and flash.  All tests run on the host
//! with no real hardware or network required.

#![cfg(not(target_os = "espidf"))]

mod cert_flow_tests;
mod connection_tests;
mod dispatcher_tests;
mod mock_cloud;
mod onboarding_tests;
mod ota_flow_tests;
