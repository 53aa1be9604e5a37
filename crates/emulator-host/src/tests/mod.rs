//! Test suites for emulator supervision.

pub(crate) mod support;
