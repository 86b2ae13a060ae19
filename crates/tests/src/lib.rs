//! End-to-end scenario tests for the relay: scripted recognizer and
//! worker mocks drive a full session (adapter → pipeline → coordinator →
//! broadcaster) and the assertions check what subscribers actually see.

pub mod fixtures;

#[cfg(test)]
mod session_scenarios;

#[cfg(test)]
mod ws_roundtrip;
