//! End-to-end tests for the Ballad playback pipeline

#[cfg(test)]
mod playback_integration;
