//! Ballad core: platform-independent playback domain
//!
//! Filter design, the three-band equalizer, reader and input abstractions,
//! player events and configuration. Nothing here touches an audio device or
//! spawns a thread; see `ballad-infra` for that.

pub mod domain;

pub use domain::*;
