//! voxlink_rs - real-time duplex audio relay to a speech translation endpoint
//!
//! hardware → [`audio::Recorder`] → sample pipe → [`session::Session`] uplink
//! → [`transport::Transport`] → remote → downlink → decoder →
//! {[`audio::PlaybackSink`], WAV archive}

pub mod audio;
pub mod config;
pub mod net_link;
pub mod protocol;
pub mod session;
pub mod transport;
