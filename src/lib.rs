//! instore_player: core library for the in-store broadcast controller.
//!
//! Scheduling, playlist and transition logic lives here. The
//! `instore-player` binary wires it to real audio, tags and a schedule file.

pub mod anti_repeat;
pub mod audio;
pub mod clock;
pub mod config;
pub mod element;
pub mod error;
pub mod history;
pub mod playlist;
pub mod promo;
pub mod repository;
pub mod resolver;
pub mod resources;
pub mod rodio_backend;
pub mod scheduler;
pub mod segment;
pub mod tags;
pub mod transition;
