//! `mh-domain`: configuration and shared error types for mcphub.
//!
//! Everything here is plain data: the gateway loads a [`config::Config`]
//! once at startup, validates it, and hands the typed sections to the
//! runtime components.

pub mod config;
pub mod error;
