//! Versioned label-mapping and spatial-index core for 3D label volumes.
//!
//! The crate layers three services over an ordered key-value facade:
//! a version-aware supervoxel→label map backed by a durable mapping log
//! ([`svmap`]), a spatial denormalization engine producing label→block and
//! size→label indexes ([`denorm`]), and a tar blob store serving all
//! per-supervoxel data mapped to a label ([`tarsv`]). Version ancestry is
//! supplied by the embedder through [`version::AncestryProvider`].

pub mod cache;
pub mod config;
pub mod denorm;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod ranking;
pub mod registry;
pub mod store;
pub mod svmap;
pub mod tarsv;
pub mod version;
pub mod volume;

pub use config::Config;
pub use error::{Error, Result};
pub use version::{Uuid, VersionId};
