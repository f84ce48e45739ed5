//! Core business logic module
//!
//! Formula model, resolution, environments, installation and verification.
//! Side effects go through the traits in [`crate::infra`].
//!
//! # Submodules
//!
//! - [`formula`] - Formula documents and the questions asked of them
//! - [`platform`] - Host description and platform predicates
//! - [`action`] - Install and test step definitions, placeholders
//! - [`registry`] - Formula registry loaded from a directory
//! - [`resolver`] - Dependency resolution into a build plan
//! - [`build_env`] - Build environment computation
//! - [`install`] - Single-formula install executor
//! - [`builder`] - Build orchestration across a plan
//! - [`verify`] - Post-install verification
//! - [`artifact`] - Installed kegs and their receipts
//! - [`global_config`] - Global configuration management

pub mod action;
pub mod artifact;
pub mod build_env;
pub mod builder;
pub mod formula;
pub mod global_config;
pub mod install;
pub mod platform;
pub mod registry;
pub mod resolver;
pub mod verify;
