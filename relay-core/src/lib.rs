//! Relay Core
//!
//! Core types shared by the Relay runner agent and its artifact cache.
//!
//! This crate contains:
//! - Domain types: tasks, execution state, log rows, cache records
//! - DTOs: request/response bodies for the control plane and the cache API

pub mod domain;
pub mod dto;
