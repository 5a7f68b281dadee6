//! # deployd-rs
//!
//! Deployment scheduling daemon. Watchers turn configuration, autoscaler
//! and drain signals into service instances on a delay/deadline queue; a
//! pool of workers hands due instances to a bounce executor and requeues
//! them with backoff until they reach steady state. Only the elected leader
//! runs the control loop.

pub mod bounce;
pub mod catalog;
pub mod cluster;
pub mod config;
pub mod coord;
pub mod engine;
pub mod error;
pub mod leader;
pub mod model;
pub mod queue;
pub mod telemetry;
pub mod watchers;
