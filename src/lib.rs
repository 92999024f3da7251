//! Gatekeeper - Distributed Admission Control
//!
//! This crate decides whether an operation performed on behalf of one or more
//! identities (an IP address, a username) may proceed. Attempts are counted in
//! a shared Redis store; exceeding a limit imposes a timeout that grows
//! geometrically on repeated abuse. Every store call runs under a circuit
//! breaker so a failing store degrades into fast, explicit errors.

pub mod config;
pub mod error;
pub mod store;
pub mod throttle;
