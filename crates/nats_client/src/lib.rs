//! Shared NATS client wrapper.

pub mod client;

pub use client::{ConnectSettings, NatsClient, NatsSubscription};
