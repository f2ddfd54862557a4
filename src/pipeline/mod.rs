//! Metric data pipeline.
//!
//! Pulls raw provider data through a connector, normalizes it into time
//! series with a generated ingestion transformer, and renders dashboard
//! charts through a generated chart transformer. Runs are triggered over
//! HTTP, execute in the background and report progress through step logs.

pub mod api;
pub mod auth;
pub mod cache;
pub mod chart;
pub mod connector;
pub mod db;
pub mod generator;
pub mod ingestion;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod server;
pub mod transformers;
pub mod ws;

#[cfg(test)]
mod testing;
