//! Lead Intake API Library
//!
//! This library provides the core functionality for the Lead Intake API:
//! webhook endpoints for Meta Lead Ads and Google Ads lead forms, an
//! append-only intake event log, configurable field mapping into
//! destination lead records, and a polling safety net behind the
//! webhook path.
//!
//! # Modules
//!
//! - `config`: Configuration management.
//! - `db`: Database connection and pool management.
//! - `errors`: Error handling types.
//! - `formatting`: Field value transforms (phone, age, name, ...).
//! - `google`: Google Ads lead form webhook handler.
//! - `graph_client`: Meta Graph API client and token management.
//! - `handlers`: HTTP request handlers and shared state.
//! - `intake`: Meta webhook verification and receipt.
//! - `mapper`: Mapping rule application.
//! - `models`: Core data models.
//! - `orchestrator`: Event processing pipeline.
//! - `poller`: Scheduled lead polling.
//! - `resolver`: Mapping config resolution.
//! - `storage`: Database storage operations.
//! - `webhook_models`: Webhook payload models.

pub mod config;
pub mod db;
pub mod errors;
pub mod formatting;
pub mod google;
pub mod graph_client;
pub mod handlers;
pub mod intake;
pub mod mapper;
pub mod models;
pub mod orchestrator;
pub mod poller;
pub mod resolver;
pub mod storage;
pub mod webhook_models;
