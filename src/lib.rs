//! sas_domain_proxy: Domain Proxy configuration controller
//!
//! Batches pending CBSD requests per type, posts them to a SAS over mutual TLS
//! (guarded by a CRL cache) and maps the bulk answers back onto durable
//! CBSD and grant state.

pub mod config;
pub mod mappings;
pub mod models;
pub mod store;
pub mod protocol_controller;
pub mod consumer;
pub mod merger;
pub mod crl_validator;
pub mod router;
pub mod response_processor;
pub mod pipeline;
pub mod scheduler;
pub mod monitor;
