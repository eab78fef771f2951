//! Inbound surfaces of the service.

pub mod web;
