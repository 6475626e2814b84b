//! Newsdesk - A personal feed aggregator
//!
//! This crate syncs RSS/Atom sources into a per-owner article store,
//! falling back to relay fetchers when a source blocks direct requests,
//! and serves the articles, subscriptions and cached translations over a
//! JSON API.

pub mod auth;
pub mod config;
pub mod db;
pub mod fetcher;
pub mod parser;
pub mod registry;
pub mod routes;
pub mod sync;
pub mod translate;
