//! TripBasket media service: object storage with an image optimization
//! pipeline, a small document store for the records that reference images,
//! and an edge cache controller for the web client.

pub mod cache_controller;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;
