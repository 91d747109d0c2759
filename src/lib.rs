#![forbid(unsafe_code)]

//! Background download service for the cleantube front-end: queue a fetch,
//! poll its progress, cancel it, then stream the finished file exactly once.

pub mod api;
pub mod artifact;
pub mod config;
pub mod extractor;
pub mod jobs;
pub mod runner;
pub mod security;
