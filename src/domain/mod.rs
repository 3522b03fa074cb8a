//! Core domain types and logic.

pub mod aggregator;
pub mod calendar;
pub mod config;
pub mod document;
pub mod error;
pub mod sample;
pub mod views;
