//! # Attendance Harness Core
//!
//! Runtime-agnostic building blocks for Attendance Harness: data models,
//! vector math for face embeddings, and the store traits that the
//! similarity index and the people/attendance flows are written against.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. The
//! SQLite-backed store and everything that schedules work live in the
//! `attendance-harness` app crate.

pub mod models;
pub mod store;
pub mod vector;
