//! # Attendance Harness
//!
//! A face-verified attendance backend. People enroll a face embedding,
//! verify against an in-memory similarity index, and punch in; slow side
//! effects (photo upload, spreadsheet mirror) run on a bounded background
//! executor with retry and backoff.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────────┐   ┌──────────┐
//! │   HTTP   │──▶│ people / recognition│──▶│  SQLite  │
//! │  (axum)  │   │     / attendance    │   │  store   │
//! └──────────┘   └─────────┬──────────┘   └────┬─────┘
//!                          │                    │ rebuild
//!             ┌────────────┴──────┐        ┌────▼─────┐
//!             ▼                   ▼        │  Vector  │
//!      ┌─────────────┐    ┌─────────────┐  │  Index   │
//!      │TaskExecutor │──▶ │ S3 / Sheets │  └──────────┘
//!      └─────────────┘    └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! attend init                   # create database
//! attend serve                  # start HTTP server
//! attend index rebuild          # check what the index will hold
//! attend stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`index`] | In-memory cosine-similarity index |
//! | [`tasks`] | Background task executor |
//! | [`retry`] | Bounded retry with exponential backoff |
//! | [`face`] | Face embedding extraction seam |
//! | [`recognition`] | Verify and enroll |
//! | [`people`] | People registry |
//! | [`attendance`] | Punch recording |
//! | [`sheets`] | Spreadsheet sink |
//! | [`storage`] | Object storage sink |
//! | [`server`] | HTTP API |
//! | [`sqlite_store`] | SQLite store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod app;
pub mod attendance;
pub mod config;
pub mod db;
pub mod error;
pub mod face;
pub mod index;
pub mod logging;
pub mod migrate;
pub mod people;
pub mod recognition;
pub mod retry;
pub mod server;
pub mod sheets;
pub mod sqlite_store;
pub mod stats;
pub mod storage;
pub mod tasks;
