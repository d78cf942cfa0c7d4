//! Common library for the Detailers University backend
//!
//! This crate provides shared functionality used across the services:
//! database connectivity, error handling, user accounts, password hashing,
//! JWT handling and input validation.

pub mod database;
pub mod error;
pub mod jwt;
pub mod password;
pub mod users;
pub mod validation;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
