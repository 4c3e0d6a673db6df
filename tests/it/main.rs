//! Integration tests for arcyd.
//!
//! These drive the real engine components against throwaway git repositories
//! (a bare "origin" plus working copies in a tempdir) and an in-memory fake
//! review service. No network, no real review service.

mod helper;

mod machine;
mod processor;
