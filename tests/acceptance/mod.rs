//! Campaign-level acceptance tests.
//!
//! Every test runs in a temporary directory with simulated compiler,
//! mutation tool and scorer; no external binaries are needed.

mod common;
mod dedup_test;
mod finding_test;
mod miscompilation_test;
mod promotion_test;
mod retention_test;
