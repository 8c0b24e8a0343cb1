//! Common test infrastructure
//!
//! Integration tests import from this module only.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{AlbumFixture, TestHarness};
//!
//! #[tokio::test]
//! async fn test_convert_album() {
//!     let harness = TestHarness::new();
//!     AlbumFixture::new("Album").track("01.dsf").write(&harness.input_dir);
//!     let outcome = harness.process("Album").await;
//!     assert!(outcome.is_completed());
//! }
//! ```

mod fakes;
mod fixtures;
mod harness;

pub use fakes::{FixedSpace, ScriptedExtractor, ScriptedTranscoder};
pub use fixtures::{count_files, AlbumFixture};
pub use harness::TestHarness;
