pub mod assemble;
pub mod build;
pub mod enumerate;
pub mod error;
pub mod hashtree;
pub mod header;
pub mod layout;
pub mod levels;
pub mod metadata;
pub mod progress;
pub mod scratch;
pub mod verify;

pub use build::{build, spawn, BuildConfig, BuildContext, BuildHandle, BuildReport, CancelToken};
pub use error::{BuildError, VerifyError};
