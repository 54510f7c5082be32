pub mod cache;
pub mod diff;
pub mod dotenv;
pub mod expand;
pub mod filter;
pub mod mapping;
pub mod reconciler;
pub mod validate;

pub use diff::{diff_env, ChangedEntry, DiffResult};
pub use reconciler::{EnvReconciler, EnvReport, EnvSource, SyncOptions};
pub use validate::{validate_env, EnvRules, ValidationReport};
