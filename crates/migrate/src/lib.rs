//! Rule-driven migration of parsed agent tooling configuration into a target
//! layout.
//!
//! The pipeline takes the IR produced by `ctxport-parse` and:
//!
//! - applies a declarative [`RuleSet`] (built in, optionally overridden by a
//!   user TOML/JSON file) to produce a [`TargetSchema`] and every gap
//! - emits deterministic JSON artifacts
//! - snapshots whatever those artifacts would replace
//! - writes them atomically and records a [`RunManifest`] so unchanged input
//!   is not regenerated
//!
//! A failure after the snapshot rolls the target back to its exact pre-run
//! state.
//!
//! # Example
//!
//! ```no_run
//! use ctxport_migrate::{Orchestrator, TranspileParams};
//!
//! let params = TranspileParams {
//!     source_root: "/home/me/.claude".into(),
//!     target_root: "/home/me/.config/opencode".into(),
//!     ..Default::default()
//! };
//! let report = Orchestrator::new().run(&params)?;
//! println!("{}", report.format_summary());
//! # Ok::<(), ctxport_migrate::TranspileError>(())
//! ```

#![deny(unsafe_code)]

pub mod backup;
pub mod emit;
mod error;
pub mod idempotency;
pub mod orchestrator;
pub mod report;
pub mod rules;
pub mod target;
pub mod transform;
pub mod writer;

use sha2::{Digest, Sha256};

pub use backup::{BackupError, BackupManager, RestoreReport, Snapshot};
pub use emit::{emit, preview, ArtifactChange, ArtifactSet, ChangeKind, EmitError};
pub use error::TranspileError;
pub use idempotency::{Decision, Reason, RunManifest};
pub use orchestrator::{Orchestrator, Stage, TranspileParams};
pub use report::{Outcome, RunStatus, TranspileReport};
pub use rules::{resolve_rules, ResolvedRules, RuleSet, RulesError};
pub use target::{TargetEntity, TargetSchema};
pub use transform::{transform, TransformError, Transformed};
pub use writer::{ArtifactWriter, FsWriter};

/// Directory under the target root holding backups and the run manifest.
pub const STATE_DIR: &str = ".ctxport";

pub type Result<T> = std::result::Result<T, TranspileError>;

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
