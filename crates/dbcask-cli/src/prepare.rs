//! `dbcask prepare` — get-or-build a prepared state and materialize a
//! fresh instance from it.

use std::path::PathBuf;

use clap::Args;
use dbcask_core::PrepareRequest;

#[derive(Args, Debug)]
pub struct PrepareArgs {
    /// Base image identifier, e.g. `postgres:16`.
    pub image: String,

    /// Prepare step kind: `psql` or `pgbench`.
    #[arg(long, default_value = "psql")]
    pub kind: String,

    /// Arguments passed to the prepare step. Repeat `--arg` for each one.
    #[arg(long = "arg")]
    pub args: Vec<String>,

    /// Register the new instance under this name.
    #[arg(long)]
    pub name: Option<String>,
}

impl PrepareArgs {
    pub async fn run(self, db_path: Option<PathBuf>, state_root: Option<PathBuf>) -> anyhow::Result<()> {
        let engine = crate::build_engine(db_path.as_deref(), state_root)?;
        let outcome = engine
            .prepare(PrepareRequest {
                image_id: self.image,
                prepare_kind: self.kind,
                prepare_args: self.args,
                name: self.name,
            })
            .await?;

        println!(
            "{}",
            serde_json::json!({
                "state_id": outcome.state_id,
                "instance_id": outcome.instance_id,
                "fingerprint": outcome.fingerprint,
                "created_new_state": outcome.created_new_state,
            })
        );
        Ok(())
    }
}
