//! `dbcask rm` — remove an instance or a prepared state.

use std::path::PathBuf;

use clap::{Args, Subcommand};

#[derive(Args, Debug)]
pub struct RmArgs {
    #[command(subcommand)]
    pub target: RmTarget,
}

#[derive(Subcommand, Debug)]
pub enum RmTarget {
    /// Destroy an instance: stop its runtime, release its clone, delete
    /// the row.
    Instance { id: String },
    /// Delete a prepared state. Fails while any instance still
    /// references it.
    State { id: String },
}

impl RmArgs {
    pub async fn run(self, db_path: Option<PathBuf>, state_root: Option<PathBuf>) -> anyhow::Result<()> {
        match self.target {
            RmTarget::Instance { id } => {
                let engine = crate::build_engine(db_path.as_deref(), state_root)?;
                engine.destroy_instance(&id).await?;
            }
            RmTarget::State { id } => {
                let registry = crate::open_registry(db_path.as_deref())?;
                registry.delete_state(&id)?;
            }
        }
        Ok(())
    }
}
