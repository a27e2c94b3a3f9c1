//! `dbcask list` — list states, instances, or names.

use std::path::PathBuf;

use clap::{Args, Subcommand};
use dbcask_registry::{InstanceFilter, NameFilter, StateFilter};

#[derive(Args, Debug)]
pub struct ListArgs {
    #[command(subcommand)]
    pub entity: ListEntity,

    /// Emit newline-delimited JSON instead of a JSON array.
    #[arg(long, global = true)]
    pub ndjson: bool,
}

#[derive(Subcommand, Debug)]
pub enum ListEntity {
    /// Prepared states in the content-addressed cache.
    States {
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        id_prefix: Option<String>,
    },
    /// Ephemeral instances materialized from a state.
    Instances {
        #[arg(long)]
        state_id: Option<String>,
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        id_prefix: Option<String>,
    },
    /// Names pointing at instances.
    Names {
        #[arg(long)]
        instance_id: Option<String>,
        #[arg(long)]
        state_id: Option<String>,
        #[arg(long)]
        image: Option<String>,
    },
}

impl ListArgs {
    pub async fn run(self, db_path: Option<PathBuf>, state_root: Option<PathBuf>) -> anyhow::Result<()> {
        let engine = crate::build_engine(db_path.as_deref(), state_root)?;
        let registry = engine.registry();
        let accept = if self.ndjson { Some("application/x-ndjson") } else { None };

        let (bytes, _content_type) = match self.entity {
            ListEntity::States { kind, image, id_prefix } => {
                let rows = registry.list_states(&StateFilter { prepare_kind: kind, image_id: image, id_prefix })?;
                dbcask_registry::render_listing(&rows, accept)?
            }
            ListEntity::Instances { state_id, image, id_prefix } => {
                let rows =
                    registry.list_instances(&InstanceFilter { state_id, image_id: image, id_prefix })?;
                dbcask_registry::render_listing(&rows, accept)?
            }
            ListEntity::Names { instance_id, state_id, image } => {
                let rows = registry.list_names(&NameFilter { instance_id, state_id, image_id: image })?;
                dbcask_registry::render_listing(&rows, accept)?
            }
        };

        print!("{}", String::from_utf8_lossy(&bytes));
        Ok(())
    }
}
