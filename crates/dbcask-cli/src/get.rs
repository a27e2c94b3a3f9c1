//! `dbcask get` — resolve an instance ID or name.

use std::path::PathBuf;

use clap::Args;

#[derive(Args, Debug)]
pub struct GetArgs {
    /// Instance ID, or the name it was registered under.
    pub id_or_name: String,
}

impl GetArgs {
    pub async fn run(self, db_path: Option<PathBuf>, state_root: Option<PathBuf>) -> anyhow::Result<()> {
        let engine = crate::build_engine(db_path.as_deref(), state_root)?;
        let result = engine.resolve(&self.id_or_name).await?;

        if !result.found {
            eprintln!("no instance found for {:?}", self.id_or_name);
            std::process::exit(1);
        }

        println!(
            "{}",
            serde_json::json!({
                "instance": result.entry,
                "resolved_by_name": result.resolved_by_name,
            })
        );
        Ok(())
    }
}
