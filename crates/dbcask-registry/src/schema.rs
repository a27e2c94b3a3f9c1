//! Database schema definitions and constants.

pub const SCHEMA_VERSION: u32 = 3;

pub const TABLE_SCHEMA_MIGRATIONS: &str = "schema_migrations";
pub const TABLE_STATES: &str = "states";
pub const TABLE_INSTANCES: &str = "instances";
pub const TABLE_NAMES: &str = "names";

pub mod states {
    pub const ID: &str = "id";
    pub const FINGERPRINT: &str = "fingerprint";
    pub const IMAGE_ID: &str = "image_id";
    pub const PREPARE_KIND: &str = "prepare_kind";
    pub const PREPARE_ARGS_NORMALIZED: &str = "prepare_args_normalized";
    pub const CREATED_AT: &str = "created_at";
    pub const SIZE_BYTES: &str = "size_bytes";
    pub const STATUS: &str = "status";
    pub const PARENT_STATE_ID: &str = "parent_state_id";
    pub const LAST_USED_AT: &str = "last_used_at";
    pub const USE_COUNT: &str = "use_count";
    pub const MIN_RETENTION_UNTIL: &str = "min_retention_until";
    pub const EVICTED_AT: &str = "evicted_at";
    pub const EVICTION_REASON: &str = "eviction_reason";
    pub const SNAPSHOT_PATH: &str = "snapshot_path";
    pub const SNAPSHOT_PROVIDER: &str = "snapshot_provider";
}

pub mod instances {
    pub const ID: &str = "id";
    pub const STATE_ID: &str = "state_id";
    pub const IMAGE_ID: &str = "image_id";
    pub const CREATED_AT: &str = "created_at";
    pub const EXPIRES_AT: &str = "expires_at";
    pub const STATUS: &str = "status";
    pub const RUNTIME_ID: &str = "runtime_id";
    pub const RUNTIME_DIR: &str = "runtime_dir";
    pub const CLONE_CLEANUP_TOKEN: &str = "clone_cleanup_token";
}

pub mod names {
    pub const NAME: &str = "name";
    pub const INSTANCE_ID: &str = "instance_id";
    pub const STATE_ID: &str = "state_id";
    pub const STATE_FINGERPRINT: &str = "state_fingerprint";
    pub const IMAGE_ID: &str = "image_id";
    pub const LAST_USED_AT: &str = "last_used_at";
    pub const IS_PRIMARY: &str = "is_primary";
}
