pub mod schema;

pub use schema::{
    Config, StorageConfig, TrustedDeviceConfig, ENV_DB_PATH, ENV_PEPPER, ENV_PEPPER_PREV,
    MAX_WINDOW_DAYS,
};
