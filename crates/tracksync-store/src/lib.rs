//! Embedded document store for tracksync.
//!
//! Devices, device settings and user preferences are stored as JSON documents
//! in SQLite, next to the columns that are filtered on: the natural key, the
//! optimistic-concurrency version and, for devices, `updated_at`.
//!
//! # Example
//!
//! ```
//! use tracksync_store::Store;
//! use tracksync_types::DeviceSettings;
//!
//! let store = Store::open_in_memory()?;
//! store.insert_settings_if_absent(&DeviceSettings::defaults_for("abc"))?;
//!
//! let settings = store.get_settings("abc")?.expect("just inserted");
//! assert_eq!(settings.version, 1);
//! # Ok::<(), tracksync_store::Error>(())
//! ```

mod error;
mod schema;
mod settings;
mod store;

pub use error::{Error, Result};
pub use store::{ClearCounts, MAX_DECLARED_VERSION, Store};

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/tracksync/data.db`
/// - macOS: `~/Library/Application Support/tracksync/data.db`
/// - Windows: `C:\Users\<user>\AppData\Local\tracksync\data.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("tracksync")
        .join("data.db")
}
