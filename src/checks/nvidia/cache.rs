//! On-disk cache mapping VM UUIDs to the identity of the instance using them.
//!
//! The file is a JSON object keyed by UUID. Each entry holds the instance
//! name, owning tenant, selected metadata and the time it was last fetched:
//!
//! ```json
//! {
//!   "5c0038dc-4129-4dc3-8b64-20d309565abb": {
//!     "name": "compute-0",
//!     "tenant_id": "7b6f0c1a",
//!     "metadata": {"scale_group": "gpu"},
//!     "last_update": 1715000000
//!   }
//! }
//! ```

use crate::common::exec::{self, CommandError};
use crate::{debug, info, warn};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CACHE_FILE: &str = "nvidia_vgpu_instances.json";

const CACHE_MODE: u32 = 0o600;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Entry {
    #[serde(flatten)]
    instance: Instance,
    last_update: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("invalid instance listing: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The authoritative listing of instances, keyed by VM UUID.
#[async_trait]
pub trait InstanceSource: Send + Sync {
    async fn instances(&self) -> Result<HashMap<String, Instance>, CacheError>;
}

/// Runs a command that prints the instance listing as JSON.
pub struct CommandSource {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandSource {
    pub fn new(argv: &[String], timeout: Duration) -> Self {
        Self {
            argv: argv.to_vec(),
            timeout,
        }
    }
}

#[async_trait]
impl InstanceSource for CommandSource {
    async fn instances(&self) -> Result<HashMap<String, Instance>, CacheError> {
        let (program, args) = match self.argv.split_first() {
            Some(split) => split,
            None => return Ok(HashMap::new()),
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = exec::output(program, &args, self.timeout).await?;

        Ok(serde_json::from_str(&output)?)
    }
}

/// Instance identities for one collection cycle.
///
/// Opening the cache loads the file and rebuilds it when it is missing,
/// unreadable or older than `refresh`. A lookup miss triggers at most one
/// further rebuild for the lifetime of the value.
pub struct InstanceCache<'a, S> {
    path: PathBuf,
    source: &'a S,
    entries: HashMap<String, Entry>,
    rebuilt: bool,
}

impl<'a, S: InstanceSource> InstanceCache<'a, S> {
    pub async fn open(dir: &Path, refresh: Duration, source: &'a S) -> Self {
        let path = dir.join(CACHE_FILE);

        let entries = match read(&path) {
            Ok(entries) => entries,
            Err(e) => {
                info!("instance cache unavailable, rebuilding: {e}");
                HashMap::new()
            }
        };

        let mut cache = Self {
            path,
            source,
            entries,
            rebuilt: false,
        };

        if cache.is_stale(refresh) {
            cache.rebuild().await;
        }

        cache
    }

    fn is_stale(&self, refresh: Duration) -> bool {
        let oldest = match self.entries.values().map(|e| e.last_update).min() {
            Some(oldest) => oldest,
            None => return true,
        };

        now() - oldest > refresh.as_secs() as i64
    }

    /// Replace the entries with a fresh listing. On failure the existing
    /// entries are kept.
    async fn rebuild(&mut self) {
        self.rebuilt = true;

        let instances = match self.source.instances().await {
            Ok(instances) => instances,
            Err(e) => {
                warn!("failed to list instances: {e}");
                return;
            }
        };

        let last_update = now();
        self.entries = instances
            .into_iter()
            .map(|(uuid, instance)| {
                (
                    uuid,
                    Entry {
                        instance,
                        last_update,
                    },
                )
            })
            .collect();

        debug!("cached {} instances", self.entries.len());

        if let Err(e) = write(&self.path, &self.entries) {
            warn!("{e}");
        }
    }

    pub async fn lookup(&mut self, uuid: &str) -> Option<&Instance> {
        if !self.entries.contains_key(uuid) && !self.rebuilt {
            debug!("{uuid} not in instance cache");
            self.rebuild().await;
        }

        self.entries.get(uuid).map(|e| &e.instance)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn read(path: &Path) -> Result<HashMap<String, Entry>, CacheError> {
    let content = std::fs::read_to_string(path).map_err(|source| CacheError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(serde_json::from_str(&content)?)
}

// written to a temporary file in the same directory, then renamed into place
fn write(path: &Path, entries: &HashMap<String, Entry>) -> Result<(), CacheError> {
    let write_error = |source| CacheError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(write_error)?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(CACHE_MODE))
        .map_err(write_error)?;
    serde_json::to_writer(&mut file, entries)?;
    file.flush().map_err(write_error)?;
    file.persist(path).map_err(|e| write_error(e.error))?;

    Ok(())
}
