//! Identity of the running instance.

use std::path::Path;

use serde::Deserialize;
use tracing::{error, info};

use crate::error::{Error, Result};

pub const METADATA_FILE_ENV: &str = "ECS_CONTAINER_METADATA_FILE";

const CONTAINER_ID_LEN: usize = 12;

#[derive(Debug, Deserialize)]
struct ContainerMetadata {
    #[serde(rename = "ContainerID")]
    container_id: Option<String>,
}

/// Short id of this instance.
///
/// Inside ECS this is the tail of the container id from the metadata file
/// named by `ECS_CONTAINER_METADATA_FILE`. Otherwise, or when the file
/// cannot be read, it is the host name without `.` and `-`.
pub fn get_instance_id() -> String {
    let metadata_file = std::env::var_os(METADATA_FILE_ENV);
    instance_id_from(metadata_file.as_deref().map(Path::new))
}

pub(crate) fn instance_id_from(metadata_file: Option<&Path>) -> String {
    if let Some(path) = metadata_file {
        info!(path = %path.display(), "{METADATA_FILE_ENV}");
        match container_id(path) {
            Ok(id) => return id,
            Err(err) => error!(error = %err, "Failed to get instance id"),
        }
    }
    host_id(&hostname())
}

fn container_id(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path)?;
    let metadata: ContainerMetadata = serde_json::from_str(&contents)?;
    let id = metadata.container_id.ok_or(Error::MissingField {
        service: "ecs",
        field: "ContainerID",
    })?;

    let chars: Vec<char> = id.chars().collect();
    Ok(chars[chars.len().saturating_sub(CONTAINER_ID_LEN)..]
        .iter()
        .collect())
}

fn host_id(hostname: &str) -> String {
    hostname.replace(['.', '-'], "")
}

#[cfg(target_os = "linux")]
fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|name| name.trim().to_string())
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(hostname_from_env)
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(not(target_os = "linux"))]
fn hostname() -> String {
    hostname_from_env().unwrap_or_else(|| "localhost".to_string())
}

fn hostname_from_env() -> Option<String> {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn metadata_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const CONTAINER_ID: &str = "98e44444008169587b826b4cd76c6732e5899747e753af1e19a35db64f9e9c32";

    #[test]
    fn long_container_id_is_shortened() {
        let contents = serde_json::json!({"Cluster": "prod", "ContainerID": CONTAINER_ID});
        let file = metadata_file(&contents.to_string());
        assert_eq!(instance_id_from(Some(file.path())), "5db64f9e9c32");
    }

    #[test]
    fn short_container_id_is_kept() {
        let file = metadata_file(r#"{"ContainerID":"abc123"}"#);
        assert_eq!(instance_id_from(Some(file.path())), "abc123");
    }

    #[test]
    fn broken_metadata_falls_back_to_host() {
        let file = metadata_file("{not json");
        assert_eq!(instance_id_from(Some(file.path())), host_id(&hostname()));

        let missing_id = metadata_file(r#"{"Cluster":"prod"}"#);
        assert_eq!(instance_id_from(Some(missing_id.path())), host_id(&hostname()));

        let missing_file = Path::new("/nonexistent/ecs-metadata.json");
        assert_eq!(instance_id_from(Some(missing_file)), host_id(&hostname()));
    }

    #[test]
    fn host_id_strips_separators() {
        assert_eq!(
            host_id("ip-10-0-1-23.eu-west-1.compute.internal"),
            "ip100123euwest1computeinternal"
        );
        assert!(!instance_id_from(None).contains(['.', '-']));
    }
}
