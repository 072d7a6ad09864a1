use serde::{Deserialize, Serialize};

/// Default key prefix under which rule data is stored in a bucket.
pub const DEFAULT_PREFIX: &str = "loft";

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

/// Where a rule's content lives remotely.
///
/// The endpoint scheme selects the backend: `http://` / `https://` for
/// S3-compatible services, `file:///dir` for a local directory,
/// `memory://` for a process-local store and `rclone://<remote>` for an
/// rclone remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<String>,
}

impl RemoteTarget {
    /// Object key for `relative` inside the namespace `scope` (the rule id).
    pub fn object_key(&self, scope: &str, relative: &str) -> String {
        let mut key = self.scope_prefix(scope);
        key.push_str(relative.trim_start_matches('/'));
        key
    }

    /// Key prefix, with trailing slash, under which every object of `scope` lives.
    pub fn scope_prefix(&self, scope: &str) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{scope}/")
        } else {
            format!("{prefix}/{scope}/")
        }
    }

    /// Scheme of the endpoint, lowercased (`"https"`, `"file"`, ...).
    pub fn scheme(&self) -> Option<String> {
        self.endpoint
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
    }
}

/// Named credentials referenced by [`RemoteTarget::credentials_ref`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .field("region", &self.region)
            .finish()
    }
}
