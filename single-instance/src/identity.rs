use crate::Error;
use std::path::Path;
use std::path::PathBuf;

const MAX_PREFIX_LEN: usize = 32;

/// Application scoped key naming the lock file and the socket.
///
/// The key is per user: the same name used by two users maps to different
/// artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    name: String,
    uid: u32,
    digest: u64,
}

impl InstanceIdentity {
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidIdentity("identity must not be empty".into()));
        }
        let uid = nix::unistd::geteuid().as_raw();
        let digest = fnv1a(name.as_bytes());
        Ok(InstanceIdentity { name, uid, digest })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// File name stem shared by the lock file and the socket, e.g.
    /// `org.example.App-1000-9f3c...`
    pub fn file_stem(&self) -> String {
        format!(
            "{}-{}-{:016x}",
            sanitize_prefix(&self.name),
            self.uid,
            self.digest
        )
    }

    pub fn lock_path(&self, runtime_dir: &Path) -> PathBuf {
        runtime_dir.join(format!("{}.lock", self.file_stem()))
    }

    pub fn socket_path(&self, runtime_dir: &Path) -> PathBuf {
        runtime_dir.join(format!("{}.sock", self.file_stem()))
    }
}

/// `$XDG_RUNTIME_DIR` when available, the temp dir otherwise
pub fn default_runtime_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// Make a readable file name prefix from an arbitrary string, uniqueness
/// comes from the digest
fn sanitize_prefix(input: &str) -> String {
    let prefix: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_PREFIX_LEN)
        .collect();
    let prefix = prefix.trim_start_matches('.');
    if prefix.is_empty() {
        "instance".to_string()
    } else {
        prefix.to_string()
    }
}

// FNV-1a, the digest has to stay the same across builds so that different
// versions of an application find each other. DefaultHasher gives no such
// guarantee.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
