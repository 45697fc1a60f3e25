//! Repository signing key handling.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::PackageSource;

/// gpg invocation writing to APT's trusted keyring inside the root.
pub const GPG: [&str; 10] = [
    "gpg",
    "--batch",
    "--no-options",
    "--no-default-keyring",
    "--secret-keyring",
    "/etc/apt/secring.gpg",
    "--trustdb-name",
    "/etc/apt/trustdb.gpg",
    "--keyring",
    "/etc/apt/trusted.gpg",
];

/// How a configured `gpgkey` is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    /// A key file on the host, imported from a copy inside the root.
    File(PathBuf),
    /// A short key ID, received from the keyserver.
    KeyId(String),
    /// Anything else is handed to `gpg --fetch-keys`.
    Url(String),
}

impl KeyMaterial {
    pub fn classify(key: &str) -> Self {
        if Path::new(key).is_file() {
            KeyMaterial::File(PathBuf::from(key))
        } else if key.chars().count() == 8 {
            KeyMaterial::KeyId(key.to_string())
        } else {
            KeyMaterial::Url(key.to_string())
        }
    }
}

/// Key material and keyring packages collected from all sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPlan {
    pub files: Vec<PathBuf>,
    pub recv: Vec<String>,
    pub fetch: Vec<String>,
    pub keyrings: Vec<String>,
}

impl KeyPlan {
    pub fn collect(sources: &BTreeMap<String, PackageSource>) -> Self {
        let mut plan = KeyPlan::default();
        for source in sources.values() {
            if let Some(key) = source.gpgkey.as_deref().filter(|k| !k.is_empty()) {
                match KeyMaterial::classify(key) {
                    KeyMaterial::File(path) => plan.files.push(path),
                    KeyMaterial::KeyId(id) => plan.recv.push(id),
                    KeyMaterial::Url(url) => plan.fetch.push(url),
                }
            }
            if let Some(keyring) = source.keyring.as_deref().filter(|k| !k.is_empty()) {
                plan.keyrings.push(keyring.to_string());
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.recv.is_empty()
            && self.fetch.is_empty()
            && self.keyrings.is_empty()
    }

    /// `gpg --recv-keys` arguments, if any key IDs were collected.
    pub fn recv_args(&self, keyserver: &str) -> Option<Vec<String>> {
        if self.recv.is_empty() {
            return None;
        }
        let mut args = vec![
            "--keyserver".to_string(),
            keyserver.to_string(),
            "--recv-keys".to_string(),
        ];
        args.extend(self.recv.iter().cloned());
        Some(args)
    }

    /// `gpg --fetch-keys` arguments, if any URLs were collected.
    pub fn fetch_args(&self) -> Option<Vec<String>> {
        if self.fetch.is_empty() {
            return None;
        }
        let mut args = vec!["--fetch-keys".to_string()];
        args.extend(self.fetch.iter().cloned());
        Some(args)
    }
}

/// Full gpg argument vector for `args`.
pub fn gpg_argv<S: AsRef<str>>(args: &[S]) -> Vec<String> {
    GPG.iter()
        .map(|s| s.to_string())
        .chain(args.iter().map(|a| a.as_ref().to_string()))
        .collect()
}
