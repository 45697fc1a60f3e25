//! Package profile resolution.
//!
//! The package set installed into the root comes from a [`ProfileSource`].
//! [`StaticProfile`] serves the `[profile] packages` list of the build
//! configuration; richer resolvers plug in through the same trait.

use std::collections::BTreeSet;

use crate::config::ProfileConfig;

/// Supplies the names of packages to install.
pub trait ProfileSource {
    fn packages(&self) -> BTreeSet<String>;
}

/// A fixed package list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticProfile {
    packages: BTreeSet<String>,
}

impl StaticProfile {
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            packages: packages
                .into_iter()
                .map(|p| p.as_ref().trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &ProfileConfig) -> Self {
        Self::new(&config.packages)
    }
}

impl ProfileSource for StaticProfile {
    fn packages(&self) -> BTreeSet<String> {
        self.packages.clone()
    }
}
