//! Source connection info.
//!
//! A [`SourceInfo`] is built once per logical data source and never changes
//! afterwards. Its [`SourceKey`] partitions both the connection pool and the
//! result cache.

use std::collections::BTreeMap;
use std::fmt;

use crate::dialect::{Dialect, DialectRegistry};
use crate::driver::Driver;
use crate::error::{SqlbookError, SqlbookResult};

/// Identity of a logical source: url, credentials, version and name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub version: Option<String>,
    pub name: String,
}

impl fmt::Debug for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceKey")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("version", &self.version)
            .field("name", &self.name)
            .finish()
    }
}

impl SourceKey {
    /// Stable text used as fingerprint input.
    pub fn canonical(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
            self.url,
            self.username.as_deref().unwrap_or(""),
            self.password.as_deref().unwrap_or(""),
            self.version.as_deref().unwrap_or(""),
            self.name
        )
    }
}

/// Connection details for one source, with its resolved dialect.
#[derive(Clone)]
pub struct SourceInfo {
    url: String,
    username: Option<String>,
    password: Option<String>,
    version: Option<String>,
    properties: BTreeMap<String, String>,
    dialect: Dialect,
    ext: bool,
    name: String,
}

impl fmt::Debug for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceInfo")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("dialect", &self.dialect.name)
            .field("ext", &self.ext)
            .finish_non_exhaustive()
    }
}

impl SourceInfo {
    pub fn builder(url: impl Into<String>) -> SourceInfoBuilder {
        SourceInfoBuilder::new(url)
    }

    pub fn key(&self) -> SourceKey {
        SourceKey {
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            version: self.version.clone(),
            name: self.name.clone(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    /// Whether this source uses an externally supplied driver.
    pub fn is_ext(&self) -> bool {
        self.ext
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Builder for [`SourceInfo`].
#[derive(Debug, Clone)]
pub struct SourceInfoBuilder {
    url: String,
    username: Option<String>,
    password: Option<String>,
    version: Option<String>,
    properties: BTreeMap<String, String>,
    ext: bool,
    name: Option<String>,
}

impl SourceInfoBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            version: None,
            properties: BTreeMap::new(),
            ext: false,
            name: None,
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Product version used for custom dialect matching.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into()).filter(|v: &String| !v.is_empty());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn ext(mut self, ext: bool) -> Self {
        self.ext = ext;
        self
    }

    /// Logical name; defaults to the url.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Resolve the dialect and freeze the source.
    ///
    /// Fails with a configuration error when no dialect matches and the
    /// driver does not accept the url, or when the driver cannot serve the
    /// resolved dialect.
    pub fn build(self, registry: &DialectRegistry, driver: &dyn Driver) -> SqlbookResult<SourceInfo> {
        let url = self.url.trim().to_string();
        if url.is_empty() {
            return Err(SqlbookError::Configuration("Source url is empty".to_string()));
        }

        let dialect = registry.resolve(&url, self.version.as_deref(), |u| driver.accepts_url(u))?;
        if !self.ext && !driver.supports(&dialect) {
            return Err(SqlbookError::Configuration(format!(
                "Driver {} does not support {} ({})",
                driver.name(),
                dialect.name,
                url
            )));
        }

        let name = self.name.unwrap_or_else(|| url.clone());
        Ok(SourceInfo {
            url,
            username: self.username,
            password: self.password,
            version: self.version,
            properties: self.properties,
            dialect,
            ext: self.ext,
            name,
        })
    }
}
