//! Source control checkout options.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Placeholder replaced by the package name in checkout commands and the spec name.
pub const SCM_PACKAGE: &str = "SCM_PKG";
/// Placeholder replaced by the branch selector in checkout commands.
pub const SCM_BRANCH: &str = "SCM_BRN";

/// How sources are fetched when building from source control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScmOptions {
    /// One of `git`, `svn` or `cvs`.
    pub method: String,
    pub cvs_get: String,
    pub git_get: String,
    pub svn_get: String,
    /// Spec file name inside the checkout.
    pub spec: String,
    /// Directory holding sources that are not kept in source control.
    pub ext_src_dir: PathBuf,
    /// Pack the checkout into `NAME-VERSION.tar.gz` before building.
    pub write_tar: bool,
    pub package: Option<String>,
    pub branch: Option<String>,
}

impl Default for ScmOptions {
    fn default() -> Self {
        Self {
            method: String::from("git"),
            cvs_get: format!("cvs -d /srv/cvs co {SCM_BRANCH} {SCM_PACKAGE}"),
            git_get: format!(
                "git clone {SCM_BRANCH} git://localhost/{SCM_PACKAGE}.git {SCM_PACKAGE}"
            ),
            svn_get: format!("svn co file:///srv/svn/{SCM_PACKAGE}/{SCM_BRANCH} {SCM_PACKAGE}"),
            spec: format!("{SCM_PACKAGE}.spec"),
            ext_src_dir: PathBuf::from("/dev/null"),
            write_tar: false,
            package: None,
            branch: None,
        }
    }
}

impl ScmOptions {
    /// Applies one `KEY=VALUE` option from the command line.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::BadScmOption` when the value has no `=`, the key
    /// is unknown, or `write_tar` is not a boolean.
    pub fn set_option(&mut self, option: &str) -> Result<(), ConfigError> {
        let bad = || ConfigError::BadScmOption {
            value: option.to_string(),
        };
        let (key, value) = option.split_once('=').ok_or_else(bad)?;
        match key.trim() {
            "method" => self.method = value.to_string(),
            "cvs_get" => self.cvs_get = value.to_string(),
            "git_get" => self.git_get = value.to_string(),
            "svn_get" => self.svn_get = value.to_string(),
            "spec" => self.spec = value.to_string(),
            "ext_src_dir" => self.ext_src_dir = PathBuf::from(value),
            "write_tar" => self.write_tar = parse_flag(value).ok_or_else(bad)?,
            "package" => self.package = Some(value.to_string()),
            "branch" => self.branch = Some(value.to_string()),
            _ => return Err(bad()),
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
