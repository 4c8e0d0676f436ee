//! Resolution of the OpenLDAP executables and the schema directory.
//!
//! Uses env vars when set, otherwise searches the binary path, with the
//! sbin directories appended for the server-side tools.

use std::path::PathBuf;

use crate::config::ConfigError;

/// Resolved absolute paths to the required external executables.
///
/// Discovered once at construction; a missing executable is a fatal
/// configuration error, never retried at call time.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub ldapadd: PathBuf,
    pub ldapmodify: PathBuf,
    pub ldapdelete: PathBuf,
    pub ldapsearch: PathBuf,
    pub ldapwhoami: PathBuf,
    pub slapadd: PathBuf,
    pub slapcat: PathBuf,
    pub slapd: PathBuf,
    pub schema_dir: PathBuf,
}

impl ToolPaths {
    /// Resolve every executable and the schema directory from the
    /// environment: `SLAPD` overrides the server binary, `SCHEMA` the
    /// schema directory, `BIN`/`SBIN` the search paths.
    pub fn resolve() -> Result<Self, ConfigError> {
        let bin = bin_search_path();
        let sbin = sbin_search_path(&bin);

        let slapd = match env_path("SLAPD") {
            Some(path) => path,
            None => find_tool("slapd", &sbin, "SBIN")?,
        };

        let schema_dir = schema_dir().ok_or(ConfigError::NoSchemaDir)?;

        Ok(Self {
            ldapadd: find_tool("ldapadd", &bin, "BIN")?,
            ldapmodify: find_tool("ldapmodify", &bin, "BIN")?,
            ldapdelete: find_tool("ldapdelete", &bin, "BIN")?,
            ldapsearch: find_tool("ldapsearch", &bin, "BIN")?,
            ldapwhoami: find_tool("ldapwhoami", &bin, "BIN")?,
            slapadd: find_tool("slapadd", &sbin, "SBIN")?,
            slapcat: find_tool("slapcat", &sbin, "SBIN")?,
            slapd,
            schema_dir,
        })
    }
}

/// `BIN` override, else the regular `PATH`.
fn bin_search_path() -> String {
    std::env::var("BIN")
        .ok()
        .filter(|val| !val.trim().is_empty())
        .or_else(|| std::env::var("PATH").ok())
        .unwrap_or_else(|| "/usr/local/bin:/usr/bin:/bin".to_string())
}

/// `SBIN` override, else the binary path with sbin directories appended.
fn sbin_search_path(bin: &str) -> String {
    match std::env::var("SBIN") {
        Ok(val) if !val.trim().is_empty() => val,
        _ => add_sbin(bin),
    }
}

/// Append the sbin directories to a command search path unless already
/// present. No-op on Windows.
fn add_sbin(path: &str) -> String {
    if cfg!(unix) {
        let mut directories: Vec<&str> = path.split(':').collect();
        for sbin in ["/usr/local/sbin", "/sbin", "/usr/sbin"] {
            if !directories.contains(&sbin) {
                directories.push(sbin);
            }
        }
        directories.join(":")
    } else {
        path.to_string()
    }
}

fn find_tool(command: &str, search_path: &str, var: &'static str) -> Result<PathBuf, ConfigError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    which::which_in(command, Some(search_path), cwd)
        .map_err(|_| ConfigError::CommandNotFound(command.to_string(), var))
}

/// Path from an environment override, tilde-expanded. Empty values are
/// treated as unset.
fn env_path(var: &str) -> Option<PathBuf> {
    let val = std::env::var(var).ok()?;
    let trimmed = val.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(shellexpand::tilde(trimmed).as_ref()))
}

/// `SCHEMA` override, else the well-known schema locations.
fn schema_dir() -> Option<PathBuf> {
    if let Some(dir) = env_path("SCHEMA") {
        return Some(dir);
    }
    ["/etc/openldap/schema", "/etc/ldap/schema"]
        .iter()
        .map(PathBuf::from)
        .find(|dir| dir.is_dir())
}
