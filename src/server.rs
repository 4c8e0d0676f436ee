//! Lifecycle control of a single slapd child process and its working
//! tree.

use std::path::Path;
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::cleanup;
use crate::commands::CommandError;
use crate::config::{ConfigError, ServerConfig, ServerOptions};
use crate::paths::ToolPaths;

/// How long `start()` waits for the readiness probe to succeed.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between readiness probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// The child process, or the lack of one.
enum State {
    Stopped,
    Running(Child),
}

/// Controller for one slapd instance.
///
/// Owns the spawned server process and a private working tree under the
/// temp directory. `start()` builds the tree, imports the configuration,
/// spawns the server and waits for it to come up; `stop()` terminates it
/// and removes the tree. Dropping the controller performs a best-effort
/// `stop()`.
pub struct SlapdServer {
    config: ServerConfig,
    tools: ToolPaths,
    state: State,
    cleanup_token: Option<cleanup::Token>,
}

/// Connection parameters of an instance, for display.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
    pub ldap_uri: String,
    pub ldapi_uri: Option<String>,
    pub suffix: String,
    pub root_dn: String,
    pub root_pw: String,
    pub testrundir: String,
}

impl SlapdServer {
    /// Create a controller: resolves the external tools and the instance
    /// configuration. Fails fast when a tool or the schema directory is
    /// missing; nothing is started yet.
    pub fn new(options: ServerOptions) -> Result<Self, ConfigError> {
        let tools = ToolPaths::resolve()?;
        let config = ServerConfig::resolve(options)?;
        Ok(Self {
            config,
            tools,
            state: State::Stopped,
            cleanup_token: None,
        })
    }

    /// Create a controller with all-default options.
    pub fn with_defaults() -> Result<Self, ConfigError> {
        Self::new(ServerOptions::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            host: self.config.host.clone(),
            port: self.config.port,
            ldap_uri: self.config.ldap_uri.clone(),
            ldapi_uri: self.config.ldapi_uri.clone(),
            suffix: self.config.suffix.clone(),
            root_dn: self.config.root_dn(),
            root_pw: self.config.root_pw.clone(),
            testrundir: self.config.testrundir.display().to_string(),
        }
    }

    /// Start the server and wait for it to come up. No-op when already
    /// running. On any failure the controller is left stopped, with a
    /// partially spawned child terminated and reaped.
    pub fn start(&mut self) -> Result<(), StartError> {
        if let State::Running(_) = self.state {
            return Ok(());
        }

        if self.cleanup_token.is_none() {
            self.cleanup_token = Some(cleanup::register(self.config.testrundir.clone()));
        }

        cleanup_rundir(&self.config).map_err(StartError::Cleanup)?;
        setup_rundir(&self.config).map_err(StartError::Setup)?;
        self.write_config()?;
        self.test_config()?;
        self.start_slapd()?;
        info!(
            "slapd listening on {} and {:?}",
            self.config.ldap_uri, self.config.ldapi_uri
        );
        Ok(())
    }

    /// Terminate the server, reap it, and remove the working tree. No-op
    /// when not running; always safe to call again.
    pub fn stop(&mut self) -> std::io::Result<()> {
        if let State::Running(child) = &mut self.state {
            debug!("stopping slapd with pid {}", child.id());
            terminate(child)?;
            child.wait()?;
        }
        self.stopped();
        cleanup_rundir(&self.config)?;
        if let Some(token) = self.cleanup_token.take() {
            cleanup::unregister(token);
        }
        Ok(())
    }

    /// Re-spawn the server against the existing data store, without
    /// regenerating configuration, and wait for it to come up again.
    pub fn restart(&mut self) -> Result<(), StartError> {
        match &mut self.state {
            State::Running(child) => {
                terminate(child).map_err(StartError::Terminate)?;
                child.wait().map_err(StartError::Wait)?;
                self.stopped();
            }
            State::Stopped => return Err(StartError::NotRunning),
        }
        self.start_slapd()
    }

    /// Block until the server exits on its own, then clear the handle.
    /// The working tree is left in place.
    pub fn wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        if let State::Running(child) = &mut self.state {
            let status = child.wait()?;
            self.stopped();
            return Ok(Some(status));
        }
        Ok(None)
    }

    /// Import the generated configuration and the requested schemas into
    /// the config backend.
    fn write_config(&self) -> Result<(), StartError> {
        debug!("importing configuration: {}", self.config.slapd_conf.display());

        let doc = self.config.generate();
        self.slapadd(Some(&doc), &["-n0"], &[0])
            .map_err(StartError::ConfigImport)?;

        for schema in &self.config.schemas {
            let path = if Path::new(schema).exists() {
                Path::new(schema).to_path_buf()
            } else {
                self.tools.schema_dir.join(schema)
            };
            let path = path.to_string_lossy();
            self.slapadd(None, &["-n0", "-l", &path], &[0])
                .map_err(StartError::ConfigImport)?;
        }

        debug!("import ok: {}", self.config.slapd_conf.display());
        Ok(())
    }

    /// Validate the imported configuration with the server's built-in
    /// config-test mode.
    fn test_config(&self) -> Result<(), StartError> {
        debug!("testing config {}", self.config.slapd_conf.display());
        let output = Command::new(&self.tools.slapd)
            .arg("-Ttest")
            .arg("-F")
            .arg(&self.config.slapd_conf)
            .args(["-u", "-v", "-d", "config"])
            .output()
            .map_err(StartError::Spawn)?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            error!("{}", combined);
            return Err(StartError::ConfigTest(combined));
        }
        info!("config ok: {}", self.config.slapd_conf.display());
        Ok(())
    }

    /// Spawn the server bound to the configured listeners and poll the
    /// readiness probe until it answers or the deadline passes.
    fn start_slapd(&mut self) -> Result<(), StartError> {
        let mut urls = vec![self.config.ldap_uri.clone()];
        if let Some(uri) = &self.config.ldapi_uri {
            urls.push(uri.clone());
        }

        let debug_level = if self.debug_enabled() { "-1" } else { "0" };
        let mut command = Command::new(&self.tools.slapd);
        command
            .arg("-F")
            .arg(&self.config.slapd_conf)
            .arg("-h")
            .arg(urls.join(" "))
            .args(["-d", debug_level]);

        info!("starting slapd: {:?}", command);
        let child = command.spawn().map_err(StartError::Spawn)?;
        let pid = child.id();
        if let Some(token) = self.cleanup_token {
            cleanup::set_pid(token, Some(pid as i32));
        }
        self.state = State::Running(child);

        let deadline = Instant::now() + STARTUP_TIMEOUT;
        loop {
            let poll = match &mut self.state {
                State::Running(child) => child.try_wait(),
                State::Stopped => Ok(None),
            };
            let status = match poll {
                Ok(status) => status,
                Err(e) => {
                    self.terminate_and_reap();
                    return Err(StartError::Wait(e));
                }
            };
            if let Some(status) = status {
                self.stopped();
                return Err(StartError::ExitedEarly(status));
            }

            debug!("readiness check against {}", self.config.default_ldap_uri());
            if self.ldapwhoami(&[], &[0]).is_ok() {
                debug!("slapd with pid={} is ready", pid);
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.terminate_and_reap();
                return Err(StartError::Timeout);
            }
            std::thread::sleep(PROBE_INTERVAL);
        }
    }

    fn debug_enabled(&self) -> bool {
        match self.config.debug {
            Some(debug) => debug,
            None => tracing::enabled!(tracing::Level::DEBUG),
        }
    }

    /// Best-effort termination, used on startup failure paths.
    fn terminate_and_reap(&mut self) {
        if let State::Running(child) = &mut self.state {
            let _ = terminate(child);
            let _ = child.wait();
        }
        self.stopped();
    }

    /// Called once the child is known to have terminated.
    fn stopped(&mut self) {
        if let State::Running(child) = &self.state {
            info!("slapd[{}] terminated", child.id());
        }
        self.state = State::Stopped;
        if let Some(token) = self.cleanup_token {
            cleanup::set_pid(token, None);
        }
    }
}

impl Drop for SlapdServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("cleanup on drop failed: {}", e);
        }
    }
}

/// Create the working tree: scratch root, config subtree, data subtree.
fn setup_rundir(config: &ServerConfig) -> std::io::Result<()> {
    debug!("creating working tree {}", config.testrundir.display());
    std::fs::create_dir_all(&config.testrundir)?;
    std::fs::create_dir_all(&config.slapd_conf)?;
    std::fs::create_dir_all(&config.db_directory)?;
    Ok(())
}

/// Remove the working tree, including anything a previous unclean
/// shutdown left behind.
fn cleanup_rundir(config: &ServerConfig) -> std::io::Result<()> {
    if !config.testrundir.exists() {
        return Ok(());
    }
    debug!("removing working tree {}", config.testrundir.display());
    std::fs::remove_dir_all(&config.testrundir)?;
    info!("cleaned up {}", config.testrundir.display());
    Ok(())
}

/// Graceful termination: SIGTERM, so slapd can close its store cleanly.
#[cfg(unix)]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM)
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

#[derive(Debug)]
pub enum StartError {
    Cleanup(std::io::Error),
    Setup(std::io::Error),
    ConfigImport(CommandError),
    ConfigTest(String),
    Spawn(std::io::Error),
    Wait(std::io::Error),
    Terminate(std::io::Error),
    ExitedEarly(ExitStatus),
    Timeout,
    NotRunning,
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::Cleanup(e) => write!(f, "Failed to remove stale working tree: {}", e),
            StartError::Setup(e) => write!(f, "Failed to create working tree: {}", e),
            StartError::ConfigImport(e) => write!(f, "Failed to import configuration: {}", e),
            StartError::ConfigTest(_) => write!(f, "Configuration test failed"),
            StartError::Spawn(e) => write!(f, "Failed to spawn slapd: {}", e),
            StartError::Wait(e) => write!(f, "Failed waiting on slapd: {}", e),
            StartError::Terminate(e) => write!(f, "Failed to terminate slapd: {}", e),
            StartError::ExitedEarly(status) => {
                write!(f, "slapd exited before becoming ready ({})", status)
            }
            StartError::Timeout => write!(f, "slapd did not become ready before the deadline"),
            StartError::NotRunning => write!(f, "Server is not running"),
        }
    }
}

impl std::error::Error for StartError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerOptions;

    // Distinct prefixes keep the tree names apart when tests run in
    // parallel and the kernel hands out the same ephemeral port twice.
    fn scratch_config(prefix: &str) -> ServerConfig {
        let options = ServerOptions {
            datadir_prefix: prefix.to_string(),
            ..Default::default()
        };
        ServerConfig::resolve(options).unwrap()
    }

    #[test]
    fn working_tree_create_and_remove() {
        let config = scratch_config("slapd-tree-test");
        setup_rundir(&config).unwrap();
        assert!(config.testrundir.is_dir());
        assert!(config.slapd_conf.is_dir());
        assert!(config.db_directory.is_dir());

        cleanup_rundir(&config).unwrap();
        assert!(!config.testrundir.exists());
    }

    #[test]
    fn removing_missing_tree_is_a_noop() {
        let config = scratch_config("slapd-noop-test");
        assert!(!config.testrundir.exists());
        cleanup_rundir(&config).unwrap();
    }

    #[test]
    fn setup_replaces_stale_tree_contents() {
        let config = scratch_config("slapd-stale-test");
        setup_rundir(&config).unwrap();
        std::fs::write(config.db_directory.join("stale.mdb"), b"junk").unwrap();

        cleanup_rundir(&config).unwrap();
        setup_rundir(&config).unwrap();
        assert!(!config.db_directory.join("stale.mdb").exists());

        cleanup_rundir(&config).unwrap();
    }
}
