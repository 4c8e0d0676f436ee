//! Thin runners for the OpenLDAP command-line tools.
//!
//! Each helper builds the argument vector for one external binary, feeds
//! it optional stdin content, runs it synchronously, and classifies the
//! exit code against an explicit set of acceptable codes.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::config::ServerConfig;
use crate::server::SlapdServer;

/// Captured result of one tool invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command_line: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl SlapdServer {
    /// Runs `ldapwhoami` against this instance.
    pub fn ldapwhoami(
        &self,
        extra_args: &[&str],
        expected: &[i32],
    ) -> Result<CommandOutput, CommandError> {
        self.run_tool(&self.tools().ldapwhoami, extra_args, None, expected)
    }

    /// Runs `ldapadd`, feeding it the LDIF content on stdin.
    pub fn ldapadd(
        &self,
        ldif: &str,
        extra_args: &[&str],
        expected: &[i32],
    ) -> Result<CommandOutput, CommandError> {
        self.run_tool(&self.tools().ldapadd, extra_args, Some(ldif), expected)
    }

    /// Runs `ldapmodify`, feeding it the LDIF content on stdin.
    pub fn ldapmodify(
        &self,
        ldif: &str,
        extra_args: &[&str],
        expected: &[i32],
    ) -> Result<CommandOutput, CommandError> {
        self.run_tool(&self.tools().ldapmodify, extra_args, Some(ldif), expected)
    }

    /// Runs `ldapdelete` on `dn`, with `-r` when deleting recursively.
    pub fn ldapdelete(
        &self,
        dn: &str,
        recursive: bool,
        extra_args: &[&str],
        expected: &[i32],
    ) -> Result<CommandOutput, CommandError> {
        let mut args: Vec<&str> = extra_args.to_vec();
        if recursive {
            args.push("-r");
        }
        args.push(dn);
        self.run_tool(&self.tools().ldapdelete, &args, None, expected)
    }

    /// Runs `ldapsearch` with the given filter, based at `base` or the
    /// instance suffix.
    pub fn ldapsearch(
        &self,
        filter: &str,
        base: Option<&str>,
        extra_args: &[&str],
        expected: &[i32],
    ) -> Result<CommandOutput, CommandError> {
        let base = base.map_or_else(|| self.config().suffix.clone(), str::to_string);
        let mut args: Vec<&str> = vec!["-b", base.as_str()];
        args.extend_from_slice(extra_args);
        args.push(filter);
        self.run_tool(&self.tools().ldapsearch, &args, None, expected)
    }

    /// Runs the offline bulk-import tool against this instance's store.
    pub fn slapadd(
        &self,
        ldif: Option<&str>,
        extra_args: &[&str],
        expected: &[i32],
    ) -> Result<CommandOutput, CommandError> {
        self.run_tool(&self.tools().slapadd, extra_args, ldif, expected)
    }

    /// Runs the offline bulk-export tool against this instance's store.
    pub fn slapcat(
        &self,
        extra_args: &[&str],
        expected: &[i32],
    ) -> Result<CommandOutput, CommandError> {
        self.run_tool(&self.tools().slapcat, extra_args, None, expected)
    }

    /// Adds the top-level entry for the suffix, which the backend needs
    /// before ordinary entries can be added.
    pub fn init_tree(&self) -> Result<CommandOutput, CommandError> {
        let suffix = &self.config().suffix;
        let dc = suffix
            .split(',')
            .next()
            .and_then(|rdn| rdn.split_once('='))
            .map_or("", |(_, value)| value);
        let ldif = format!(
            "dn: {}\ndc: {}\nobjectClass: dcObject\nobjectClass: organization\no: {}\n",
            suffix, dc, dc
        );
        self.ldapadd(&ldif, &[], &[0])
    }

    fn run_tool(
        &self,
        tool: &Path,
        extra_args: &[&str],
        stdin_data: Option<&str>,
        expected: &[i32],
    ) -> Result<CommandOutput, CommandError> {
        let args = tool_args(self.config(), tool, extra_args);
        run(tool, &args, stdin_data, expected)
    }
}

/// Argument vector for a tool: the `ldap*` clients talk to the preferred
/// endpoint with auth arguments, the `slap*` tools operate on the config
/// directory directly.
fn tool_args(config: &ServerConfig, tool: &Path, extra_args: &[&str]) -> Vec<String> {
    let name = tool
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut args: Vec<String> = Vec::new();
    if name.starts_with("ldap") {
        args.push("-H".to_string());
        args.push(config.default_ldap_uri().to_string());
        args.extend(auth_args(config));
    } else {
        args.push("-F".to_string());
        args.push(config.slapd_conf.to_string_lossy().into_owned());
    }
    args.extend(extra_args.iter().map(|s| s.to_string()));
    args
}

/// SASL/EXTERNAL over the local socket when available, else a simple
/// bind with the root credentials.
fn auth_args(config: &ServerConfig) -> Vec<String> {
    if config.sasl_external() {
        let mut args = vec!["-Y".to_string(), "EXTERNAL".to_string()];
        if !tracing::enabled!(tracing::Level::DEBUG) {
            args.push("-Q".to_string());
        }
        args
    } else {
        vec![
            "-x".to_string(),
            "-D".to_string(),
            config.root_dn(),
            "-w".to_string(),
            config.root_pw.clone(),
        ]
    }
}

fn run(
    program: &Path,
    args: &[String],
    stdin_data: Option<&str>,
    expected: &[i32],
) -> Result<CommandOutput, CommandError> {
    let command_line = format!("{} {}", program.display(), args.join(" "));
    debug!("running: {}", command_line);

    let mut command = Command::new(program);
    command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    command.stdin(if stdin_data.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let mut child = command
        .spawn()
        .map_err(|e| CommandError::Spawn(program.display().to_string(), e))?;

    if let Some(data) = stdin_data {
        debug!("stdin: {}", data);
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(data.as_bytes()) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(CommandError::Stdin(e));
            }
        }
    }

    let output = child.wait_with_output().map_err(CommandError::Wait)?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    debug!("stdout: {}", stdout);
    debug!("stderr: {}", stderr);

    let exit_code = output.status.code();
    let accepted = matches!(exit_code, Some(code) if expected.contains(&code));
    if !accepted {
        return Err(CommandError::UnexpectedExit {
            command_line,
            exit_code,
            expected: expected.to_vec(),
            stdout,
            stderr,
        });
    }

    Ok(CommandOutput {
        command_line,
        exit_code,
        stdout,
        stderr,
    })
}

#[derive(Debug)]
pub enum CommandError {
    Spawn(String, std::io::Error),
    Stdin(std::io::Error),
    Wait(std::io::Error),
    UnexpectedExit {
        command_line: String,
        exit_code: Option<i32>,
        expected: Vec<i32>,
        stdout: String,
        stderr: String,
    },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Spawn(program, e) => write!(f, "Failed to run {}: {}", program, e),
            CommandError::Stdin(e) => write!(f, "Failed to write to stdin: {}", e),
            CommandError::Wait(e) => write!(f, "Failed to collect process output: {}", e),
            CommandError::UnexpectedExit {
                command_line,
                exit_code,
                expected,
                ..
            } => write!(
                f,
                "Unexpected exit code (expected {:?}, got {:?}): {}",
                expected, exit_code, command_line
            ),
        }
    }
}

impl std::error::Error for CommandError {}
