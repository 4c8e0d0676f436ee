//! Server configuration: defaulted options, the resolved immutable
//! parameters of one instance, and generation of its config document.

use std::net::TcpListener;
use std::path::PathBuf;

use tracing::info;

/// User-supplied options for a server instance. All fields have defaults.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host the server listens on.
    pub host: String,

    /// TCP port. `None` picks a random free port.
    pub port: Option<u16>,

    /// Schema documents to import at startup. Entries that are existing
    /// paths are used verbatim, anything else is looked up in the schema
    /// directory.
    pub schemas: Vec<String>,

    /// Backend database type.
    pub database: String,

    /// Suffix DN under which all entries live.
    pub suffix: String,

    /// Common name of the root user.
    pub root_cn: String,

    /// Password of the root user.
    pub root_pw: String,

    /// Prefix of the working directory name.
    pub datadir_prefix: String,

    /// Whether to launch slapd with full debug verbosity. `None` follows
    /// the crate's own log level.
    pub debug: Option<bool>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            schemas: vec!["core.ldif".to_string()],
            database: "mdb".to_string(),
            suffix: "dc=slapd-test,dc=example,dc=org".to_string(),
            root_cn: "Manager".to_string(),
            root_pw: "password".to_string(),
            datadir_prefix: "slapd-test".to_string(),
            debug: None,
        }
    }
}

/// Resolved parameters of one server instance.
///
/// Captured once at construction; the working directory path is derived
/// from the prefix and port and never changes afterwards.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub server_id: u16,
    pub schemas: Vec<String>,
    pub database: String,
    pub suffix: String,
    pub root_cn: String,
    pub root_pw: String,
    pub debug: Option<bool>,

    /// Root of the working tree: `<tmp>/<prefix>-<port>`.
    pub testrundir: PathBuf,
    /// Config backend directory (`slapd.d`).
    pub slapd_conf: PathBuf,
    /// Data backend directory (`openldap-data`).
    pub db_directory: PathBuf,

    pub ldap_uri: String,
    /// Unix-domain-socket URI, where the platform supports it.
    pub ldapi_uri: Option<String>,
    pub ldapi_socket: Option<PathBuf>,

    pub cafile: PathBuf,
    pub servercert: PathBuf,
    pub serverkey: PathBuf,
    pub clientcert: PathBuf,
    pub clientkey: PathBuf,
}

impl ServerConfig {
    /// Resolve options into a concrete configuration, picking a free port
    /// when none was given.
    pub fn resolve(options: ServerOptions) -> Result<Self, ConfigError> {
        let ServerOptions {
            host,
            port,
            schemas,
            database,
            suffix,
            root_cn,
            root_pw,
            datadir_prefix,
            debug,
        } = options;

        let port = match port {
            Some(p) => p,
            None => find_available_port(&host)?,
        };
        let server_id = port % 4096;

        let testrundir = tmp_root().join(format!("{}-{}", datadir_prefix, port));
        let slapd_conf = testrundir.join("slapd.d");
        let db_directory = testrundir.join("openldap-data");

        let ldap_uri = format!("ldap://{}:{}/", host, port);
        let (ldapi_uri, ldapi_socket) = ldapi_endpoint(&testrundir);

        let certs = cert_dir();

        Ok(Self {
            host,
            port,
            server_id,
            schemas,
            database,
            suffix,
            root_cn,
            root_pw,
            debug,
            testrundir,
            slapd_conf,
            db_directory,
            ldap_uri,
            ldapi_uri,
            ldapi_socket,
            cafile: certs.join("ca.pem"),
            servercert: certs.join("server.pem"),
            serverkey: certs.join("server.key"),
            clientcert: certs.join("client.pem"),
            clientkey: certs.join("client.key"),
        })
    }

    /// Distinguished name of the root user.
    pub fn root_dn(&self) -> String {
        format!("cn={},{}", self.root_cn, self.suffix)
    }

    /// URI preferred for command-line tools: the local socket when
    /// available, the network listener otherwise.
    pub fn default_ldap_uri(&self) -> &str {
        self.ldapi_uri.as_deref().unwrap_or(&self.ldap_uri)
    }

    /// Whether the CLI tools authenticate via SASL/EXTERNAL over the
    /// local socket rather than a simple bind.
    pub fn sasl_external(&self) -> bool {
        self.ldapi_uri.is_some()
    }

    /// Render the initial configuration document consumed by the bulk
    /// import tool.
    pub fn generate(&self) -> String {
        let mut doc = String::new();
        doc.push_str("dn: cn=config\n");
        doc.push_str("objectClass: olcGlobal\n");
        doc.push_str("cn: config\n");
        doc.push_str(&format!("olcServerID: {:#x}\n", self.server_id));
        doc.push_str("olcLogLevel: stats stats2\n");
        doc.push_str("olcAllows: bind_v2\n");
        #[cfg(unix)]
        doc.push_str(&format!(
            "olcAuthzRegexp: {{0}}\"gidnumber={}\\+uidnumber={},cn=peercred,cn=external,cn=auth\" \"{}\"\n",
            nix::unistd::getgid(),
            nix::unistd::getuid(),
            self.root_dn()
        ));
        doc.push_str(
            "olcAuthzRegexp: {1}\"C=US, O=slapdtest, OU=clients, CN=([A-Za-z]+)\" \"ldap://ou=people,dc=local???($1)\"\n",
        );
        doc.push_str(&format!("olcTLSCACertificateFile: {}\n", self.cafile.display()));
        doc.push_str(&format!("olcTLSCertificateFile: {}\n", self.servercert.display()));
        doc.push_str(&format!("olcTLSCertificateKeyFile: {}\n", self.serverkey.display()));
        doc.push_str("olcTLSVerifyClient: try\n");
        doc.push('\n');
        doc.push_str("dn: cn=module,cn=config\n");
        doc.push_str("objectClass: olcModuleList\n");
        doc.push_str("cn: module\n");
        doc.push_str(&format!("olcModuleLoad: back_{}\n", self.database));
        doc.push('\n');
        doc.push_str(&format!("dn: olcDatabase={},cn=config\n", self.database));
        doc.push_str("objectClass: olcDatabaseConfig\n");
        doc.push_str("objectClass: olcMdbConfig\n");
        doc.push_str(&format!("olcDatabase: {}\n", self.database));
        doc.push_str(&format!("olcSuffix: {}\n", self.suffix));
        doc.push_str(&format!("olcRootDN: {}\n", self.root_dn()));
        doc.push_str(&format!("olcRootPW: {}\n", self.root_pw));
        doc.push_str(&format!("olcDbDirectory: {}\n", self.db_directory.display()));
        doc
    }
}

/// Bind a throwaway socket to an ephemeral port, read back the assigned
/// number, and release it before the server binds it. Another process can
/// claim the port in between; this race is a known, accepted limitation.
fn find_available_port(host: &str) -> Result<u16, ConfigError> {
    let listener = TcpListener::bind((host, 0)).map_err(ConfigError::PortSelect)?;
    let port = listener
        .local_addr()
        .map_err(ConfigError::PortSelect)?
        .port();
    info!("found available port {}", port);
    Ok(port)
}

/// Working-tree parent: `TMP` override, otherwise the system temp dir.
fn tmp_root() -> PathBuf {
    match std::env::var("TMP") {
        Ok(val) if !val.trim().is_empty() => {
            PathBuf::from(shellexpand::tilde(val.trim()).as_ref())
        }
        _ => std::env::temp_dir(),
    }
}

/// TLS fixture bundle shipped alongside the crate.
fn cert_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("certs")
}

#[cfg(unix)]
fn ldapi_endpoint(testrundir: &std::path::Path) -> (Option<String>, Option<PathBuf>) {
    let socket = testrundir.join("ldapi");
    let encoded: String =
        url::form_urlencoded::byte_serialize(socket.to_string_lossy().as_bytes()).collect();
    (Some(format!("ldapi://{}", encoded)), Some(socket))
}

#[cfg(not(unix))]
fn ldapi_endpoint(_testrundir: &std::path::Path) -> (Option<String>, Option<PathBuf>) {
    (None, None)
}

#[derive(Debug)]
pub enum ConfigError {
    CommandNotFound(String, &'static str),
    NoSchemaDir,
    PortSelect(std::io::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::CommandNotFound(command, var) => write!(
                f,
                "Command '{}' not found. Set the {} environment variable to override the search path",
                command, var
            ),
            ConfigError::NoSchemaDir => write!(
                f,
                "No schema directory found. Set the SCHEMA environment variable"
            ),
            ConfigError::PortSelect(e) => write!(f, "Failed to select a free port: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
