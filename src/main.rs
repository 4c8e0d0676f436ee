//! slapdtest - disposable slapd server CLI

use clap::{Parser, Subcommand};
use slapdtest::{ServerInfo, ServerOptions, SlapdServer, ToolPaths};

#[derive(Parser)]
#[command(name = "slapdtest")]
#[command(about = "Run disposable slapd (OpenLDAP) servers for integration tests")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a server and block until it exits
    Run {
        /// TCP port to listen on (default: a random free port)
        #[arg(long)]
        port: Option<u16>,

        /// Suffix DN for the instance
        #[arg(long)]
        suffix: Option<String>,

        /// Backend database type
        #[arg(long)]
        database: Option<String>,

        /// Output connection info as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show resolved tool paths (for debugging)
    Paths,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Commands::Paths => match ToolPaths::resolve() {
            Ok(tools) => print_paths(&tools),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Run {
            port,
            suffix,
            database,
            json,
        } => {
            let mut options = ServerOptions {
                port,
                ..Default::default()
            };
            if let Some(suffix) = suffix {
                options.suffix = suffix;
            }
            if let Some(database) = database {
                options.database = database;
            }

            let mut server = match SlapdServer::new(options) {
                Ok(server) => server,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = server.start() {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }

            let info = server.info();
            if json {
                println!("{}", serde_json::to_string_pretty(&info).unwrap());
            } else {
                print_run_output(&info);
            }

            // Blocks until the child exits; Ctrl-C reaches the whole
            // process group, so slapd goes down with us.
            if let Err(e) = server.wait() {
                eprintln!("Error: {}", e);
            }
            if let Err(e) = server.stop() {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_run_output(info: &ServerInfo) {
    const INDENT: &str = "        ";

    println!("slapd listening on {}", info.ldap_uri);
    if let Some(uri) = &info.ldapi_uri {
        println!("{}Socket:   {}", INDENT, uri);
    }
    println!("{}Suffix:   {}", INDENT, info.suffix);
    println!("{}Root DN:  {}", INDENT, info.root_dn);
    println!("{}Password: {}", INDENT, info.root_pw);
    println!("{}Data dir: {}", INDENT, info.testrundir);
}

fn print_paths(tools: &ToolPaths) {
    println!("slapd:      {}", tools.slapd.display());
    println!("slapadd:    {}", tools.slapadd.display());
    println!("slapcat:    {}", tools.slapcat.display());
    println!("ldapadd:    {}", tools.ldapadd.display());
    println!("ldapmodify: {}", tools.ldapmodify.display());
    println!("ldapdelete: {}", tools.ldapdelete.display());
    println!("ldapsearch: {}", tools.ldapsearch.display());
    println!("ldapwhoami: {}", tools.ldapwhoami.display());
    println!("schema dir: {}", tools.schema_dir.display());
}
