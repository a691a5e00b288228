use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use dockmate::attach::AttachOptions;
use dockmate::container_management::{BollardClientFactory, CommitOptions};
use dockmate::progress::{
    count_dockerfile_instructions, BuildConsole, BuildProgressRelay, ProgressMonitor,
    TransferProgressRelay,
};
use dockmate::{Connection, ConnectionRegistry, JsonConnectionStorage, Paths, Settings};
use eyre::{bail, Result, WrapErr};
use log::{info, LevelFilter};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

#[derive(Parser)]
#[command(author, version, about = "Manage Docker daemons, their containers and images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding settings.json and connections.json
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Args)]
struct Target {
    /// Connection name
    connection: String,
    /// Container id or name
    id: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List the registered connections
    Connections,
    /// Register a connection
    Add {
        name: String,
        #[arg(long, conflicts_with = "host", required_unless_present = "host")]
        socket: Option<String>,
        #[arg(long)]
        host: Option<String>,
        /// Directory with key.pem, cert.pem and ca.pem
        #[arg(long, requires = "host")]
        cert_path: Option<PathBuf>,
    },
    Remove {
        name: String,
    },
    Rename {
        name: String,
        new_name: String,
    },
    Ping {
        connection: String,
    },
    Info {
        connection: String,
    },
    Containers {
        connection: String,
    },
    Images {
        connection: String,
        /// Include intermediate layers
        #[arg(long)]
        all: bool,
    },
    Start(Target),
    Stop(Target),
    Kill(Target),
    Pause(Target),
    Unpause(Target),
    Rm(Target),
    /// Stream the output of a container until it ends or Ctrl-C
    Logs(Target),
    /// Wait for a container to exit and print its exit code
    Wait(Target),
    Pull {
        connection: String,
        image: String,
    },
    Push {
        connection: String,
        image: String,
    },
    Tag {
        connection: String,
        image: String,
        repo: String,
        tag: String,
    },
    Rmi {
        connection: String,
        image: String,
        /// Only remove this tag
        #[arg(long)]
        untag: bool,
    },
    /// Build the Dockerfile in DIR
    Build {
        connection: String,
        dir: PathBuf,
        #[arg(long, short)]
        tag: Option<String>,
    },
    Commit {
        #[command(flatten)]
        target: Target,
        repo: String,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        comment: Option<String>,
        #[arg(long)]
        author: Option<String>,
    },
    Search {
        connection: String,
        term: String,
    },
    /// Connect the terminal to a container console
    Attach(Target),
}

/// Percentages on stderr, so stdout only carries console output.
struct StderrProgress;

impl ProgressMonitor for StderrProgress {
    fn begin(&self, task: &str) {
        eprintln!("{}", task);
    }

    fn set_percentage(&self, percent: u8) {
        eprintln!("[{:>3}%]", percent);
    }

    fn cancel(&self) {
        eprintln!("cancelled");
    }

    fn done(&self) {}
}

fn init_logging(paths: &Paths, level: LevelFilter) -> Result<()> {
    std::fs::create_dir_all(&paths.data_dir)
        .wrap_err_with(|| format!("creating {}", paths.data_dir.display()))?;
    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d} {l} {t} - {m}{n}")))
        .build(paths.log_file())?;

    let config = Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .build(Root::builder().appender("logfile").build(level))?;

    log4rs::init_config(config)?;
    Ok(())
}

async fn find(registry: &ConnectionRegistry, name: &str) -> Result<Connection> {
    match registry.find(name).await {
        Some(connection) => Ok(connection),
        None => bail!("no connection named '{}'", name),
    }
}

fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    &id[..id.len().min(12)]
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = Paths::discover(cli.config_dir.clone())?;
    init_logging(&paths, cli.log_level)?;
    let settings = Arc::new(Settings::load(&paths.config_dir)?);

    let storage = Arc::new(JsonConnectionStorage::new(paths.connections_file()));
    let factory = Arc::new(BollardClientFactory::new(settings.request_timeout_secs));
    let registry = ConnectionRegistry::new(storage, factory, settings);
    registry.reload().await?;

    let result = run(&registry, cli.command).await;
    for connection in registry.connections().await {
        connection.close().await;
    }
    result
}

async fn run(registry: &ConnectionRegistry, command: Commands) -> Result<()> {
    match command {
        Commands::Connections => {
            for connection in registry.connections().await {
                let state = if connection.is_open() { "open" } else { "closed" };
                println!("{}\t{}\t{}", connection.name(), connection.uri(), state);
            }
        }
        Commands::Add {
            name,
            socket,
            host,
            cert_path,
        } => {
            let builder = registry.builder(name.as_str());
            let builder = match (socket, host) {
                (Some(socket), _) => builder.unix_socket(&socket),
                (None, Some(host)) => builder.tcp(&host, cert_path),
                (None, None) => bail!("either --socket or --host is required"),
            };
            let connection = builder.build()?;
            registry.add(connection.clone()).await?;
            println!("Added '{}' ({})", name, connection.uri());
        }
        Commands::Remove { name } => {
            let connection = find(registry, &name).await?;
            registry.remove(&connection).await?;
        }
        Commands::Rename { name, new_name } => {
            let connection = find(registry, &name).await?;
            registry.rename(&connection, &new_name).await?;
        }
        Commands::Ping { connection } => {
            find(registry, &connection).await?.ping().await?;
            println!("OK");
        }
        Commands::Info { connection } => {
            let info = find(registry, &connection).await?.info().await?;
            let or_unknown = |v: Option<String>| v.unwrap_or_else(|| "unknown".to_string());
            println!("Server version: {}", or_unknown(info.server_version));
            println!("API version:    {}", or_unknown(info.api_version));
            println!("OS/Arch:        {}/{}", or_unknown(info.os), or_unknown(info.arch));
            println!("Kernel:         {}", or_unknown(info.kernel_version));
            println!("Storage driver: {}", or_unknown(info.driver));
            println!("CPUs:           {}", info.cpus);
            println!("Memory:         {}", info.total_memory);
            println!("Containers:     {}", info.containers);
            println!("Images:         {}", info.images);
        }
        Commands::Containers { connection } => {
            let containers = find(registry, &connection).await?.containers(true).await?;
            for c in containers.iter() {
                println!("{}\t{}\t{}\t{}", short_id(&c.id), c.name, c.image, c.status);
            }
        }
        Commands::Images { connection, all } => {
            let images = find(registry, &connection).await?.images(true).await?;
            for image in images.iter().filter(|i| all || !i.intermediate) {
                let flag = if image.dangling { "\tdangling" } else { "" };
                println!(
                    "{}\t{}\t{}\t{}{}",
                    short_id(&image.id),
                    image.repo,
                    image.tag,
                    image.size,
                    flag
                );
            }
        }
        Commands::Start(t) => find(registry, &t.connection).await?.start_container(&t.id, None).await?,
        Commands::Stop(t) => find(registry, &t.connection).await?.stop_container(&t.id).await?,
        Commands::Kill(t) => find(registry, &t.connection).await?.kill_container(&t.id).await?,
        Commands::Pause(t) => find(registry, &t.connection).await?.pause_container(&t.id).await?,
        Commands::Unpause(t) => {
            find(registry, &t.connection)
                .await?
                .unpause_container(&t.id, None)
                .await?
        }
        Commands::Rm(t) => find(registry, &t.connection).await?.remove_container(&t.id).await?,
        Commands::Logs(t) => logs(&find(registry, &t.connection).await?, &t.id).await?,
        Commands::Wait(t) => {
            let code = find(registry, &t.connection)
                .await?
                .wait_for_container(&t.id)
                .await?;
            println!("{}", code);
        }
        Commands::Pull { connection, image } => {
            let connection = find(registry, &connection).await?;
            let mut relay = TransferProgressRelay::new(image.as_str(), Arc::new(StderrProgress))
                .with_console(BuildConsole::new(tokio::io::stdout()));
            let result = connection.pull_image(&image, &mut relay).await;
            relay.finish().await;
            result?;
        }
        Commands::Push { connection, image } => {
            let connection = find(registry, &connection).await?;
            let mut relay = TransferProgressRelay::new(image.as_str(), Arc::new(StderrProgress))
                .with_console(BuildConsole::new(tokio::io::stdout()));
            let result = connection.push_image(&image, &mut relay).await;
            relay.finish().await;
            result?;
        }
        Commands::Tag {
            connection,
            image,
            repo,
            tag,
        } => {
            find(registry, &connection)
                .await?
                .tag_image(&image, &repo, &tag)
                .await?
        }
        Commands::Rmi {
            connection,
            image,
            untag,
        } => {
            let connection = find(registry, &connection).await?;
            if untag {
                connection.remove_tag(&image).await?;
            } else {
                connection.remove_image(&image).await?;
            }
        }
        Commands::Build {
            connection,
            dir,
            tag,
        } => {
            let connection = find(registry, &connection).await?;
            let dockerfile = dir.join("Dockerfile");
            let lines = count_dockerfile_instructions(&dockerfile)
                .await
                .wrap_err_with(|| format!("reading {}", dockerfile.display()))?;
            let image = tag.clone().unwrap_or_else(|| dir.display().to_string());
            let mut relay = BuildProgressRelay::new(image, lines, Arc::new(StderrProgress))
                .with_connection(connection.clone())
                .with_console(BuildConsole::new(tokio::io::stdout()));
            let result = connection.build_image(&dir, tag.as_deref(), &mut relay).await;
            relay.finish().await;
            if let Some(id) = result? {
                println!("{}", id);
            }
        }
        Commands::Commit {
            target,
            repo,
            tag,
            comment,
            author,
        } => {
            let image = find(registry, &target.connection)
                .await?
                .commit_container(CommitOptions {
                    container: target.id,
                    repo,
                    tag,
                    comment,
                    author,
                })
                .await?;
            println!("{}", image);
        }
        Commands::Search { connection, term } => {
            let results = find(registry, &connection).await?.search_images(&term).await?;
            for r in results {
                let official = if r.official { "[OK]" } else { "" };
                println!("{}\t{}\t{}\t{}", r.name, r.stars, official, r.description);
            }
        }
        Commands::Attach(t) => {
            let connection = find(registry, &t.connection).await?;
            let options = AttachOptions {
                pump_output_without_tty: true,
                ..AttachOptions::from_settings(connection.settings())
            };
            let session = connection
                .attach_with(&t.id, tokio::io::stdin(), tokio::io::stdout(), options)
                .await?;
            let cancel = session.cancellation();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });
            session.join().await;
        }
    }
    Ok(())
}

async fn logs(connection: &Connection, id: &str) -> Result<()> {
    let (sink, mut output) = tokio::io::duplex(64 * 1024);
    if !connection.log_container(id, Box::new(sink)).await? {
        bail!("container {} is already being logged", id);
    }
    info!("Streaming logs of {}", id);

    let mut stdout = tokio::io::stdout();
    let copy = tokio::io::copy(&mut output, &mut stdout);
    tokio::pin!(copy);
    tokio::select! {
        copied = &mut copy => {
            copied?;
        }
        _ = tokio::signal::ctrl_c() => {
            connection.stop_logging(id).await?;
            // drain what the worker wrote before closing the sink
            copy.await?;
        }
    }
    Ok(())
}
