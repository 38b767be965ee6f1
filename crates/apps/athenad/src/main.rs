use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::task::LocalSet;

use athena_fwd::config::ForwarderConfig;
use athena_fwd::{Athena, LinkVector};

const DEFAULT_LISTENER: &str = "tcp://localhost:9695/listener";

#[derive(Parser, Debug)]
#[command(name = "athenad", about = "Athena content-centric forwarder")]
struct Args {
    /// Link URI to open at startup; repeatable.
    #[arg(long = "listen")]
    listen: Vec<String>,
    /// Route to seed, as <prefix>=<linkName>; repeatable.
    #[arg(long = "route")]
    route: Vec<String>,
    /// Content store capacity in MB; 0 disables caching.
    #[arg(long = "store-mb", default_value_t = 0)]
    store_mb: usize,
    /// TOML configuration file; flags extend what it provides.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match ForwarderConfig::load(path) {
            Ok(config) => config,
            Err(error) => {
                eprintln!("athenad: {}", error);
                return ExitCode::FAILURE;
            }
        },
        None => ForwarderConfig::default(),
    };

    init_logging(&args, &config);

    let local = LocalSet::new();
    match local.run_until(bootstrap_and_run(args, config)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("athenad: {}", error);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Args, config: &ForwarderConfig) {
    let level = match (args.verbose, config.log_level.as_deref()) {
        (0, Some(level)) => level.parse().unwrap_or(log::LevelFilter::Info),
        (0, None) => log::LevelFilter::Info,
        (1, _) => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env().filter_level(level).init();
}

async fn bootstrap_and_run(args: Args, config: ForwarderConfig) -> Result<(), String> {
    let mut athena = Athena::new(if args.store_mb > 0 {
        args.store_mb
    } else {
        config.content_store_mb
    });

    let mut links: Vec<String> = config.links;
    links.extend(args.listen);
    if links.is_empty() {
        links.push(DEFAULT_LISTENER.to_string());
    }
    for uri in &links {
        athena
            .transport()
            .open(uri)
            .await
            .map_err(|error| format!("couldn't open {}: {}", uri, error))?;
    }

    let mut routes: Vec<(String, String)> = config
        .routes
        .into_iter()
        .map(|route| (route.prefix, route.link))
        .collect();
    for route in &args.route {
        let (prefix, link) = route
            .split_once('=')
            .ok_or_else(|| format!("bad route, expected <prefix>=<linkName>: {}", route))?;
        routes.push((prefix.to_string(), link.to_string()));
    }
    for (prefix, link) in routes {
        seed_route(&mut athena, &prefix, &link)?;
    }

    athena.run().await;
    Ok(())
}

fn seed_route(athena: &mut Athena, prefix: &str, link: &str) -> Result<(), String> {
    let name = ccnx_codec::Name::from_uri(prefix)
        .map_err(|_| format!("bad route prefix: {}", prefix))?;
    let id = athena
        .transport()
        .link_name_to_id(link)
        .ok_or_else(|| format!("route names unknown link: {}", link))?;
    athena.fib().borrow_mut().add_route(name, &LinkVector::single(id));
    log::info!("athenad: route {} -> {}", prefix, link);
    Ok(())
}
