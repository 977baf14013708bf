mod cli;

use framescope::{config, inspect};

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config errors surface from the commands that need the config.
    let loaded = config::load_config_or_default(cli.config.as_deref());

    // Initialize logging
    // RUST_LOG wins, then the config file, then defaults based on the verbose flag
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| {
            loaded
                .as_ref()
                .ok()
                .and_then(|c| c.logging.filter.clone())
                .filter(|f| !f.trim().is_empty())
        })
        .unwrap_or_else(|| {
            if cli.verbose {
                "framescope=debug,framescope_media=debug".to_string()
            } else {
                "framescope=info,framescope_media=info".to_string()
            }
        });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Probe { file, json, frames } => {
            let config = loaded?;
            let json = json || config.output.json;
            let frames = frames || config.output.frames;
            probe_file(&file, &config, json, frames)
        }
        Commands::Boxes { file } => {
            let config = loaded?;
            print_boxes(&file, &config)
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("framescope {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn probe_file(
    file: &std::path::Path,
    config: &config::Config,
    json: bool,
    frames: bool,
) -> Result<()> {
    let report = inspect::probe_file(file, &config.demux, frames)?;

    if json {
        let json_str = serde_json::to_string_pretty(&report)?;
        println!("{}", json_str);
    } else {
        print!("{}", report);
    }

    Ok(())
}

fn print_boxes(file: &std::path::Path, config: &config::Config) -> Result<()> {
    let boxes = inspect::box_tree(file, &config.demux)?;
    print!("{}", inspect::BoxTree(&boxes));
    Ok(())
}

fn validate_config(path: Option<&std::path::Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            config::Config::default()
        }
    };

    println!("  Chunk size: {} bytes", config.demux.chunk_size);
    println!("  Max box size: {} bytes", config.demux.max_box_size);
    println!("  JSON output: {}", config.output.json);
    println!("  Frame listing: {}", config.output.frames);
    if let Some(filter) = &config.logging.filter {
        println!("  Log filter: {}", filter);
    }

    Ok(())
}
