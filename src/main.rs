use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use falconx::{discover, tui::Status, Conf, Module, PslError};
use log::{info, LevelFilter};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode, WriteLogger};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use time::macros::format_description;

#[derive(Parser)]
#[command(name = "falconx")]
#[command(about = "Control and read out FalconX pulse processors", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, default_value = "falconx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Broadcast a discovery probe and list the cards that answer
    Discover {
        #[arg(long, default_value = "2000")]
        timeout_ms: u64,
    },
    /// Print the card description and channel states
    Info {
        #[arg(long)]
        module: Option<String>,
    },
    /// Read an acquisition value or run data
    Get {
        #[arg(long)]
        module: Option<String>,
        channel: usize,
        name: String,
    },
    /// Write an acquisition value
    Set {
        #[arg(long)]
        module: Option<String>,
        channel: usize,
        name: String,
        value: f64,
        /// Also store the card configuration
        #[arg(long)]
        save: bool,
    },
    /// Run a detector characterization and save it to the firmware file
    Characterize {
        #[arg(long)]
        module: Option<String>,
        channel: usize,
    },
    /// Start all modules and monitor the run
    Run,
}

fn log_config() -> simplelog::Config {
    ConfigBuilder::new()
        .set_time_format_custom(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .build()
}

fn init_term_logger(level: LevelFilter) -> Result<()> {
    TermLogger::init(level, log_config(), TerminalMode::Mixed, ColorChoice::Auto)?;
    Ok(())
}

fn init_file_logger(level: LevelFilter, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    WriteLogger::init(level, log_config(), file)?;
    Ok(())
}

fn load(path: &Path, to_file: bool) -> Result<Conf> {
    let conf = Conf::load(path).with_context(|| format!("loading {}", path.display()))?;
    let level: LevelFilter = conf.logging.level.parse().unwrap_or(LevelFilter::Info);
    if to_file {
        init_file_logger(level, Path::new(&conf.logging.file))?;
    } else {
        init_term_logger(level)?;
    }
    Ok(conf)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Discover { timeout_ms } => {
            init_term_logger(LevelFilter::Info)?;
            discover_cards(Duration::from_millis(timeout_ms))
        }
        Commands::Run => {
            // the terminal belongs to the monitor, so logs go to a file
            let conf = load(&cli.config, true)?;
            run(&conf)
        }
        Commands::Info { module } => {
            let conf = load(&cli.config, false)?;
            let module = open_module(&conf, module.as_deref())?;
            print_info(&module)
        }
        Commands::Get {
            module,
            channel,
            name,
        } => {
            let conf = load(&cli.config, false)?;
            let module = open_module(&conf, module.as_deref())?;
            get_value(&module, channel, &name)
        }
        Commands::Set {
            module,
            channel,
            name,
            value,
            save,
        } => {
            let conf = load(&cli.config, false)?;
            let module = open_module(&conf, module.as_deref())?;
            module.set_acquisition_value(channel, &name, value)?;
            println!("{} = {}", name, module.get_acquisition_value(channel, &name)?);
            if save {
                module.save_configuration()?;
            }
            Ok(())
        }
        Commands::Characterize { module, channel } => {
            let conf = load(&cli.config, false)?;
            let module = open_module(&conf, module.as_deref())?;
            characterize(&module, channel)
        }
    }
}

fn discover_cards(timeout: Duration) -> Result<()> {
    let cards = discover(timeout)?;
    if cards.is_empty() {
        println!("No cards answered.");
    }
    for card in cards {
        let address = card
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "?".into());
        println!(
            "{:<16} {:<12} serial {:<12} channels {:<2} firmware {} ({})",
            address,
            card.product_name,
            card.serial_number,
            card.num_channels.unwrap_or(0),
            card.firmware_version,
            card.host_name
        );
    }
    Ok(())
}

/// Opens a configured module and applies its detector values.
fn open_module(conf: &Conf, alias: Option<&str>) -> Result<Module> {
    let module_conf = match alias {
        Some(alias) => conf.module(alias)?,
        None => conf.modules.first().context("no modules configured")?,
    };
    let options = conf.module_options(module_conf)?;
    let module = Module::open(&module_conf.host, module_conf.port, options)
        .with_context(|| format!("opening {}", module_conf.alias))?;
    for (channel, name, value) in conf.values_for(&module_conf.alias) {
        module
            .set_acquisition_value(channel, &name, value)
            .with_context(|| format!("setting {} on channel {}", name, channel))?;
    }
    Ok(module)
}

fn print_info(module: &Module) -> Result<()> {
    let info = module.card_info();
    for kv in &info.params {
        println!("{:<32} {:?}", kv.key, kv.value);
    }
    for channel in 0..module.num_channels() {
        let (state, features) = module.with_channel(channel, |c| (c.state, c.features))?;
        println!("channel {}: {} {:?}", channel, state, features);
    }
    Ok(())
}

fn get_value(module: &Module, channel: usize, name: &str) -> Result<()> {
    match module.get_acquisition_value(channel, name) {
        Ok(value) => println!("{} = {}", name, value),
        Err(PslError::UnknownValue) => {
            let data = module
                .get_run_data(channel, name, None)
                .or_else(|_| module.special_run_data(channel, name))
                .or_else(|_| module.board_operation(name, None))?;
            println!("{} = {:?}", name, data);
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

fn characterize(module: &Module, channel: usize) -> Result<()> {
    module.start_characterization(channel)?;
    let deadline = Instant::now() + module.options().characterization_timeout;
    loop {
        let status = module.poll_characterization(channel)?;
        println!("{:5.1}% {}", status.progress, status.stage);
        if !status.running {
            if !status.successful {
                bail!("characterization of channel {} failed", channel);
            }
            break;
        }
        if Instant::now() >= deadline {
            module.cancel_characterization(channel)?;
            bail!("characterization of channel {} timed out", channel);
        }
        thread::sleep(Duration::from_millis(500));
    }
    // results are fetched and saved by the poll that sees completion
    let status = module.poll_characterization(channel)?;
    info!("channel {}: characterization done ({}%)", channel, status.progress);
    println!("Characterization saved.");
    Ok(())
}

fn run(conf: &Conf) -> Result<()> {
    let mut modules = Vec::with_capacity(conf.modules.len());
    for module in &conf.modules {
        modules.push(Arc::new(open_module(conf, Some(&module.alias))?));
    }
    if modules.is_empty() {
        bail!("no modules configured");
    }
    let mut status = Status::new(modules, conf);
    let mut terminal = ratatui::init();
    let result = status.run(&mut terminal);
    ratatui::restore();
    let exit = result?;
    println!("Run finished ({:?}), {} buffers read.", exit, status.buffers);
    Ok(())
}
