// Copyright 2025 Cornell University
// released under MIT License

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{ColorChoice, Parser};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use fsm2jani::compose::compose;
use fsm2jani::config::{Config, Duration};
use fsm2jani::diagnostic::{DiagnosticHandler, Level};
use fsm2jani::explore::Explorer;
use fsm2jani::input::parse_project;
use fsm2jani::serialize::{serialize, write_jani};

// $ cargo run -- model.json -o model.jani --max-time 10s

/// Composes communicating state machines into a single JANI network
#[derive(Parser, Debug)]
#[command(version, about, long_about = None, disable_version_flag = true)]
struct Cli {
    /// Path to the model (.json) file
    #[arg(value_name = "MODEL_FILE")]
    input: PathBuf,

    /// Where to write the network, defaults to stdout
    #[arg(short, long, value_name = "OUTPUT_FILE")]
    output: Option<PathBuf>,

    /// Path to a JSON file with compilation options
    #[arg(long, value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Time after which the clock stops, e.g. `10s` or `500ms`
    #[arg(long, value_name = "DURATION")]
    max_time: Option<Duration>,

    /// Bound of arrays declared without one
    #[arg(long, value_name = "N")]
    max_array_size: Option<u32>,

    /// Behavior tree tick frequency
    #[arg(long, value_name = "HZ")]
    bt_tick_rate: Option<f64>,

    /// Keep ticking the behavior tree after it returned SUCCESS or FAILURE
    #[arg(long)]
    bt_tick_if_not_running: bool,

    /// Emit the human readable listing instead of JANI
    #[arg(long)]
    text: bool,

    /// Explore at most this many states of the composed network
    #[arg(long, value_name = "STATES")]
    explore: Option<usize>,

    /// To suppress colors in error messages, pass in `--color never`
    #[arg(long, value_name = "COLOR_CHOICE", default_value = "auto")]
    color: ColorChoice,

    /// Users can specify `-v` or `--verbose` to toggle logging
    #[command(flatten)]
    verbosity: Verbosity<WarnLevel>,
}

impl Cli {
    /// Options from the config file, overridden by the command line
    fn config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                Config::from_json(&text)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => Config::default(),
        };
        if let Some(max_time) = self.max_time {
            config.max_time = max_time;
        }
        if let Some(size) = self.max_array_size {
            config.max_array_size = size;
        }
        if let Some(rate) = self.bt_tick_rate {
            config.bt_tick_rate = rate;
        }
        config.bt_tick_if_not_running |= self.bt_tick_if_not_running;
        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // For concision, we disable timestamps in the log
    let mut logger = env_logger::Builder::new();
    logger
        .format_timestamp(None)
        .filter_level(cli.verbosity.log_level_filter());
    if cli.color == ColorChoice::Never {
        logger.write_style(env_logger::WriteStyle::Never);
    }
    logger.init();

    let config = cli.config()?;
    log::debug!("{:?}", config);

    let mut handler = DiagnosticHandler::new(cli.color);
    let text = fs::read_to_string(&cli.input)
        .with_context(|| format!("failed to read model file {}", cli.input.display()))?;
    let file = handler.add_file(cli.input.display().to_string(), text.clone());

    let doc = match parse_project(&text) {
        Ok(doc) => doc,
        Err(e) => {
            handler.emit_json_error(file, &e);
            anyhow::bail!("could not read {}", cli.input.display());
        }
    };
    let compiled = match doc.lower(&config).and_then(|p| compose(&p, &config)) {
        Ok(compiled) => compiled,
        Err(e) => {
            handler.emit_compile_error(Some(file), &e);
            anyhow::bail!("could not compile {}", cli.input.display());
        }
    };

    if let Some(limit) = cli.explore {
        let report = Explorer::new(&compiled.network).explore(limit);
        eprintln!(
            "explored {} states, {} transitions, {} deadlocks",
            report.states, report.transitions, report.deadlocks
        );
        if !report.complete {
            handler.emit(&format!("stopped after {} states", limit), Level::Warning);
        }
        for error in &report.errors {
            handler.emit(error, Level::Warning);
        }
    }

    let mut out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(
            fs::File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };
    if cli.text {
        serialize(&mut out, &compiled.network)?;
    } else {
        write_jani(&mut out, &compiled)?;
    }
    out.flush()?;
    Ok(())
}
