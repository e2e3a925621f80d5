// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::io::stdout;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use serde::Serialize;
use slog::{info, warn};
use structopt::StructOpt;
use strum::IntoEnumIterator;
use tabwriter::TabWriter;

use common::link::Rate;
use common::logging::LogFormat;
use softphy::config::PhyConfig;
use softphy::controller::PhyStateKind;
use softphy::elastic::ElasticStats;
use softphy::fault::FaultCounter;
use softphy::sim::chaos::Chaos;
use softphy::sim::harness::Harness;
use softphy::sim::PartnerConfig;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "physim",
    about = "runs the PIPE PHY against a simulated link partner"
)]
struct Opts {
    #[structopt(long, help = "PHY configuration file (TOML)")]
    config: Option<PathBuf>,

    #[structopt(long, help = "write log records to this file")]
    log_file: Option<String>,

    #[structopt(
        long,
        default_value = "human",
        help = "log format: human or json"
    )]
    log_format: LogFormat,

    #[structopt(subcommand)]
    cmd: Commands,
}

#[derive(Debug, StructOpt)]
enum Commands {
    /// Print the effective configuration.
    Config {
        /// Print the JSON schema of the configuration instead
        #[structopt(long)]
        schema: bool,
    },
    /// Train a link and run it for a while.
    Run(RunOpts),
}

#[derive(Debug, StructOpt)]
struct RunOpts {
    /// Core cycles to simulate
    #[structopt(long, default_value = "1000000")]
    cycles: u64,

    /// How much faster the recovered clock runs, in parts per million
    #[structopt(long, default_value = "0", allow_hyphen_values = true)]
    ppm: f64,

    /// Rate to switch to once the link is up
    #[structopt(long, parse(try_from_str = parse_rate))]
    rate: Option<Rate>,

    /// Probability of a bit error in each received word
    #[structopt(long, default_value = "0")]
    chaos: f64,

    /// Seed for the bit error generator
    #[structopt(long, default_value = "1")]
    seed: u64,

    /// Report as JSON rather than a table
    #[structopt(long)]
    json: bool,
}

fn parse_rate(s: &str) -> anyhow::Result<Rate> {
    Rate::iter()
        .find(|r| r.to_string().eq_ignore_ascii_case(s))
        .ok_or_else(|| anyhow::anyhow!("invalid rate: {s}"))
}

fn load_config(path: &Option<PathBuf>) -> anyhow::Result<PhyConfig> {
    let Some(path) = path else {
        return Ok(PhyConfig::default());
    };
    let input = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    PhyConfig::from_toml(&input)
        .with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Serialize)]
struct Report {
    state: String,
    core_cycles: u64,
    rx_cycles: u64,
    buffer: ElasticStats,
    faults: Vec<FaultCounter>,
    decode_errors: u64,
    locks_acquired: u64,
    locks_lost: u64,
    states_entered: BTreeMap<&'static str, u32>,
}

fn run(
    log: &slog::Logger,
    cfg: PhyConfig,
    opts: &RunOpts,
) -> anyhow::Result<Report> {
    let mut partner = PartnerConfig::new(cfg.pipe_version);
    partner.chaos = Chaos::new(opts.chaos)?;
    partner.seed = opts.seed;

    let mut h = Harness::new(log, cfg, partner)?;
    h.set_ppm(opts.ppm);

    let up = h.run_until(opts.cycles, |phy, _| phy.is_ready())?;
    match up {
        true => info!(log, "link up"; "cycles" => h.core_cycles()),
        false => warn!(log, "link did not come up"),
    }
    if let (true, Some(rate)) = (up, opts.rate) {
        info!(log, "changing rate"; "rate" => %rate);
        h.cmd.rate = rate.to_pipe();
    }
    let left = opts.cycles.saturating_sub(h.core_cycles());
    h.run(left)?;

    let phy = &h.phy;
    let (locks_acquired, locks_lost) = phy.lock_counts();
    let fsm = phy.fsm_stats();
    Ok(Report {
        state: phy.state().to_string(),
        core_cycles: h.core_cycles(),
        rx_cycles: h.rx_cycles(),
        buffer: phy.buffer_stats(),
        faults: phy.fault_counters(),
        decode_errors: phy.decode_error_counts().1,
        locks_acquired,
        locks_lost,
        states_entered: fsm
            .states()
            .into_iter()
            .map(|s: PhyStateKind| (s.into(), fsm.get(s)))
            .collect(),
    })
}

fn print_report(r: &Report) -> anyhow::Result<()> {
    let mut tw = TabWriter::new(stdout());
    writeln!(tw, "state\t{}", r.state)?;
    writeln!(tw, "core cycles\t{}", r.core_cycles)?;
    writeln!(tw, "rx cycles\t{}", r.rx_cycles)?;
    writeln!(
        tw,
        "locks\t{} acquired, {} lost",
        r.locks_acquired, r.locks_lost
    )?;
    writeln!(tw, "decode errors\t{}", r.decode_errors)?;
    let b = &r.buffer;
    writeln!(tw, "symbols\t{} written, {} read", b.written, b.read)?;
    writeln!(
        tw,
        "fillers\t{} inserted, {} removed",
        b.inserted, b.removed
    )?;
    writeln!(
        tw,
        "buffer faults\t{} overflows, {} underflows",
        b.overflows, b.underflows
    )?;
    for (state, count) in &r.states_entered {
        writeln!(tw, "entered {state}\t{count}")?;
    }
    for f in &r.faults {
        writeln!(tw, "fault {}\t{} ({} total)", f.fault, f.current, f.total)?;
    }
    tw.flush()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::from_args();
    let cfg = load_config(&opts.config)?;

    match opts.cmd {
        Commands::Config { schema: true } => {
            let schema = schemars::schema_for!(PhyConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
        Commands::Config { schema: false } => {
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
        Commands::Run(run_opts) => {
            let log = common::logging::init(
                "physim",
                &opts.log_file,
                opts.log_format,
            )?;
            let report = run(&log, cfg, &run_opts)?;
            match run_opts.json {
                true => {
                    println!("{}", serde_json::to_string_pretty(&report)?)
                }
                false => print_report(&report)?,
            }
        }
    }
    Ok(())
}
