//! Analyze a chess position with a real UCI engine from the command line.
//!
//! ```text
//! analyze --engine stockfish --fen "<FEN>" --depth 20 --lines 3
//! ```
//!
//! Prints each accepted record as it arrives, then a final summary. With no
//! depth or movetime the search runs unbounded and is stopped after
//! `--watch` seconds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use kibitz_core::events::EventBus;
use kibitz_core::protocol::UciClient;
use kibitz_core::session::{AnalysisOptions, AnalysisSession};
use kibitz_core::supervisor::{EngineSupervisor, SupervisorConfig};
use kibitz_core::transport::EngineCommand;
use kibitz_core::uci::Score;

#[derive(Parser)]
#[command(name = "analyze", about = "Analyze a chess position with a UCI engine")]
struct Args {
    /// Engine command line, e.g. "stockfish" or "/opt/sf/stockfish --uci"
    #[arg(long, default_value = "stockfish")]
    engine: String,

    /// Position to analyze, as a FEN string
    #[arg(long)]
    fen: String,

    /// Search depth limit
    #[arg(long)]
    depth: Option<u32>,

    /// Search time limit in milliseconds
    #[arg(long)]
    movetime: Option<u64>,

    /// Number of ranked lines to request (MultiPV)
    #[arg(long, default_value_t = 1)]
    lines: u32,

    /// Seconds to watch an unbounded search before stopping it
    #[arg(long, default_value_t = 30)]
    watch: u64,

    /// Directory for engine I/O transcript files
    #[arg(long)]
    log_dir: Option<String>,
}

fn describe(score: &Score) -> String {
    match score {
        Score::Cp(cp) => format!("{:+.2}", f64::from(*cp) / 100.0),
        Score::Mate(moves) => format!("mate {}", moves),
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let command = match EngineCommand::parse(&args.engine) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    };

    let bus = Arc::new(EventBus::new());
    let config = SupervisorConfig {
        log_dir: args.log_dir.clone(),
        ..SupervisorConfig::default()
    };
    let supervisor = Arc::new(EngineSupervisor::start(
        Box::new(command),
        config,
        Arc::clone(&bus),
    ));

    let handshake_deadline = Instant::now() + Duration::from_secs(10);
    while !supervisor.is_ready() {
        if Instant::now() >= handshake_deadline {
            eprintln!("error: engine never answered the UCI handshake");
            supervisor.terminate();
            std::process::exit(1);
        }
        std::thread::sleep(Duration::from_millis(25));
    }

    let client = Arc::new(UciClient::new(Arc::clone(&supervisor)));
    let session = AnalysisSession::new(client, Arc::clone(&bus));
    session.set_on_update(|record| {
        println!(
            "depth {:>2}  line {}  {:>8}  {}",
            record.depth,
            record.multipv.unwrap_or(1),
            describe(&record.score),
            record.pv.join(" ")
        );
    });

    let options = AnalysisOptions {
        depth: args.depth,
        movetime_ms: args.movetime,
        num_lines: args.lines,
    };
    if let Err(err) = session.start(&args.fen, &options) {
        eprintln!("error: {}", err);
        supervisor.terminate();
        std::process::exit(1);
    }

    let watch_deadline = Instant::now() + Duration::from_secs(args.watch);
    while session.is_analyzing() && Instant::now() < watch_deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    session.stop();

    let results = session.current_results();
    println!();
    println!("{} records for {}", results.len(), args.fen);
    let best = results
        .iter()
        .rev()
        .find(|record| record.multipv.unwrap_or(1) == 1);
    if let Some(best) = best {
        println!(
            "best: {} at depth {} ({})",
            best.pv.first().map(String::as_str).unwrap_or("?"),
            best.depth,
            describe(&best.score)
        );
    }

    supervisor.terminate();
}
