//! Bytecode Backend Demo CLI
//!
//! A small command-line harness that runs the backend end to end against a
//! hand-built sample program and prints the resulting image summary. Useful
//! for smoke-testing a config file or eyeballing `tracing` output; the real
//! entry point for this crate is the library API (`bc_backend::driver::run`).

use std::error::Error;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, EnvFilter};

use bc_backend::config::BackendConfig;
use bc_backend::error::BackendResult;
use bc_backend::image::{RecordingImage, RecordingSourceMap};
use bc_backend::ir::{Expr, Literal, Method, MethodKind, MethodRef, Program, Shape};
use bc_backend::shape::{CallShape, PlainShape};

#[derive(Parser)]
#[command(name = "bc-backend-demo", about = "Runs the bytecode backend against a sample program")]
struct Cli {
    /// Path to a BackendConfig TOML file. Falls back to defaults plus
    /// `BC_BACKEND_*` environment overrides when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v, -vv, -vvv, -vvvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// A single free static method returning the literal `42`, wired up as the
/// program's only entry point — just enough to exercise the driver's full
/// pipeline without a front end.
fn sample_program() -> Program {
    let mut program = Program::default();
    let shape = Shape::Plain(PlainShape::new(CallShape::positional(0)));
    let mut main = Method::new("main", MethodKind::Static, shape);
    main.body = Some(Expr::LiteralNode(Literal::Integer(42)));
    program.methods.push(main);
    program.entry_points.push(("main".to_string(), MethodRef(0)));
    program
}

fn run(cli: &Cli) -> BackendResult<()> {
    let config = match &cli.config {
        Some(path) => BackendConfig::load_from_file(path)?,
        None => BackendConfig::load(),
    };

    let mut program = sample_program();
    let mut image = RecordingImage::default();
    let mut source_map = RecordingSourceMap::default();

    let summary = bc_backend::driver::run(&mut program, &config, &mut image, &mut source_map)?;
    info!(
        classes = summary.classes_registered,
        methods = summary.methods_emitted,
        dispatch_table_len = summary.dispatch_table_len,
        dispatch_table_holes = summary.dispatch_table_holes,
        "backend run finished"
    );
    println!("{summary:#?}");
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(format!("bc_backend={log_level}").parse().unwrap());

    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .init();

    if let Err(e) = run(&cli) {
        error!("backend run failed: {}", e);

        let mut cause = e.source();
        while let Some(err) = cause {
            error!("  caused by: {}", err);
            cause = err.source();
        }

        process::exit(1);
    }
}
