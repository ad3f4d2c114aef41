use clap::Parser;
use lector_trainer::{TrainArgs, run_training};

fn main() {
    tracing_subscriber::fmt::init();

    let args = TrainArgs::parse();
    if let Err(e) = run_training(args.into()) {
        eprintln!("Training failed: {:#}", e);
        std::process::exit(1);
    }
}
