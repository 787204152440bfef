use {
    log::error,
    solana_validator_failover::{cli, commands},
    std::process::exit,
};

pub fn main() {
    let matches = cli::app(solana_validator_failover::APP_VERSION).get_matches();

    let log_level = matches.value_of("log_level").unwrap_or("info");
    solana_logger::setup_with_default(log_level);

    let result = match matches.subcommand() {
        ("run", Some(run_matches)) => commands::run::execute(run_matches),
        _ => unreachable!("a subcommand is required by the cli definition"),
    };

    if let Err(err) = result {
        error!("failover failed: {err}");
        exit(1);
    }
}
