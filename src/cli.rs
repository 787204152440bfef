//! Command-line interface definition.

use {
    crate::commands,
    clap::{App, AppSettings, Arg},
};

pub fn app<'a>(version: &'a str) -> App<'a, 'a> {
    App::new("solana-validator-failover")
        .about("p2p solana validator failover")
        .version(version)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("PATH")
                .takes_value(true)
                .global(true)
                .help(
                    "Path to config file \
                     [default: ~/solana-validator-failover/solana-validator-failover.yaml]",
                ),
        )
        .arg(
            Arg::with_name("log_level")
                .short("l")
                .long("log-level")
                .takes_value(true)
                .possible_values(&["debug", "info", "warn", "error"])
                .default_value("info")
                .global(true)
                .help("Log level"),
        )
        .subcommand(commands::run::command())
}
