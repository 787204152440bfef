//! The `run` subcommand: perform a failover, automatically deciding which
//! side to drive from the node's current role.

use {
    crate::{
        commands::{FromClapArgMatches, Result},
        config::Config,
        confirm::TerminalConfirmer,
        validator::{FailoverParams, Validator},
    },
    clap::{App, Arg, ArgMatches, SubCommand},
    std::sync::Arc,
};

pub fn command<'a>() -> App<'a, 'a> {
    SubCommand::with_name("run")
        .about(
            "run a failover - automatically detects what to do based on the \
             node's role (active or passive)",
        )
        .arg(
            Arg::with_name("not_a_drill")
                .long("not-a-drill")
                .help("execute failover for real (not a drill)"),
        )
        .arg(
            Arg::with_name("no_wait_for_healthy")
                .long("no-wait-for-healthy")
                .help("don't wait for the node to report healthy via the local rpc endpoint"),
        )
        .arg(
            Arg::with_name("no_min_time_to_leader_slot")
                .long("no-min-time-to-leader-slot")
                .help(
                    "when run on an active node, don't wait until the next leader slot \
                     is at least validator.failover.min_time_to_leader_slot away - \
                     ignored when run on a passive node",
                ),
        )
}

#[derive(Debug, PartialEq)]
pub struct RunArgs {
    pub not_a_drill: bool,
    pub no_wait_for_healthy: bool,
    pub no_min_time_to_leader_slot: bool,
}

impl FromClapArgMatches for RunArgs {
    fn from_clap_arg_match(matches: &ArgMatches) -> Result<Self> {
        Ok(RunArgs {
            not_a_drill: matches.is_present("not_a_drill"),
            no_wait_for_healthy: matches.is_present("no_wait_for_healthy"),
            no_min_time_to_leader_slot: matches.is_present("no_min_time_to_leader_slot"),
        })
    }
}

pub fn execute(matches: &ArgMatches) -> Result<()> {
    let args = RunArgs::from_clap_arg_match(matches)?;
    let config = Config::load(matches.value_of("config"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let validator =
            Validator::from_config(&config.validator, Arc::new(TerminalConfirmer)).await?;
        validator
            .failover(FailoverParams {
                not_a_drill: args.not_a_drill,
                no_wait_for_healthy: args.no_wait_for_healthy,
                no_min_time_to_leader_slot: args.no_min_time_to_leader_slot,
            })
            .await
    })?;

    Ok(())
}
