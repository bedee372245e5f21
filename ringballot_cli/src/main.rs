use clap::{App, AppSettings, Arg, SubCommand};

mod command_keygen;
mod command_simulate;
mod command_verify_chain;
mod config;

use command_keygen::command_keygen;
use command_simulate::command_simulate;
use command_verify_chain::command_verify_chain;

fn main() {
    let matches = App::new("RingBallot CLI")
        .version("0.1")
        .author("Patrick Hayes <patrick.d.hayes@gmail.com>")
        .about("Runs and verifies anonymous, homomorphically tallied elections")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            SubCommand::with_name("keygen")
                .about("Generate a block-signing key pair for an authority node")
                .arg(
                    Arg::with_name("json")
                        .long("json")
                        .help("Print the keys as JSON"),
                ),
        )
        .subcommand(
            SubCommand::with_name("simulate")
                .about("Run a complete election in-process and print the decrypted tally")
                .arg(
                    Arg::with_name("voters")
                        .long("voters")
                        .takes_value(true)
                        .default_value("8")
                        .help("Number of registered voters, each of whom casts one ballot"),
                )
                .arg(
                    Arg::with_name("candidates")
                        .long("candidates")
                        .takes_value(true)
                        .default_value("3")
                        .help("Number of candidates"),
                )
                .arg(
                    Arg::with_name("threshold")
                        .long("threshold")
                        .takes_value(true)
                        .default_value("2")
                        .help("Partial decryptions needed to decrypt the tally"),
                )
                .arg(
                    Arg::with_name("parties")
                        .long("parties")
                        .takes_value(true)
                        .default_value("3")
                        .help("Number of tally authorities holding key shares"),
                )
                .arg(
                    Arg::with_name("min-batch-size")
                        .long("min-batch-size")
                        .takes_value(true)
                        .help("Mixnet batch size - can also be set with RINGBALLOT_MIN_BATCH_SIZE"),
                )
                .arg(
                    Arg::with_name("max-wait-ms")
                        .long("max-wait-ms")
                        .takes_value(true)
                        .help("Mixnet forced-release timeout - can also be set with RINGBALLOT_MAX_WAIT_MS"),
                )
                .arg(
                    Arg::with_name("drain-interval-ms")
                        .long("drain-interval-ms")
                        .takes_value(true)
                        .help("Authority drain period - can also be set with RINGBALLOT_DRAIN_INTERVAL_MS"),
                )
                .arg(
                    Arg::with_name("paillier-bits")
                        .long("paillier-bits")
                        .takes_value(true)
                        .help("Paillier modulus size - can also be set with RINGBALLOT_PAILLIER_BITS"),
                )
                .arg(
                    Arg::with_name("insecure-test-mode")
                        .long("insecure-test-mode")
                        .help("Use fixed, publicly known Paillier primes. Never for real elections"),
                )
                .arg(
                    Arg::with_name("out")
                        .long("out")
                        .takes_value(true)
                        .help("Directory to write params.json and chain.json to"),
                ),
        )
        .subcommand(
            SubCommand::with_name("verify-chain")
                .about("Validate an exported chain against its election parameters")
                .arg(
                    Arg::with_name("PARAMS")
                        .index(1)
                        .required(true)
                        .help("Election parameters in JSON format"),
                )
                .arg(
                    Arg::with_name("CHAIN")
                        .index(2)
                        .required(true)
                        .help("Chain in JSON format, genesis first"),
                )
                .arg(
                    Arg::with_name("print-key-images")
                        .long("print-key-images")
                        .help("List the key image of every recorded ballot"),
                ),
        )
        .get_matches();

    let level = match matches.occurrences_of("v") {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    // Subcommands
    if let Some(matches) = matches.subcommand_matches("keygen") {
        command_keygen(matches);
    }

    if let Some(matches) = matches.subcommand_matches("simulate") {
        command_simulate(matches);
    } else if let Some(matches) = matches.subcommand_matches("verify-chain") {
        command_verify_chain(matches);
    }
}
