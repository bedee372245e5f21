use ringballot::*;

/// Check an exported chain against the election parameters it was built under.
pub fn command_verify_chain(matches: &clap::ArgMatches) {
    let params = read_file(matches.value_of("PARAMS").unwrap_or_default());
    let chain = read_file(matches.value_of("CHAIN").unwrap_or_default());

    let params: ElectionParameters = match serde_json::from_str(&params) {
        Ok(params) => params,
        Err(e) => {
            eprintln!("ringballot verify-chain: invalid election parameters: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = params.validate() {
        eprintln!("ringballot verify-chain: invalid election parameters: {}", e);
        std::process::exit(1);
    }

    let ledger = match Ledger::from_json(&chain, &params) {
        Ok(ledger) => ledger,
        Err(e) => {
            eprintln!("ringballot verify-chain: chain rejected: {}", e);
            std::process::exit(1);
        }
    };

    println!("> Chain verified OK");
    println!("  election: {}", ledger.election());
    println!("  blocks:   {}", ledger.height());
    println!("  ballots:  {}", ledger.ballot_count());
    println!("  tip:      {}", ledger.tip().hash_hex());

    if matches.is_present("print-key-images") {
        println!("Key images:");
        for ballot in ledger.ballots() {
            println!("  {}", ballot.key_image_hex());
        }
    }
}

fn read_file(filename: &str) -> String {
    match std::fs::read_to_string(filename) {
        Ok(contents) => contents,
        Err(e) => {
            eprintln!("ringballot verify-chain: unable to read {}: {}", filename, e);
            std::process::exit(1);
        }
    }
}
