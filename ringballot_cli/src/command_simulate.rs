use crate::config::Config;
use log::{info, warn};
use rand::rngs::OsRng;
use rand::Rng;
use ringballot::*;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

struct Outcome {
    params: Arc<ElectionParameters>,
    chain: Vec<Block>,
    replica_height: usize,
    expected: Vec<u64>,
    tally: FinalTally,
}

/// Run a whole election in-process: register voters, cast through the blind authorizer, let the
/// mixnet and the authority scheduler commit the ballots, then threshold-decrypt the tally.
pub fn command_simulate(matches: &clap::ArgMatches) {
    let config = match Config::load(matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ringballot simulate: {}", e);
            std::process::exit(1);
        }
    };

    let voters = parse_count(matches, "voters");
    let candidates = parse_count(matches, "candidates");
    let threshold = parse_count(matches, "threshold");
    let parties = parse_count(matches, "parties");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("ringballot simulate: unable to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let outcome = runtime.block_on(simulate(
        &config, voters, candidates, threshold, parties,
    ));
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("ringballot simulate: {}", e);
            std::process::exit(1);
        }
    };

    println!("> Election {} finished", outcome.params.metadata.id);
    println!(
        "> {} blocks on the authority chain, replica at height {}",
        outcome.chain.len(),
        outcome.replica_height
    );
    println!("Tally:");
    for (candidate, count) in outcome.tally.counts.iter().enumerate() {
        println!("  candidate {} got {} votes", candidate, count);
    }

    if outcome.tally.counts != outcome.expected {
        eprintln!(
            "ringballot simulate: tally {:?} does not match the votes cast {:?}",
            outcome.tally.counts, outcome.expected
        );
        std::process::exit(1);
    }

    if let Some(dir) = matches.value_of("out") {
        write_outputs(Path::new(dir), &outcome);
    }
}

async fn simulate(
    config: &Config,
    voter_count: usize,
    candidates: usize,
    threshold: usize,
    parties: usize,
) -> Result<Outcome> {
    let mut rng = OsRng;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let election = Uuid::new_v4();

    info!("generating election keys");
    let authority_keypair = AuthorityKeyPair::generate(&mut rng, config.rsa_bits)?;
    let paillier_keypair =
        paillier::generate_keypair(&mut rng, config.paillier_bits, config.security_mode)?;
    let key_shares = generate_key_shares(&mut rng, &paillier_keypair.private, parties, threshold)?;
    let (block_key, block_signer) = generate_keypair();

    let voters: Vec<Voter> = (0..voter_count).map(|_| Voter::new(&mut rng)).collect();
    let mut registry = StaticRegistry::new(election);
    for voter in voters.iter() {
        registry.register(voter.id, voter.public_key());
    }
    let registry = Arc::new(registry);

    let metadata = ElectionMetadata {
        id: election,
        candidates,
        max_votes: voter_count as u64,
    };
    let params = Arc::new(ElectionParameters::new(
        metadata,
        paillier_keypair.public.clone(),
        authority_keypair.public_key().clone(),
        registry.as_ref(),
        block_signer,
    )?);

    let mixnet = Arc::new(Mixnet::new(config.mixnet.clone(), clock.clone()));
    let authority = Arc::new(AuthorityNode::new(
        "authority-0",
        NodeRole::Authority(block_key),
        params.clone(),
        config.scheduler.clone(),
        clock.clone(),
        mixnet.clone(),
    )?);

    // A read-only node that follows the authority through sync
    let replica = Arc::new(AuthorityNode::new(
        "replica-0",
        NodeRole::Replica,
        params.clone(),
        config.scheduler.clone(),
        clock.clone(),
        Arc::new(Mixnet::new(config.mixnet.clone(), clock.clone())),
    )?);
    replica.add_peer(authority.clone());

    let service = ElectionService::new(
        BlindAuthorizer::new(authority_keypair, registry.clone()),
        mixnet.clone(),
        authority.clone(),
        clock.clone(),
        threshold,
        parties,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = vec![mixnet.spawn_ticker(shutdown_rx.clone())];
    handles.extend(authority.spawn(shutdown_rx.clone()));
    handles.extend(replica.spawn(shutdown_rx));

    let mut expected = vec![0u64; candidates];
    for voter in voters.iter() {
        let choice = rng.gen_range(0..candidates);
        let ballot = voter.cast_ballot(&mut rng, &params, choice, clock.as_ref(), |id, blinded| {
            service.request_authorization(id, blinded)
        })?;
        service.submit_ballot(ballot)?;
        expected[choice] += 1;
    }
    info!("{} ballots submitted, waiting for the ledger", voter_count);

    // Long enough for a forced mixnet release plus a few drain and sync cycles
    let patience = Duration::from_millis(
        config.mixnet.max_wait_ms
            + 4 * config.mixnet.tick_interval_ms
            + 4 * config.scheduler.drain_interval_ms
            + 4 * config.scheduler.sync_interval_ms,
    );
    let deadline = Instant::now() + patience;
    loop {
        let chain = authority.blocks();
        let recorded: usize = chain.iter().map(|b| b.ballots.len()).sum();
        if recorded >= voter_count && replica.height() == chain.len() {
            break;
        }
        if Instant::now() > deadline {
            warn!(
                "gave up waiting: {} of {} ballots recorded, replica at {} of {}",
                recorded,
                voter_count,
                replica.height(),
                chain.len()
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    let packed = service.close_voting()?;
    for (i, share) in key_shares.iter().take(threshold).enumerate() {
        let partial = create_partial_decryption(&packed, share)?;
        service.submit_partial_decryption(&format!("tally-authority-{}", i + 1), partial)?;
    }
    let tally = service.get_final_tally(election)?;

    Ok(Outcome {
        params,
        chain: service.get_finalized_ballots(election)?,
        replica_height: replica.height(),
        expected,
        tally,
    })
}

fn parse_count(matches: &clap::ArgMatches, name: &str) -> usize {
    let value = matches.value_of(name).unwrap_or("0");
    match value.parse::<usize>() {
        Ok(count) if count > 0 => count,
        _ => {
            eprintln!("ringballot simulate: {} must be a positive integer", name);
            std::process::exit(1);
        }
    }
}

fn write_outputs(dir: &Path, outcome: &Outcome) {
    let params = serde_json::to_string_pretty(outcome.params.as_ref()).unwrap_or_else(|e| {
        eprintln!("ringballot simulate: unable to encode parameters: {}", e);
        std::process::exit(1);
    });
    let chain = serde_json::to_string_pretty(&outcome.chain).unwrap_or_else(|e| {
        eprintln!("ringballot simulate: unable to encode chain: {}", e);
        std::process::exit(1);
    });

    for (name, contents) in [("params.json", params), ("chain.json", chain)] {
        let path = dir.join(name);
        if let Err(e) = std::fs::write(&path, contents) {
            eprintln!("ringballot simulate: unable to write {}: {}", path.display(), e);
            std::process::exit(1);
        }
        println!("> wrote {}", path.display());
    }
}
