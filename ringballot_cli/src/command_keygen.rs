/// Print a fresh block-signing key pair for an authority node
pub fn command_keygen(matches: &clap::ArgMatches) {
    let (signing_key, verifying_key) = ringballot::generate_keypair();
    let secret = hex::encode(signing_key.to_bytes());
    let public = hex::encode(verifying_key.to_bytes());

    if matches.is_present("json") {
        let keys = serde_json::json!({
            "block_signing_secret_key": secret,
            "block_signing_public_key": public,
        });
        println!("{}", keys);
        return;
    }

    println!("block-signing-secret-key: {}", secret);
    println!("block-signing-public-key: {}", public);
}
