use std::{error::Error, fs, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tether::{
    Client, ClientConfig, DefinitionList, Encryptor, ProtocolError, args, sha256_credential,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the message definitions file
    definitions: PathBuf,
    /// Address of the server
    #[arg(long, default_value = "127.0.0.1:4000")]
    address: SocketAddr,
    #[arg(long, default_value = "michael")]
    user: String,
    #[arg(long, default_value = "mypassword")]
    password: String,
    /// Seconds to wait for each reply
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let schema = DefinitionList::from_text(&fs::read_to_string(&cli.definitions)?)?.instantiate()?;
    let config = ClientConfig::new(cli.address, cli.user, cli.password).with_version(1, 0, 0);
    let encrypt: Encryptor = Arc::new(sha256_credential);
    let timeout = Some(Duration::from_secs(cli.timeout));

    let client = Client::connect(schema, &config, &encrypt)?;
    let result = (|| -> Result<(), ProtocolError> {
        client.receive_blocking("ServerReady", timeout)?;

        client.send("Ping", args!())?;
        client.receive_blocking("Pong", timeout)?;
        println!("Server is alive");

        client.send("WhoAmI", args!())?;
        let reply = client.receive_blocking("YouAre", timeout)?;
        println!("Username: {}", reply.get_str("name").unwrap_or_default());

        client.send("WhatTimeIsIt", args!())?;
        let reply = client.receive_blocking("ItIs", timeout)?;
        println!(
            "It is {:02}:{:02} UTC",
            reply.get_int("hours").unwrap_or_default(),
            reply.get_int("minutes").unwrap_or_default()
        );
        Ok(())
    })();

    let stopped = client.stop();
    result?;
    stopped?;
    Ok(())
}
