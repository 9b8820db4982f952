use std::{
    error::Error,
    fs,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use clap::Parser;
use log::{info, warn};
use tether::{
    Connection, DefinitionList, HandlerError, Message, Room, Server, ServerConfig, User, args,
    sha256_credential,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the message definitions file
    definitions: PathBuf,
    /// Listen for new connections at address
    #[arg(long, default_value = "127.0.0.1:4000")]
    address: SocketAddr,
    /// Name of the only user allowed to log in
    #[arg(long, default_value = "michael")]
    user: String,
    /// Password of that user
    #[arg(long, default_value = "mypassword")]
    password: String,
    /// Oldest client major version accepted
    #[arg(long, default_value_t = 1)]
    min_major: i64,
}

/// Answers questions about the current (UTC) time.
struct TimeRoom;

impl Room for TimeRoom {
    fn handle(&self, connection: &Connection, message: Message) -> Result<(), HandlerError> {
        match message.name() {
            "Ping" => connection.send("Pong", args!())?,
            "WhoAmI" => connection.send("YouAre", args!(name = connection.user().name()))?,
            "WhatTimeIsIt" => {
                let minutes = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() / 60;
                connection.send(
                    "ItIs",
                    args!(hours = (minutes / 60 % 24) as i64, minutes = (minutes % 60) as i64),
                )?
            }
            other => return Err(format!("unexpected message: {other}").into()),
        }
        Ok(())
    }

    fn user_enter(&self, connection: &Connection) {
        if let Err(e) = connection.send("ServerReady", args!()) {
            warn!("could not greet {connection}: {e}");
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let schema = DefinitionList::from_text(&fs::read_to_string(&cli.definitions)?)?.instantiate()?;
    info!("loaded {} message definitions", schema.len());

    let min_major = cli.min_major;
    let (name, password) = (cli.user, cli.password);
    let mut server = Server::new(
        schema,
        Arc::new(TimeRoom),
        Arc::new(move |major: i64, _: i64, _: i64| major >= min_major),
        Arc::new(move |username: &str, credential: &[u8], salt: &[u8]| {
            (username == name && credential == sha256_credential(&password, salt).as_slice())
                .then(|| User::new(username))
        }),
        ServerConfig::default().with_address(cli.address),
    );

    let stop = server.stop_handle();
    ctrlc::set_handler(move || {
        info!("interrupted, shutting down");
        stop.stop();
    })?;

    server.run()?;
    Ok(())
}
