//! Follow a streaming HTTP endpoint, printing every chunk as it arrives.
//!
//! The connection is re-established whenever it times out, drops, or the server ends the
//! response. Press Ctrl-C to stop. Use `--help` to see the options.

use std::time::Duration;

use bytes::Bytes;
use clap::{arg, value_parser};
use http::Uri;
use tenacious::client::Target;
use tenacious::config::Config;
use tenacious::notify::Notification;
use tenacious::transport::ConnectOptions;
use tenacious::StreamClient;
use tokio::io::AsyncWriteExt as _;
use tracing::Level;
use tracing_subscriber::{
    filter::Targets, layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _,
};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = Targets::new()
        .with_target("tenacious", Level::DEBUG)
        .with_target("follow", Level::TRACE)
        .with_default(Level::INFO);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .init();

    let args = clap::Command::new("follow")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Follow a long-lived HTTP stream")
        .args([
            clap::Arg::new("uri").help("Target URI").required(true),
            arg!(-X --method [METHOD] "HTTP method to use").default_value("GET"),
            arg!(-H --header [HEADER]... "HTTP headers to send"),
            arg!(-d --data [DATA] "Payload to write once connected"),
            arg!(--timeout [SECONDS] "Idle socket timeout in seconds")
                .default_value("60")
                .value_parser(value_parser!(u64).range(1..)),
        ])
        .get_matches();

    let uri: Uri = args
        .get_one::<String>("uri")
        .expect("uri argument must be present")
        .parse()?;

    let mut options = ConnectOptions::try_from(&uri)?.with_method(
        args.get_one::<String>("method")
            .expect("method has a default")
            .parse()?,
    );

    if let Some(headers) = args.get_many::<String>("header") {
        for header in headers {
            let Some((name, value)) = header.split_once(':') else {
                color_eyre::eyre::bail!("header must be NAME:VALUE, got {header:?}");
            };
            options = options.with_header(name.trim().parse()?, value.trim().parse()?);
        }
    }

    let timeout = *args.get_one::<u64>("timeout").expect("timeout has a default");
    let config = Config::new().with_socket_timeout(Duration::from_secs(timeout));

    let client = StreamClient::with_config(Target::from(options), config)?;
    let mut notifications = client.subscribe();

    if let Err(error) = client.start().await {
        tracing::warn!(%error, "initial connection failed, recovering");
        client.recover().await?;
    }
    tracing::info!(%uri, "connected");

    if let Some(data) = args.get_one::<String>("data") {
        client.write(Bytes::from(data.clone()));
    }

    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("stopping");
                break;
            }
            notification = notifications.recv() => match notification {
                Some(Notification::Data { chunk, .. }) => {
                    stdout.write_all(&chunk).await?;
                    stdout.flush().await?;
                }
                Some(Notification::End { status }) => tracing::info!(%status, "server ended the stream"),
                Some(Notification::Recovered(reason)) => tracing::info!(%reason, "recovered"),
                Some(Notification::Error(error)) => tracing::error!(%error, "recovery failed"),
                None => break,
            }
        }
    }

    client.stop(None).await;
    Ok(())
}
