//! Formulates control interests toward a running forwarder and prints the
//! response payload. The forwarder is named by `CCNX_FORWARDER`
//! (default `tcp://localhost:9695`). Exits 0 on success, 1 on any failure.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use ccnx_codec::{CcnxMessage, Interest, Name};

const DEFAULT_FORWARDER: &str = "tcp://localhost:9695";
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "athenactl", about = "Athena forwarder control client")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a link or a route to the forwarder.
    Add {
        #[command(subcommand)]
        target: AddTarget,
    },
    /// Remove a link or a route.
    Remove {
        #[command(subcommand)]
        target: RemoveTarget,
    },
    /// List forwarder state.
    List {
        #[command(subcommand)]
        target: ListTarget,
    },
    /// Look up the egress links for a name.
    Lookup { name: String },
    /// Fetch forwarder counters.
    Stats,
    /// Set the forwarder log level (off|error|notice|info|debug|all).
    SetLevel { level: String },
    /// Resize the content store; contents are flushed.
    Resize { mb: usize },
    /// Start a new forwarder instance listening on a link URI.
    Spawn { uri: String },
    /// Ask the forwarder to exit.
    Quit,
}

#[derive(Subcommand, Debug)]
enum AddTarget {
    /// Open a link from a URI; prints the assigned link name.
    Link { uri: String },
    /// Add a route; the link defaults to this client's connection.
    Route {
        prefix: String,
        link: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum RemoveTarget {
    Link { name: String },
    Route {
        prefix: String,
        link: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ListTarget {
    Links,
    Routes,
    Pit,
}

fn command_request(command: &Command) -> (String, String) {
    match command {
        Command::Add { target: AddTarget::Link { uri } } => {
            ("ccnx:/local/forwarder/TransportLinkAdapter/add".into(), uri.clone())
        }
        Command::Add { target: AddTarget::Route { prefix, link } } => (
            "ccnx:/local/forwarder/FIB/add".into(),
            match link {
                Some(link) => format!("{} {}", prefix, link),
                None => prefix.clone(),
            },
        ),
        Command::Remove { target: RemoveTarget::Link { name } } => {
            ("ccnx:/local/forwarder/TransportLinkAdapter/remove".into(), name.clone())
        }
        Command::Remove { target: RemoveTarget::Route { prefix, link } } => (
            "ccnx:/local/forwarder/FIB/remove".into(),
            match link {
                Some(link) => format!("{} {}", prefix, link),
                None => prefix.clone(),
            },
        ),
        Command::List { target: ListTarget::Links } => {
            ("ccnx:/local/forwarder/TransportLinkAdapter/list".into(), String::new())
        }
        Command::List { target: ListTarget::Routes } => {
            ("ccnx:/local/forwarder/FIB/list".into(), String::new())
        }
        Command::List { target: ListTarget::Pit } => {
            ("ccnx:/local/forwarder/PIT/list".into(), String::new())
        }
        Command::Lookup { name } => ("ccnx:/local/forwarder/FIB/lookup".into(), name.clone()),
        Command::Stats => ("ccnx:/local/forwarder/Control/stats".into(), String::new()),
        Command::SetLevel { level } => {
            (format!("ccnx:/local/forwarder/Control/set/level/{}", level), String::new())
        }
        Command::Resize { mb } => {
            ("ccnx:/local/forwarder/ContentStore/resize".into(), mb.to_string())
        }
        Command::Spawn { uri } => ("ccnx:/local/forwarder/Control/spawn".into(), uri.clone()),
        Command::Quit => ("ccnx:/local/forwarder/Control/quit".into(), String::new()),
    }
}

fn forwarder_address() -> Result<String, String> {
    let uri = std::env::var("CCNX_FORWARDER").unwrap_or_else(|_| DEFAULT_FORWARDER.to_string());
    let rest = uri
        .strip_prefix("tcp://")
        .ok_or_else(|| format!("only tcp forwarder URIs are supported: {}", uri))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() {
        return Err(format!("bad forwarder URI: {}", uri));
    }
    Ok(authority.to_string())
}

async fn exchange(address: &str, request: &Interest) -> Result<String, String> {
    let mut stream = TcpStream::connect(address)
        .await
        .map_err(|error| format!("couldn't connect to {}: {}", address, error))?;

    let wire = ccnx_codec::encode(&CcnxMessage::Interest(Arc::new(request.clone())));
    stream.write_all(&wire).await.map_err(|error| format!("send failed: {}", error))?;

    let response = tokio::time::timeout(RESPONSE_TIMEOUT, read_packet(&mut stream))
        .await
        .map_err(|_| "timed out waiting for response".to_string())??;

    match ccnx_codec::decode(&response).map_err(|error| format!("bad response: {:?}", error))? {
        CcnxMessage::Object(object) => Ok(String::from_utf8_lossy(&object.payload).to_string()),
        other => Err(format!("unexpected response message: {:?}", other)),
    }
}

async fn read_packet(stream: &mut TcpStream) -> Result<Vec<u8>, String> {
    let header_length = ccnx_codec::min_header_length();
    let mut buffer = vec![0u8; header_length];
    stream
        .read_exact(&mut buffer)
        .await
        .map_err(|error| format!("receive failed: {}", error))?;
    let total = ccnx_codec::packet_length(&buffer)
        .map_err(|error| format!("bad response framing: {:?}", error))?;
    buffer.resize(total, 0);
    stream
        .read_exact(&mut buffer[header_length..])
        .await
        .map_err(|error| format!("receive failed: {}", error))?;
    Ok(buffer)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let (name, payload) = command_request(&args.command);

    let request = match Name::from_uri(&name) {
        Ok(name) => Interest::new(name).with_payload(payload.into_bytes()),
        Err(error) => {
            eprintln!("athenactl: bad command name: {:?}", error);
            return ExitCode::FAILURE;
        }
    };

    let address = match forwarder_address() {
        Ok(address) => address,
        Err(error) => {
            eprintln!("athenactl: {}", error);
            return ExitCode::FAILURE;
        }
    };

    match exchange(&address, &request).await {
        Ok(body) => {
            println!("{}", body);
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("athenactl: {}", error);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_map_to_control_names() {
        let (name, payload) = command_request(&Command::Stats);
        assert_eq!(name, "ccnx:/local/forwarder/Control/stats");
        assert!(payload.is_empty());

        let (name, payload) = command_request(&Command::Add {
            target: AddTarget::Route { prefix: "lci:/foo".into(), link: Some("up0".into()) },
        });
        assert_eq!(name, "ccnx:/local/forwarder/FIB/add");
        assert_eq!(payload, "lci:/foo up0");

        let (name, _) = command_request(&Command::SetLevel { level: "debug".into() });
        assert_eq!(name, "ccnx:/local/forwarder/Control/set/level/debug");
    }

    #[test]
    fn forwarder_address_strips_scheme_and_options() {
        std::env::remove_var("CCNX_FORWARDER");
        assert_eq!(forwarder_address().expect("default"), "localhost:9695");
    }
}
