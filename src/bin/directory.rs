//! The directory (PKI) server: stores prekeys and reachability information
//! for group members, keyed by identity.
//!
//! Usage: `directory`
//!
//! Listens on TCP port 10501 and serves `PUBLISH` / `QUERY` / `ADDR`
//! requests until killed.

use std::net::TcpListener;
use std::process;

use cascade_dds::network::{serve_directory, DIRECTORY_PORT};

fn main() {
    env_logger::init();

    let listener = match TcpListener::bind(("0.0.0.0", DIRECTORY_PORT)) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("directory: cannot listen on port {}: {}", DIRECTORY_PORT, err);
            process::exit(1);
        }
    };
    if let Err(err) = serve_directory(listener) {
        eprintln!("directory: server failed: {}", err);
        process::exit(1);
    }
}
