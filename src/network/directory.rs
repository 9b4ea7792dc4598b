//! The directory (PKI) wire protocol: prekey storage and peer reachability.
//!
//! The protocol is byte-exact: requests start with a big-endian `u32` type,
//! identities are NUL-terminated strings, byte blobs are a big-endian `u32`
//! length plus content. `PUBLISH` stores a peer's address and a batch of
//! prekeys; `QUERY` returns the address and *drains one prekey*; `ADDR`
//! returns the address only.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use failure::Fail;
use log::{info, warn};

/// The port the directory server listens on.
pub const DIRECTORY_PORT: u16 = 10501;

const REQUEST_PUBLISH: u32 = 1;
const REQUEST_QUERY: u32 = 2;
const REQUEST_ADDR: u32 = 3;

/// A directory protocol error.
#[derive(Debug, Fail)]
pub enum DirectoryError {
    /// The connection failed.
    #[fail(display = "Directory connection error: {}", _0)]
    Io(#[cause] io::Error),
    /// The server answered with a failure status.
    #[fail(display = "Directory request for {:?} failed", _0)]
    NotFound(String),
    /// A malformed request or response.
    #[fail(display = "Malformed directory message")]
    Malformed,
}

impl From<io::Error> for DirectoryError {
    fn from(err: io::Error) -> Self {
        DirectoryError::Io(err)
    }
}

fn write_string<W: Write>(writer: &mut W, value: &str) -> io::Result<()> {
    writer.write_all(value.as_bytes())?;
    writer.write_all(&[0])
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, DirectoryError> {
    let mut bytes = Vec::new();
    loop {
        let mut byte = [0];
        reader.read_exact(&mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
        if bytes.len() > 1024 {
            return Err(DirectoryError::Malformed);
        }
    }
    String::from_utf8(bytes).map_err(|_| DirectoryError::Malformed)
}

fn write_bytes<W: Write>(writer: &mut W, value: &[u8]) -> io::Result<()> {
    writer.write_u32::<BigEndian>(value.len() as u32)?;
    writer.write_all(value)
}

fn read_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>, DirectoryError> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    if len > 1024 * 1024 {
        return Err(DirectoryError::Malformed);
    }
    let mut value = vec![0; len];
    reader.read_exact(&mut value)?;
    Ok(value)
}

/// A peer's published reachability, as returned by `QUERY` and `ADDR`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedPeer {
    /// The peer's IPv4 address.
    pub ip: Ipv4Addr,
    /// The peer's listening port.
    pub port: u16,
    /// One prekey, drained by `QUERY`; empty for `ADDR`.
    pub prekey: Vec<u8>,
}

impl PublishedPeer {
    /// The peer's socket address.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.port))
    }
}

/// A client of the directory server.
#[derive(Clone, Debug)]
pub struct DirectoryClient {
    server: String,
}

impl DirectoryClient {
    /// Creates a client of the directory at `server` (`host` or
    /// `host:port`).
    pub fn new(server: &str) -> Self {
        let server = if server.contains(':') {
            server.to_string()
        } else {
            format!("{}:{}", server, DIRECTORY_PORT)
        };
        DirectoryClient { server }
    }

    /// Publishes our identity, listening port and prekeys.
    pub fn publish(&self, id: &str, port: u16, keys: &[Vec<u8>]) -> Result<(), DirectoryError> {
        let mut stream = TcpStream::connect(&self.server)?;
        stream.write_u32::<BigEndian>(REQUEST_PUBLISH)?;
        write_string(&mut stream, id)?;
        stream.write_u16::<BigEndian>(port)?;
        stream.write_u32::<BigEndian>(keys.len() as u32)?;
        for key in keys {
            write_bytes(&mut stream, key)?;
        }
        stream.flush()?;

        let success = stream.read_u8()?;
        if success == 1 {
            Ok(())
        } else {
            Err(DirectoryError::NotFound(id.to_string()))
        }
    }

    /// Looks up a peer's address and drains one of its prekeys.
    pub fn query(&self, id: &str) -> Result<PublishedPeer, DirectoryError> {
        self.lookup(REQUEST_QUERY, id)
    }

    /// Looks up a peer's address only.
    pub fn addr(&self, id: &str) -> Result<PublishedPeer, DirectoryError> {
        self.lookup(REQUEST_ADDR, id)
    }

    fn lookup(&self, request: u32, id: &str) -> Result<PublishedPeer, DirectoryError> {
        let mut stream = TcpStream::connect(&self.server)?;
        stream.write_u32::<BigEndian>(request)?;
        write_string(&mut stream, id)?;
        stream.flush()?;

        let success = stream.read_u8()?;
        if success != 1 {
            return Err(DirectoryError::NotFound(id.to_string()));
        }
        let ip = Ipv4Addr::from(stream.read_u32::<BigEndian>()?);
        let port = stream.read_u16::<BigEndian>()?;
        let prekey = if request == REQUEST_QUERY {
            read_bytes(&mut stream)?
        } else {
            Vec::new()
        };
        Ok(PublishedPeer { ip, port, prekey })
    }
}

#[derive(Debug)]
struct DirectoryRecord {
    ip: Ipv4Addr,
    port: u16,
    prekeys: Vec<Vec<u8>>,
}

/// Runs the directory server on `listener` until the process exits. One
/// thread per connection; the record table is shared behind a mutex.
pub fn serve_directory(listener: TcpListener) -> io::Result<()> {
    let records: Arc<Mutex<HashMap<String, DirectoryRecord>>> =
        Arc::new(Mutex::new(HashMap::new()));
    info!(
        "directory listening on {}",
        listener.local_addr().map_or_else(|_| "?".to_string(), |a| a.to_string())
    );
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!("directory accept failed: {}", err);
                continue;
            }
        };
        let records = records.clone();
        thread::spawn(move || {
            if let Err(err) = serve_connection(stream, &records) {
                warn!("directory connection error: {}", err);
            }
        });
    }
    Ok(())
}

fn serve_connection(
    mut stream: TcpStream,
    records: &Mutex<HashMap<String, DirectoryRecord>>,
) -> Result<(), DirectoryError> {
    let peer_ip = match stream.peer_addr()? {
        SocketAddr::V4(addr) => *addr.ip(),
        SocketAddr::V6(_) => Ipv4Addr::LOCALHOST,
    };
    loop {
        let request = match stream.read_u32::<BigEndian>() {
            Ok(request) => request,
            // Peer closed the connection.
            Err(_) => return Ok(()),
        };
        match request {
            REQUEST_PUBLISH => {
                let id = read_string(&mut stream)?;
                let port = stream.read_u16::<BigEndian>()?;
                let count = stream.read_u32::<BigEndian>()?;
                if count > 1024 {
                    return Err(DirectoryError::Malformed);
                }
                let mut prekeys = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    prekeys.push(read_bytes(&mut stream)?);
                }
                info!("directory: publish {} at {}:{}", id, peer_ip, port);
                records.lock().expect("directory lock").insert(
                    id,
                    DirectoryRecord {
                        ip: peer_ip,
                        port,
                        prekeys,
                    },
                );
                stream.write_all(&[1])?;
            }
            REQUEST_QUERY => {
                let id = read_string(&mut stream)?;
                let mut records = records.lock().expect("directory lock");
                match records.get_mut(&id) {
                    Some(record) if !record.prekeys.is_empty() => {
                        let prekey = record.prekeys.remove(0);
                        stream.write_all(&[1])?;
                        stream.write_u32::<BigEndian>(u32::from(record.ip))?;
                        stream.write_u16::<BigEndian>(record.port)?;
                        write_bytes(&mut stream, &prekey)?;
                    }
                    _ => stream.write_all(&[0])?,
                }
            }
            REQUEST_ADDR => {
                let id = read_string(&mut stream)?;
                let records = records.lock().expect("directory lock");
                match records.get(&id) {
                    Some(record) => {
                        stream.write_all(&[1])?;
                        stream.write_u32::<BigEndian>(u32::from(record.ip))?;
                        stream.write_u16::<BigEndian>(record.port)?;
                    }
                    None => stream.write_all(&[0])?,
                }
            }
            _ => return Err(DirectoryError::Malformed),
        }
        stream.flush()?;
    }
}
