//! The IO driver: everything the sans-IO protocol stack does not do.
//!
//! Length-prefixed framing over TCP, the lazily connected peer-link map,
//! the timer wheel backing [`TimerCmd`](crate::TimerCmd) scheduling, and
//! the directory (PKI) wire protocol. The binaries compose these into an
//! event loop; the protocol machines never see any of it.

mod directory;
mod framed;
mod peers;
mod timer;

pub use self::directory::{
    serve_directory, DirectoryClient, DirectoryError, PublishedPeer, DIRECTORY_PORT,
};
pub use self::framed::{read_frame, write_frame, FrameError, MAX_FRAME_LEN};
pub use self::peers::PeerLinks;
pub use self::timer::TimerWheel;
