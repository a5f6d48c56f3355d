use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::id::Id;
use crate::peer::{is_address, Peer};

/// Budget for one complete remote call: dial, write request, read response.
/// A call that blows it is treated exactly like a failed dial.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(3);

const MAX_FRAME: usize = 10 * 1024 * 1024;

/// One inbound peer method. A connection carries a single request and its
/// response, mirroring the per-call client the surrounding tooling expects.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Ping,
    /// `hops` is the budget already spent on this lookup; it travels with
    /// the query so a corrupted ring cannot route forever.
    FindSuccessor {
        id: Id,
        hops: u32,
    },
    FindPredecessor {
        id: Id,
    },
    Notify {
        peer: Peer,
    },
    GetSuccessors,
    Get {
        key: String,
    },
    Set {
        key: String,
        value: Vec<u8>,
    },
    Delete {
        key: String,
    },
    /// Replica writes land directly in the local store, bypassing ownership
    /// routing; only owners send these.
    ReplicaSet {
        key: String,
        value: Vec<u8>,
    },
    ReplicaDelete {
        key: String,
    },
    State {
        fingers: bool,
    },
    Dump,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Pong,
    Peer(Peer),
    Peers(Vec<Peer>),
    Value(Option<Vec<u8>>),
    Entries(HashMap<String, Vec<u8>>),
    State(RingState),
    Ok,
    Error(String),
}

/// A node's topology as reported by its `State` method.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RingState {
    pub addr: String,
    pub predecessor: Option<Peer>,
    pub successors: Vec<Peer>,
    pub fingers: Option<Vec<Peer>>,
}

/// Perform one remote call. Fails fast with `InvalidAddress` before any
/// network activity, `Unreachable` on dial/timeout/io trouble, and `Remote`
/// when the peer answered with an application error. Retrying is the
/// caller's decision.
pub async fn call(addr: &str, request: Request) -> Result<Response> {
    if !is_address(addr) {
        return Err(Error::InvalidAddress(addr.to_string()));
    }

    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        send_msg(&mut stream, &request).await?;
        recv_msg::<Response, _>(&mut stream).await
    };

    match tokio::time::timeout(RPC_TIMEOUT, exchange).await {
        Err(_elapsed) => Err(Error::Unreachable(addr.to_string())),
        Ok(Err(e)) if e.kind() == ErrorKind::InvalidData => {
            Err(Error::Remote(format!("bad frame from {addr}: {e}")))
        }
        Ok(Err(_)) => Err(Error::Unreachable(addr.to_string())),
        Ok(Ok(Response::Error(message))) => Err(Error::Remote(message)),
        Ok(Ok(response)) => Ok(response),
    }
}

/// Round-trip liveness probe returning the measured latency.
pub async fn ping(addr: &str) -> Result<Duration> {
    let start = Instant::now();
    match call(addr, Request::Ping).await? {
        Response::Pong => Ok(start.elapsed()),
        _ => Err(Error::UnsupportedMethod),
    }
}

pub async fn find_successor(addr: &str, id: Id, hops: u32) -> Result<Peer> {
    match call(addr, Request::FindSuccessor { id, hops }).await? {
        Response::Peer(peer) => Ok(peer),
        _ => Err(Error::UnsupportedMethod),
    }
}

pub async fn get_successors(addr: &str) -> Result<Vec<Peer>> {
    match call(addr, Request::GetSuccessors).await? {
        Response::Peers(peers) => Ok(peers),
        _ => Err(Error::UnsupportedMethod),
    }
}

pub async fn notify(addr: &str, peer: Peer) -> Result<()> {
    match call(addr, Request::Notify { peer }).await? {
        Response::Ok => Ok(()),
        _ => Err(Error::UnsupportedMethod),
    }
}

pub async fn state(addr: &str, fingers: bool) -> Result<RingState> {
    match call(addr, Request::State { fingers }).await? {
        Response::State(state) => Ok(state),
        _ => Err(Error::UnsupportedMethod),
    }
}

pub async fn dump(addr: &str) -> Result<HashMap<String, Vec<u8>>> {
    match call(addr, Request::Dump).await? {
        Response::Entries(entries) => Ok(entries),
        _ => Err(Error::UnsupportedMethod),
    }
}

// length-prefixed bincode framing; u32 big-endian length then payload
pub(crate) async fn send_msg<M, W>(stream: &mut W, msg: &M) -> std::io::Result<()>
where
    M: Serialize,
    W: AsyncWriteExt + Unpin,
{
    let encoded = bincode::serialize(msg)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
    let len = encoded.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&encoded).await?;
    Ok(())
}

pub(crate) async fn recv_msg<M, R>(stream: &mut R) -> std::io::Result<M>
where
    M: DeserializeOwned,
    R: AsyncReadExt + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME {
        return Err(std::io::Error::new(ErrorKind::InvalidData, "frame too large"));
    }
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;
    bincode::deserialize(&buffer).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
}
