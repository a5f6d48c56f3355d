use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::id::{self, Id, ID_BITS};
use crate::peer::{is_address, Peer};
use crate::rpc::{self, Request, Response, RingState};
use crate::store::Store;

/// Upper bound on lookup forwarding. A converged ring answers in O(log N)
/// hops; hitting this means the topology is corrupted.
pub const MAX_HOPS: u32 = ID_BITS as u32;

const EVENT_CAPACITY: usize = 64;

/// Topology transitions observed by this node. The bucket itself never
/// prints; subscribers decide what these mean.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Liveness {
    PredecessorUp(String),
    PredecessorDown(String),
    SuccessorUp(String),
    SuccessorDown(String),
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Liveness::PredecessorUp(addr) => write!(f, "predecessor::up {addr}"),
            Liveness::PredecessorDown(addr) => write!(f, "predecessor::down {addr}"),
            Liveness::SuccessorUp(addr) => write!(f, "successor::up {addr}"),
            Liveness::SuccessorDown(addr) => write!(f, "successor::down {addr}"),
        }
    }
}

/// One ring member: identity, routing state, local entries, and the
/// background maintenance that keeps the ring converged under churn.
///
/// Locking discipline: the ring-state mutexes guard short read-modify-write
/// sections only. Routing and maintenance take snapshots and release the
/// lock before any network call.
pub struct Bucket {
    me: Peer,
    replicas: usize,
    stabilize_interval: Duration,
    predecessor: Mutex<Option<Peer>>,
    successors: Mutex<Vec<Peer>>,
    fingers: Mutex<Vec<Peer>>,
    next_finger: AtomicUsize,
    store: Store,
    events: broadcast::Sender<Liveness>,
    shutdown: watch::Sender<bool>,
}

impl Bucket {
    /// Bind the peer server and start the maintenance loop. The node begins
    /// as a ring of one: every successor and finger slot points at itself.
    pub async fn listen(
        bind: &str,
        port: u16,
        replicas: usize,
        stabilize_interval: Duration,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind((bind, port)).await?;
        let local = listener.local_addr()?;
        let me = Peer::new(format!("{}:{}", local.ip(), local.port()));
        let replicas = replicas.max(1);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let bucket = Arc::new(Bucket {
            predecessor: Mutex::new(None),
            successors: Mutex::new(vec![me.clone(); replicas]),
            fingers: Mutex::new(vec![me.clone(); ID_BITS]),
            next_finger: AtomicUsize::new(0),
            store: Store::new(),
            events,
            shutdown,
            me,
            replicas,
            stabilize_interval,
        });

        info!("{} listening on {}", bucket.me.id, bucket.me.addr);
        bucket.clone().spawn_accept(listener);
        bucket.clone().spawn_maintenance();
        Ok(bucket)
    }

    pub fn id(&self) -> Id {
        self.me.id
    }

    pub fn address(&self) -> &str {
        &self.me.addr
    }

    /// Register for liveness transitions. Each subscriber gets every event
    /// emitted after the call; ordering across subscribers is not defined.
    pub fn subscribe(&self) -> broadcast::Receiver<Liveness> {
        self.events.subscribe()
    }

    /// Stop scheduling stabilization rounds and stop accepting peer calls.
    /// In-flight handlers drain on their own. Safe to call repeatedly.
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            info!("{} shutting down", self.me.addr);
        }
    }

    // ---- join -----------------------------------------------------------

    /// Ask an existing member to locate our successor and adopt it. The
    /// predecessor stays unset; the next notify round establishes it. No
    /// waiting for full convergence.
    pub async fn join(&self, introducer: &str) -> Result<()> {
        if !is_address(introducer) {
            return Err(Error::InvalidAddress(introducer.to_string()));
        }
        let successor = rpc::find_successor(introducer, self.me.id, 0)
            .await
            .map_err(|e| Error::JoinFailed {
                addr: introducer.to_string(),
                source: Box::new(e),
            })?;

        let changed = {
            let mut successors = self.successors.lock().await;
            let changed = successors[0] != successor;
            successors[0] = successor.clone();
            changed
        };
        info!("{} joined ring via {}, successor {}", self.me.addr, introducer, successor.addr);
        if changed && successor != self.me {
            self.emit(Liveness::SuccessorUp(successor.addr));
        }
        Ok(())
    }

    // ---- lookup ---------------------------------------------------------

    /// Resolve the owner of `target`: the first node at or after it walking
    /// clockwise.
    pub async fn find_successor(&self, target: Id) -> Result<Peer> {
        self.find_successor_bounded(target, 0).await
    }

    /// The forwarding loop. `hops` arrives over the wire on forwarded
    /// queries so the budget is global to the lookup, not per node.
    /// Unreachable next-hops are dropped from the finger table and the
    /// lookup retries without them, degrading to plain successor walking.
    async fn find_successor_bounded(&self, target: Id, mut hops: u32) -> Result<Peer> {
        let mut skip: Vec<String> = Vec::new();
        loop {
            if hops >= MAX_HOPS {
                return Err(Error::LookupExhausted(hops));
            }

            let successor = self.first_successor().await;
            if Id::between(self.me.id, target, successor.id) {
                return Ok(successor);
            }

            let candidates = {
                let fingers = self.fingers.lock().await;
                let mut candidates: Vec<Peer> = fingers.clone();
                candidates.push(successor.clone());
                candidates
            };
            let next = id::closest_preceding(
                self.me.id,
                target,
                candidates
                    .iter()
                    .filter(|peer| **peer != self.me && !skip.contains(&peer.addr)),
            );
            let Some(next) = next else {
                // nothing precedes the target from here; the successor is
                // the best remaining guess
                return Ok(successor);
            };

            hops += 1;
            match rpc::find_successor(&next.addr, target, hops).await {
                Ok(owner) => return Ok(owner),
                Err(Error::Unreachable(addr)) => {
                    debug!("lookup hop {} unreachable, retrying without it", addr);
                    self.drop_finger(&addr).await;
                    skip.push(addr);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The node immediately preceding `target` on the ring: the owner's
    /// predecessor. Helper built on `find_successor`.
    pub async fn find_predecessor(&self, target: Id) -> Result<Peer> {
        let owner = self.find_successor(target).await?;
        let state = if owner == self.me {
            self.local_state(false).await
        } else {
            rpc::state(&owner.addr, false).await?
        };
        state
            .predecessor
            .ok_or_else(|| Error::Remote(format!("{} has no predecessor", owner.addr)))
    }

    // ---- client-facing operations ---------------------------------------

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let owner = self.find_successor(Id::hash(key.as_bytes())).await?;
        if owner == self.me {
            return self
                .store
                .get(key)
                .await
                .ok_or_else(|| Error::NotFound(key.to_string()));
        }
        match rpc::call(&owner.addr, Request::Get { key: key.to_string() }).await? {
            Response::Value(Some(value)) => Ok(value),
            Response::Value(None) => Err(Error::NotFound(key.to_string())),
            _ => Err(Error::UnsupportedMethod),
        }
    }

    pub async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let owner = self.find_successor(Id::hash(key.as_bytes())).await?;
        if owner == self.me {
            self.store.set(key.to_string(), value.clone()).await;
            self.replicate(Request::ReplicaSet {
                key: key.to_string(),
                value,
            })
            .await;
            return Ok(());
        }
        match rpc::call(
            &owner.addr,
            Request::Set {
                key: key.to_string(),
                value,
            },
        )
        .await?
        {
            Response::Ok => Ok(()),
            _ => Err(Error::UnsupportedMethod),
        }
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let owner = self.find_successor(Id::hash(key.as_bytes())).await?;
        if owner == self.me {
            self.store.delete(key).await;
            self.replicate(Request::ReplicaDelete {
                key: key.to_string(),
            })
            .await;
            return Ok(());
        }
        match rpc::call(&owner.addr, Request::Delete { key: key.to_string() }).await? {
            Response::Ok => Ok(()),
            _ => Err(Error::UnsupportedMethod),
        }
    }

    pub async fn ping(&self, addr: &str) -> Result<Duration> {
        rpc::ping(addr).await
    }

    /// Topology of this node, or of a remote one when `addr` is given.
    pub async fn state(&self, addr: Option<&str>, fingers: bool) -> Result<RingState> {
        match addr {
            None => Ok(self.local_state(fingers).await),
            Some(addr) if addr == self.me.addr => Ok(self.local_state(fingers).await),
            Some(addr) => rpc::state(addr, fingers).await,
        }
    }

    /// Everything in the local store (or a remote one), replicas included.
    /// Diagnostic only; says nothing about what the node should own.
    pub async fn dump(&self, addr: Option<&str>) -> Result<HashMap<String, Vec<u8>>> {
        match addr {
            None => Ok(self.store.dump().await),
            Some(addr) if addr == self.me.addr => Ok(self.store.dump().await),
            Some(addr) => rpc::dump(addr).await,
        }
    }

    // fire-and-forget copies to the first R-1 successors; the primary write
    // already succeeded, so failures here only get logged
    async fn replicate(&self, request: Request) {
        let targets: Vec<Peer> = {
            let successors = self.successors.lock().await;
            let mut targets = Vec::new();
            for peer in successors.iter().take(self.replicas.saturating_sub(1)) {
                if *peer != self.me && !targets.contains(peer) {
                    targets.push(peer.clone());
                }
            }
            targets
        };
        if targets.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for replica in targets {
                if let Err(e) = rpc::call(&replica.addr, request.clone()).await {
                    warn!("replica write to {} failed: {}", replica.addr, e);
                }
            }
        });
    }

    // ---- peer server ----------------------------------------------------

    fn spawn_accept(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let bucket = self.clone();
                            tokio::spawn(async move {
                                bucket.handle_connection(stream).await;
                            });
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    },
                }
            }
            debug!("{} peer server stopped", self.me.addr);
        });
    }

    async fn handle_connection(&self, mut stream: TcpStream) {
        let request = match rpc::recv_msg::<Request, _>(&mut stream).await {
            Ok(request) => request,
            Err(e) => {
                debug!("dropping malformed peer request: {}", e);
                return;
            }
        };
        let response = self.dispatch(request).await;
        if let Err(e) = rpc::send_msg(&mut stream, &response).await {
            debug!("failed to write peer response: {}", e);
        }
    }

    // the server is a shim: each method maps onto one bucket operation
    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,
            Request::FindSuccessor { id, hops } => {
                match self.find_successor_bounded(id, hops).await {
                    Ok(peer) => Response::Peer(peer),
                    Err(e) => Response::Error(e.to_string()),
                }
            }
            Request::FindPredecessor { id } => match self.find_predecessor(id).await {
                Ok(peer) => Response::Peer(peer),
                Err(e) => Response::Error(e.to_string()),
            },
            Request::Notify { peer } => {
                self.notified_by(peer).await;
                Response::Ok
            }
            Request::GetSuccessors => Response::Peers(self.successors.lock().await.clone()),
            Request::Get { key } => match self.get(&key).await {
                Ok(value) => Response::Value(Some(value)),
                Err(Error::NotFound(_)) => Response::Value(None),
                Err(e) => Response::Error(e.to_string()),
            },
            Request::Set { key, value } => match self.set(&key, value).await {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error(e.to_string()),
            },
            Request::Delete { key } => match self.del(&key).await {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error(e.to_string()),
            },
            Request::ReplicaSet { key, value } => {
                self.store.set(key, value).await;
                Response::Ok
            }
            Request::ReplicaDelete { key } => {
                self.store.delete(&key).await;
                Response::Ok
            }
            Request::State { fingers } => Response::State(self.local_state(fingers).await),
            Request::Dump => Response::Entries(self.store.dump().await),
        }
    }

    /// A peer believes it may be our predecessor. Accept when we have none,
    /// or when it sits strictly between the current predecessor and us.
    async fn notified_by(&self, candidate: Peer) {
        if candidate == self.me {
            return;
        }
        let accepted = {
            let mut predecessor = self.predecessor.lock().await;
            let accept = match predecessor.as_ref() {
                None => true,
                Some(current) => {
                    *current != candidate
                        && Id::strictly_between(current.id, candidate.id, self.me.id)
                }
            };
            if accept {
                *predecessor = Some(candidate.clone());
            }
            accept
        };
        if accepted {
            self.emit(Liveness::PredecessorUp(candidate.addr));
        }
    }

    // ---- stabilization --------------------------------------------------

    fn spawn_maintenance(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(self.stabilize_interval) => {
                        self.stabilize_once().await;
                    }
                }
            }
            debug!("{} maintenance stopped", self.me.addr);
        });
    }

    /// One maintenance round. Steps run in order but a failure in one never
    /// blocks the others; every network error is absorbed here.
    pub async fn stabilize_once(&self) {
        self.check_successor().await;
        self.refresh_from_successor().await;
        self.check_predecessor().await;
        self.notify_successor().await;
        self.fix_next_finger().await;
    }

    // ping the immediate successor; on failure promote the first live entry
    // from the rest of the list, or collapse to a ring of one
    async fn check_successor(&self) {
        let successors = self.successors.lock().await.clone();
        let current = successors[0].clone();
        if current == self.me {
            return;
        }
        if rpc::ping(&current.addr).await.is_ok() {
            return;
        }

        warn!("successor {} unreachable, promoting", current.addr);
        self.emit(Liveness::SuccessorDown(current.addr.clone()));
        self.drop_finger(&current.addr).await;

        for candidate in successors.iter().skip(1) {
            if *candidate == self.me {
                // reached ourselves before any live peer
                break;
            }
            if candidate.addr == current.addr {
                continue;
            }
            match rpc::get_successors(&candidate.addr).await {
                Ok(list) => {
                    let mut spliced = vec![candidate.clone()];
                    spliced.extend(list.into_iter().take(self.replicas - 1));
                    spliced.truncate(self.replicas);
                    while spliced.len() < self.replicas {
                        spliced.push(self.me.clone());
                    }
                    *self.successors.lock().await = spliced;
                    self.emit(Liveness::SuccessorUp(candidate.addr.clone()));
                    return;
                }
                Err(e) => {
                    debug!("successor candidate {} also down: {}", candidate.addr, e);
                    self.drop_finger(&candidate.addr).await;
                }
            }
        }

        // the whole list is gone; ring of one until someone finds us
        *self.successors.lock().await = vec![self.me.clone(); self.replicas];
        self.emit(Liveness::SuccessorUp(self.me.addr.clone()));
    }

    // adopt a closer successor that joined between us, and refill the rest
    // of the list from the successor's own list, shifted by one
    async fn refresh_from_successor(&self) {
        let successor = self.first_successor().await;
        let view = if successor == self.me {
            self.local_state(false).await
        } else {
            match rpc::state(&successor.addr, false).await {
                Ok(view) => view,
                Err(e) => {
                    debug!("successor state from {} failed: {}", successor.addr, e);
                    return;
                }
            }
        };

        let closer = view.predecessor.filter(|x| {
            *x != self.me
                && *x != successor
                && Id::strictly_between(self.me.id, x.id, successor.id)
        });
        // the successor may still be reporting a predecessor that just died
        let closer = match closer {
            Some(x) if rpc::ping(&x.addr).await.is_ok() => Some(x),
            Some(x) => {
                debug!("ignoring unreachable closer successor {}", x.addr);
                None
            }
            None => None,
        };

        match closer {
            Some(closer) => {
                let mut spliced = vec![closer.clone()];
                {
                    let mut successors = self.successors.lock().await;
                    spliced.extend(successors.iter().take(self.replicas - 1).cloned());
                    spliced.truncate(self.replicas);
                    *successors = spliced;
                }
                self.emit(Liveness::SuccessorUp(closer.addr));
            }
            None => {
                let mut refreshed = vec![successor.clone()];
                refreshed.extend(view.successors.into_iter().take(self.replicas - 1));
                refreshed.truncate(self.replicas);
                while refreshed.len() < self.replicas {
                    refreshed.push(self.me.clone());
                }
                *self.successors.lock().await = refreshed;
            }
        }
    }

    // clear the predecessor when it stops answering
    async fn check_predecessor(&self) {
        let Some(predecessor) = self.predecessor.lock().await.clone() else {
            return;
        };
        if rpc::ping(&predecessor.addr).await.is_ok() {
            return;
        }

        let cleared = {
            let mut slot = self.predecessor.lock().await;
            if slot.as_ref() == Some(&predecessor) {
                *slot = None;
                true
            } else {
                false
            }
        };
        if cleared {
            warn!("predecessor {} unreachable, cleared", predecessor.addr);
            self.emit(Liveness::PredecessorDown(predecessor.addr));
        }
    }

    async fn notify_successor(&self) {
        let successor = self.first_successor().await;
        if successor == self.me {
            return;
        }
        if let Err(e) = rpc::notify(&successor.addr, self.me.clone()).await {
            debug!("notify {} failed: {}", successor.addr, e);
        }
    }

    // one slot per round keeps maintenance traffic at one lookup per
    // interval instead of 160
    async fn fix_next_finger(&self) {
        let slot = self.next_finger.fetch_add(1, Ordering::Relaxed) % ID_BITS;
        let target = self.me.id.finger_offset(slot);
        match self.find_successor(target).await {
            Ok(owner) => {
                self.fingers.lock().await[slot] = owner;
            }
            Err(e) => debug!("finger {} fix failed: {}", slot, e),
        }
    }

    // ---- shared snapshots -----------------------------------------------

    async fn first_successor(&self) -> Peer {
        self.successors.lock().await[0].clone()
    }

    async fn local_state(&self, include_fingers: bool) -> RingState {
        RingState {
            addr: self.me.addr.clone(),
            predecessor: self.predecessor.lock().await.clone(),
            successors: self.successors.lock().await.clone(),
            fingers: if include_fingers {
                Some(self.fingers.lock().await.clone())
            } else {
                None
            },
        }
    }

    // stale routing entries point back at us until the next finger fix
    async fn drop_finger(&self, addr: &str) {
        let mut fingers = self.fingers.lock().await;
        for slot in fingers.iter_mut() {
            if slot.addr == addr {
                *slot = self.me.clone();
            }
        }
    }

    fn emit(&self, event: Liveness) {
        debug!("{} event: {}", self.me.addr, event);
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    // long enough that timer-driven rounds never interleave with the
    // manually driven ones below
    const TEST_INTERVAL: Duration = Duration::from_secs(600);

    async fn start_node(replicas: usize) -> Arc<Bucket> {
        Bucket::listen("127.0.0.1", 0, replicas, TEST_INTERVAL)
            .await
            .unwrap()
    }

    // a key whose hash lands on the arc (lower, upper], i.e. is owned by
    // the node with id `upper`
    fn key_owned_by(lower: Id, upper: Id) -> String {
        (0..)
            .map(|i| format!("key-{i}"))
            .find(|k| Id::between(lower, Id::hash(k.as_bytes()), upper))
            .unwrap()
    }

    fn drain(events: &mut broadcast::Receiver<Liveness>) -> Vec<Liveness> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[tokio::test]
    async fn fresh_node_is_a_ring_of_one() {
        let node = start_node(3).await;
        let state = node.state(None, true).await.unwrap();
        assert!(state.predecessor.is_none());
        assert!(state.successors.iter().all(|s| s.addr == node.address()));
        assert_eq!(state.successors.len(), 3);
        assert!(state.fingers.unwrap().iter().all(|f| f.addr == node.address()));
        node.close();
    }

    #[tokio::test]
    async fn single_node_resolves_everything_locally() {
        let node = start_node(3).await;
        node.set("alpha", b"1".to_vec()).await.unwrap();
        assert_eq!(node.get("alpha").await.unwrap(), b"1".to_vec());

        let owner = node.find_successor(Id::hash(b"anything")).await.unwrap();
        assert_eq!(owner.addr, node.address());
        node.close();
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let node = start_node(3).await;
        match node.get("nope").await {
            Err(Error::NotFound(key)) => assert_eq!(key, "nope"),
            other => panic!("expected NotFound, got {other:?}"),
        }
        node.close();
    }

    #[tokio::test]
    async fn repeated_writes_and_deletes_are_idempotent() {
        let node = start_node(3).await;
        node.set("k", b"v".to_vec()).await.unwrap();
        node.set("k", b"v".to_vec()).await.unwrap();
        let dump = node.dump(None).await.unwrap();
        assert_eq!(dump.len(), 1);

        node.del("k").await.unwrap();
        node.del("k").await.unwrap();
        node.del("never-existed").await.unwrap();
        assert!(node.dump(None).await.unwrap().is_empty());
        node.close();
    }

    #[tokio::test]
    async fn join_rejects_bad_addresses() {
        let node = start_node(3).await;
        assert!(matches!(
            node.join("nonsense").await,
            Err(Error::InvalidAddress(_))
        ));
        node.close();
    }

    #[tokio::test]
    async fn join_wraps_unreachable_introducer() {
        let node = start_node(3).await;
        // a port nobody listens on
        let ghost = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ghost_addr = ghost.local_addr().unwrap().to_string();
        drop(ghost);

        match node.join(&ghost_addr).await {
            Err(Error::JoinFailed { addr, source }) => {
                assert_eq!(addr, ghost_addr);
                assert!(matches!(*source, Error::Unreachable(_)));
            }
            other => panic!("expected JoinFailed, got {other:?}"),
        }
        node.close();
    }

    #[tokio::test]
    async fn two_node_ring_converges() {
        let a = start_node(3).await;
        let b = start_node(3).await;

        b.join(a.address()).await.unwrap();
        // b learns a, a adopts b through its own predecessor
        b.stabilize_once().await;
        a.stabilize_once().await;
        b.stabilize_once().await;

        let a_state = a.state(None, false).await.unwrap();
        let b_state = b.state(None, false).await.unwrap();
        assert_eq!(a_state.successors[0].addr, b.address());
        assert_eq!(b_state.successors[0].addr, a.address());
        assert_eq!(a_state.predecessor.as_ref().unwrap().addr, b.address());
        assert_eq!(b_state.predecessor.as_ref().unwrap().addr, a.address());

        // both nodes agree on the owner of a key on the arc (a, b]
        let key = key_owned_by(a.id(), b.id());
        assert_eq!(
            a.find_successor(Id::hash(key.as_bytes())).await.unwrap().addr,
            b.address()
        );
        assert_eq!(
            b.find_successor(Id::hash(key.as_bytes())).await.unwrap().addr,
            b.address()
        );

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn routed_writes_land_on_the_owner() {
        let a = start_node(3).await;
        let b = start_node(3).await;
        b.join(a.address()).await.unwrap();
        b.stabilize_once().await;
        a.stabilize_once().await;
        b.stabilize_once().await;

        // set through a for a key owned by b
        let key = key_owned_by(a.id(), b.id());
        a.set(&key, b"routed".to_vec()).await.unwrap();
        assert!(b.dump(None).await.unwrap().contains_key(&key));

        // reads agree regardless of entry point
        assert_eq!(a.get(&key).await.unwrap(), b"routed".to_vec());
        assert_eq!(b.get(&key).await.unwrap(), b"routed".to_vec());

        // and a routed delete removes it
        a.del(&key).await.unwrap();
        assert!(matches!(b.get(&key).await, Err(Error::NotFound(_))));

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn writes_propagate_to_replicas() {
        let a = start_node(2).await;
        let b = start_node(2).await;
        b.join(a.address()).await.unwrap();
        b.stabilize_once().await;
        a.stabilize_once().await;
        b.stabilize_once().await;

        // owned by a, so its replica lands on a's successor b
        let key = key_owned_by(b.id(), a.id());
        a.set(&key, b"copy".to_vec()).await.unwrap();

        let mut replicated = false;
        for _ in 0..100 {
            if b.dump(None).await.unwrap().get(&key) == Some(&b"copy".to_vec()) {
                replicated = true;
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(replicated, "replica never appeared on the successor");

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn three_node_ring_converges_and_survives_successor_failure() {
        let a = start_node(3).await;
        let b = start_node(3).await;
        let c = start_node(3).await;

        b.join(a.address()).await.unwrap();
        for _ in 0..3 {
            a.stabilize_once().await;
            b.stabilize_once().await;
        }
        c.join(a.address()).await.unwrap();
        for _ in 0..6 {
            a.stabilize_once().await;
            b.stabilize_once().await;
            c.stabilize_once().await;
        }

        // expected ring order: ascending ids, wrapping at the top
        let mut ring = vec![a.clone(), b.clone(), c.clone()];
        ring.sort_by_key(|n| n.id());
        for i in 0..3 {
            let node = &ring[i];
            let expected = &ring[(i + 1) % 3];
            let state = node.state(None, false).await.unwrap();
            assert_eq!(
                state.successors[0].addr,
                expected.address(),
                "wrong successor for ring position {i}"
            );
        }

        // kill the successor of ring[0] and watch it promote the next node
        let survivor = ring[0].clone();
        let victim = ring[1].clone();
        let next_live = ring[2].clone();
        let mut events = survivor.subscribe();
        victim.close();

        // wait for the victim's listener to actually go away
        for _ in 0..100 {
            if rpc::ping(victim.address()).await.is_err() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }

        survivor.stabilize_once().await;
        let state = survivor.state(None, false).await.unwrap();
        assert_eq!(state.successors[0].addr, next_live.address());

        let seen = drain(&mut events);
        let down = Liveness::SuccessorDown(victim.address().to_string());
        let up = Liveness::SuccessorUp(next_live.address().to_string());
        let down_at = seen.iter().position(|e| *e == down);
        let up_at = seen.iter().position(|e| *e == up);
        assert!(down_at.is_some(), "missing successor::down, saw {seen:?}");
        assert!(up_at.is_some(), "missing successor::up, saw {seen:?}");
        assert!(down_at < up_at);

        survivor.close();
        next_live.close();
    }

    #[tokio::test]
    async fn losing_every_successor_collapses_to_a_ring_of_one() {
        let a = start_node(2).await;
        let b = start_node(2).await;
        b.join(a.address()).await.unwrap();
        b.stabilize_once().await;
        a.stabilize_once().await;
        b.stabilize_once().await;

        b.close();
        for _ in 0..100 {
            if rpc::ping(b.address()).await.is_err() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }

        a.stabilize_once().await;
        let state = a.state(None, false).await.unwrap();
        assert!(state.successors.iter().all(|s| s.addr == a.address()));
        a.close();
    }

    #[tokio::test]
    async fn predecessor_failure_clears_and_notifies() {
        let a = start_node(3).await;
        let b = start_node(3).await;
        b.join(a.address()).await.unwrap();
        b.stabilize_once().await;
        a.stabilize_once().await;
        b.stabilize_once().await;
        assert_eq!(
            b.state(None, false).await.unwrap().predecessor.as_ref().unwrap().addr,
            a.address()
        );

        let mut events = b.subscribe();
        a.close();
        for _ in 0..100 {
            if rpc::ping(a.address()).await.is_err() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }

        b.stabilize_once().await;
        assert!(b.state(None, false).await.unwrap().predecessor.is_none());
        let seen = drain(&mut events);
        assert!(seen.contains(&Liveness::PredecessorDown(a.address().to_string())));
        b.close();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_the_server() {
        let node = start_node(3).await;
        let addr = node.address().to_string();
        assert!(rpc::ping(&addr).await.is_ok());

        node.close();
        node.close();

        let mut refused = false;
        for _ in 0..100 {
            if rpc::ping(&addr).await.is_err() {
                refused = true;
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(refused, "server still answering after close");
    }

    #[tokio::test]
    async fn find_predecessor_reports_the_owners_neighbor() {
        let a = start_node(3).await;
        let b = start_node(3).await;
        b.join(a.address()).await.unwrap();
        b.stabilize_once().await;
        a.stabilize_once().await;
        b.stabilize_once().await;

        // the id is owned by b, whose predecessor is a
        let key = key_owned_by(a.id(), b.id());
        let before = a.find_predecessor(Id::hash(key.as_bytes())).await.unwrap();
        assert_eq!(before.addr, a.address());

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn state_and_dump_work_remotely() {
        let a = start_node(3).await;
        let b = start_node(3).await;
        b.join(a.address()).await.unwrap();
        b.stabilize_once().await;
        a.stabilize_once().await;

        let remote = a.state(Some(b.address()), true).await.unwrap();
        assert_eq!(remote.addr, b.address());
        assert!(remote.fingers.is_some());

        let key = key_owned_by(a.id(), b.id());
        b.set(&key, b"x".to_vec()).await.unwrap();
        let entries = a.dump(Some(b.address())).await.unwrap();
        assert_eq!(entries.get(&key), Some(&b"x".to_vec()));

        a.close();
        b.close();
    }
}
