//! Membership view and member-to-member message channel.
//!
//! Both are external collaborators of the coordination core: the view is fed
//! by the embedding process's failure detector, and the message hub only
//! promises at-least-once best-effort delivery per attempt. The hub here is
//! an in-process channel fabric carrying rmp-serde encoded frames; a TCP
//! deployment replaces the fabric behind the same API shape.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::utils::{Bitmap, GridError};

use bytes::Bytes;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use tokio::sync::{broadcast, mpsc};

/// Grid member ID type.
pub type MemberId = u8;

/// Opaque member identity: ID plus incarnation number. A restarted process
/// rejoins with a bumped incarnation; equality is by identity, never by
/// address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct Member {
    pub id: MemberId,
    pub incarnation: u32,
}

impl Member {
    pub fn new(id: MemberId, incarnation: u32) -> Self {
        Member { id, incarnation }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.id, self.incarnation)
    }
}

/// Capacity of the departure events broadcast channel.
const DEPARTURE_CHAN_CAP: usize = 64;

/// Live membership view. Read by everything, written only through departure
/// announcements from the embedding failure detector.
pub struct MembershipView {
    /// Total number of member slots ever configured.
    population: u8,

    /// Currently alive members, keyed by ID.
    alive: Mutex<HashMap<MemberId, Member>>,

    /// Broadcast channel of `(member, crashed)` departure events.
    tx_depart: broadcast::Sender<(Member, bool)>,
}

impl MembershipView {
    /// Creates a new view with all given members alive.
    pub fn new(members: Vec<Member>) -> Arc<Self> {
        let population = members.len() as u8;
        let alive = members.into_iter().map(|m| (m.id, m)).collect();
        let (tx_depart, _) = broadcast::channel(DEPARTURE_CHAN_CAP);
        Arc::new(MembershipView {
            population,
            alive: Mutex::new(alive),
            tx_depart,
        })
    }

    /// Total number of member slots.
    pub fn population(&self) -> u8 {
        self.population
    }

    /// Returns the ordered set of currently alive members.
    pub fn current_view(&self) -> Vec<Member> {
        let mut members: Vec<Member> =
            self.alive.lock().unwrap().values().cloned().collect();
        members.sort_by_key(|m| m.id);
        members
    }

    /// True if the member with given ID is currently in the view.
    pub fn is_alive(&self, id: MemberId) -> bool {
        self.alive.lock().unwrap().contains_key(&id)
    }

    /// Bitmap of alive member IDs.
    pub fn alive_map(&self) -> Bitmap {
        let mut map = Bitmap::new(self.population, false);
        for id in self.alive.lock().unwrap().keys() {
            map.set(*id, true).unwrap();
        }
        map
    }

    /// Subscribes to departure events. Events that occurred before the
    /// subscription are not replayed; callers needing a gap-free picture
    /// subscribe first, then read `alive_map()`.
    pub fn subscribe_departures(
        &self,
    ) -> broadcast::Receiver<(Member, bool)> {
        self.tx_depart.subscribe()
    }

    /// Called by the failure detector when a member leaves or crashes.
    /// Removing an already-gone member is a no-op.
    pub fn announce_departure(
        &self,
        id: MemberId,
        crashed: bool,
    ) -> Result<(), GridError> {
        let removed = self.alive.lock().unwrap().remove(&id);
        if let Some(member) = removed {
            pf_info!("member {} departed (crashed: {})", member, crashed);
            // no subscribers yet is fine
            let _ = self.tx_depart.send((member, crashed));
        }
        Ok(())
    }
}

/// An encoded message frame travelling the fabric.
type Frame = (MemberId, Bytes);

/// Cloneable sending half of a member's message hub.
pub struct HubSender<Msg> {
    /// My member ID.
    me: MemberId,

    /// Shared membership view, consulted to fail sends to departed members
    /// synchronously.
    view: Arc<MembershipView>,

    /// Map from peer ID -> Sender side of that peer's recv channel.
    tx_peers: Arc<HashMap<MemberId, mpsc::Sender<Frame>>>,

    _marker: PhantomData<fn(Msg)>,
}

impl<Msg> Clone for HubSender<Msg> {
    fn clone(&self) -> Self {
        HubSender {
            me: self.me,
            view: self.view.clone(),
            tx_peers: self.tx_peers.clone(),
            _marker: PhantomData,
        }
    }
}

impl<Msg> HubSender<Msg>
where
    Msg: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Sends a message to specified target members. Returns the bitmap of
    /// targets the message could not be handed to (departed or torn down);
    /// delivery beyond that is best-effort.
    pub async fn send_msg(
        &self,
        msg: &Msg,
        targets: &Bitmap,
    ) -> Result<Bitmap, GridError> {
        let bytes = Bytes::from(rmp_serde::to_vec(msg)?);

        let mut failed = Bitmap::new(targets.size(), false);
        for peer in targets.iter_ones() {
            if !self.view.is_alive(peer) {
                failed.set(peer, true)?;
                continue;
            }
            match self.tx_peers.get(&peer) {
                Some(tx_peer) => {
                    if tx_peer.send((self.me, bytes.clone())).await.is_err() {
                        failed.set(peer, true)?;
                    }
                }
                None => {
                    pf_warn!("peer ID {} not found among linked ones", peer);
                    failed.set(peer, true)?;
                }
            }
        }

        if failed.count() > 0 {
            pf_debug!("send_msg failed to reach targets {:?}", failed);
        }
        Ok(failed)
    }

    /// Sends a message to a single target member, reporting failure as an
    /// error.
    pub async fn send_to(
        &self,
        msg: &Msg,
        target: MemberId,
    ) -> Result<(), GridError> {
        let mut targets = Bitmap::new(self.view.population(), false);
        targets.set(target, true)?;
        let failed = self.send_msg(msg, &targets).await?;
        if failed.get(target)? {
            Err(GridError(format!("send to member {} failed", target)))
        } else {
            Ok(())
        }
    }
}

/// Per-member message hub: one recv channel plus the cloneable sending half.
pub struct MessageHub<Msg> {
    /// My member ID.
    me: MemberId,

    /// Sending half handed out to whoever needs to talk.
    sender: HubSender<Msg>,

    /// Receiver side of my recv channel.
    rx_recv: mpsc::Receiver<Frame>,
}

impl<Msg> MessageHub<Msg>
where
    Msg: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Returns a cloneable sending half.
    pub fn sender(&self) -> HubSender<Msg> {
        self.sender.clone()
    }

    /// Receives a message from some peer. Returns `(peer_id, msg)`.
    pub async fn recv_msg(&mut self) -> Result<(MemberId, Msg), GridError> {
        match self.rx_recv.recv().await {
            Some((peer, bytes)) => {
                let msg = rmp_serde::from_slice(&bytes)?;
                pf_trace!("recv from {} msg {:?}", peer, msg);
                Ok((peer, msg))
            }
            None => logged_err!("recv channel of {} closed", self.me),
        }
    }
}

/// Capacity of each member's recv channel.
const RECV_CHAN_CAP: usize = 4096;

/// Builds the fully-connected in-process fabric for all members currently in
/// the view: one hub per member, every member linked to every member
/// (including itself, so a member targeting its own partition goes through
/// the same path).
pub fn build_fabric<Msg>(
    view: &Arc<MembershipView>,
) -> HashMap<MemberId, MessageHub<Msg>>
where
    Msg: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let members = view.current_view();

    let mut inlets: HashMap<MemberId, mpsc::Sender<Frame>> = HashMap::new();
    let mut rx_recvs: HashMap<MemberId, mpsc::Receiver<Frame>> =
        HashMap::new();
    for member in &members {
        let (tx_recv, rx_recv) = mpsc::channel(RECV_CHAN_CAP);
        inlets.insert(member.id, tx_recv);
        rx_recvs.insert(member.id, rx_recv);
    }

    let inlets = Arc::new(inlets);
    let mut hubs = HashMap::new();
    for member in &members {
        let sender = HubSender {
            me: member.id,
            view: view.clone(),
            tx_peers: inlets.clone(),
            _marker: PhantomData,
        };
        hubs.insert(
            member.id,
            MessageHub {
                me: member.id,
                sender,
                rx_recv: rx_recvs.remove(&member.id).unwrap(),
            },
        );
    }
    hubs
}

#[cfg(test)]
mod membership_tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestMsg(String);

    fn three_member_view() -> Arc<MembershipView> {
        MembershipView::new(vec![
            Member::new(0, 1),
            Member::new(1, 1),
            Member::new(2, 1),
        ])
    }

    #[test]
    fn view_departure() -> Result<(), GridError> {
        let view = three_member_view();
        assert_eq!(view.current_view().len(), 3);
        assert!(view.is_alive(1));

        let mut rx = view.subscribe_departures();
        view.announce_departure(1, true)?;
        assert!(!view.is_alive(1));
        assert_eq!(view.current_view().len(), 2);
        assert_eq!(
            tokio_test::block_on(rx.recv())?,
            (Member::new(1, 1), true)
        );

        // duplicate announcement is a no-op
        view.announce_departure(1, true)?;
        assert_eq!(view.alive_map(), Bitmap::from(3, vec![0, 2]));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fabric_send_recv() -> Result<(), GridError> {
        let view = three_member_view();
        let mut hubs = build_fabric::<TestMsg>(&view);
        let mut hub0 = hubs.remove(&0).unwrap();
        let mut hub1 = hubs.remove(&1).unwrap();
        let mut hub2 = hubs.remove(&2).unwrap();

        let failed = hub0
            .sender()
            .send_msg(&TestMsg("hello".into()), &Bitmap::from(3, vec![1, 2]))
            .await?;
        assert_eq!(failed.count(), 0);

        let (peer, msg) = hub1.recv_msg().await?;
        assert_eq!((peer, msg), (0, TestMsg("hello".into())));
        let (peer, msg) = hub2.recv_msg().await?;
        assert_eq!((peer, msg), (0, TestMsg("hello".into())));

        // self-send goes through the same path
        hub0.sender()
            .send_to(&TestMsg("loop".into()), 0)
            .await?;
        let (peer, msg) = hub0.recv_msg().await?;
        assert_eq!((peer, msg), (0, TestMsg("loop".into())));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn send_to_departed_fails() -> Result<(), GridError> {
        let view = three_member_view();
        let hubs = build_fabric::<TestMsg>(&view);
        let sender = hubs[&0].sender();

        view.announce_departure(2, false)?;
        let failed = sender
            .send_msg(&TestMsg("bye".into()), &Bitmap::from(3, vec![1, 2]))
            .await?;
        assert_eq!(failed, Bitmap::from(3, vec![2]));
        assert!(sender.send_to(&TestMsg("bye".into()), 2).await.is_err());
        Ok(())
    }
}
