//! Scripted host for integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use roomsync_client::{Channel, ClientConfig, Link, ReconnectPolicy, RoomClient};
use roomsync_protocol::{Frame, FrameBody, FrameKind, Member, RoomInfo, decode_frame, encode_frame};

/// Channel whose links end at a [`Host`] owned by the test.
pub struct TestChannel {
    refuse: AtomicU32,
    refuse_all: std::sync::atomic::AtomicBool,
    opens: AtomicU32,
    accepted: mpsc::UnboundedSender<Link>,
}

impl TestChannel {
    /// Refuse the next `n` opens.
    pub fn refuse_next(&self, n: u32) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Refuse every open from now on.
    pub fn refuse_all(&self) {
        self.refuse_all.store(true, Ordering::SeqCst);
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Channel for TestChannel {
    fn name(&self) -> &'static str {
        "test"
    }

    fn open(&self) -> BoxFuture<'_, io::Result<Link>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let refused = self.refuse_all.load(Ordering::SeqCst)
            || self
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        let result = if refused {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        } else {
            let (client, host) = Link::pair();
            self.accepted
                .send(host)
                .map(|()| client)
                .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "host gone"))
        };
        Box::pin(async move { result })
    }
}

/// The host side: accepts links opened by the client.
pub struct Host {
    accepted: mpsc::UnboundedReceiver<Link>,
}

impl Host {
    /// Waits for the client's next connection.
    pub async fn accept(&mut self) -> HostConn {
        let link = self.accepted.recv().await.expect("channel dropped");
        HostConn { link }
    }
}

/// One accepted connection.
pub struct HostConn {
    link: Link,
}

impl HostConn {
    /// Next frame from the client, heartbeats included.
    pub async fn recv_any(&mut self) -> Frame {
        let bytes = tokio::time::timeout(Duration::from_secs(60), self.link.inbound.recv())
            .await
            .expect("no frame from client")
            .expect("client closed the link");
        decode_frame(&bytes).expect("client sent an undecodable frame")
    }

    /// Next non-heartbeat frame.
    pub async fn recv(&mut self) -> Frame {
        loop {
            let frame = self.recv_any().await;
            if frame.kind() != FrameKind::Heartbeat {
                return frame;
            }
        }
    }

    /// Next frame, which must be of `kind`.
    pub async fn expect(&mut self, kind: FrameKind) -> Frame {
        let frame = self.recv().await;
        assert_eq!(frame.kind(), kind, "unexpected frame {frame:?}");
        frame
    }

    pub fn send(&self, frame: Frame) {
        let bytes = encode_frame(&frame).unwrap();
        self.link.outbound.send(bytes).expect("client dropped the link");
    }

    pub fn send_raw(&self, bytes: &[u8]) {
        self.link.outbound.send(bytes.to_vec()).unwrap();
    }

    /// Replies to `request`, echoing its message id and room id.
    pub fn reply(&self, request: &Frame, body: FrameBody) {
        let mut frame = Frame::new(body);
        frame.message_id = request.message_id.clone();
        frame.room_id = request.room_id.clone();
        self.send(frame);
    }

    /// Pushes an unsolicited frame for `room_id`.
    pub fn push(&self, room_id: &str, body: FrameBody) {
        self.send(Frame::new(body).with_room_id(room_id));
    }

    pub fn ack(&self, sequence: u64) {
        self.send(Frame::new(FrameBody::Ack {
            ack_sequence: sequence,
        }));
    }
}

/// A channel and the host side of it.
pub fn test_channel() -> (Arc<TestChannel>, Host) {
    let (accepted, rx) = mpsc::unbounded_channel();
    let channel = Arc::new(TestChannel {
        refuse: AtomicU32::new(0),
        refuse_all: std::sync::atomic::AtomicBool::new(false),
        opens: AtomicU32::new(0),
        accepted,
    });
    (channel, Host { accepted: rx })
}

pub fn config(client_id: &str) -> ClientConfig {
    ClientConfig::default()
        .with_client_id(client_id)
        .with_reconnect(ReconnectPolicy::new(Duration::from_millis(100), 3))
}

/// A client with id `me` over a test channel.
pub fn client() -> (RoomClient, Arc<TestChannel>, Host) {
    let (channel, host) = test_channel();
    let client = RoomClient::with_channel(config("me"), channel.clone());
    (client, channel, host)
}

/// Room snapshot with `host` leading, `me` as second member.
pub fn room_info(room_id: &str, leader: &str) -> RoomInfo {
    RoomInfo {
        room_id: Some(room_id.to_string()),
        join_code: Some("AB12".to_string()),
        game_id: Some("chess".to_string()),
        self_id: Some("me".to_string()),
        leader_id: Some(leader.to_string()),
        members: Some(vec![Member::new("host", "Host").host(), Member::new("me", "Me")]),
        max_members: Some(4),
        ..RoomInfo::default()
    }
}

/// Joins room `r1` led by `leader` and returns the host connection.
pub async fn joined(client: &RoomClient, host: &mut Host, leader: &str) -> HostConn {
    let (state, conn) = tokio::join!(client.join("AB12"), async {
        let mut conn = host.accept().await;
        let request = conn.expect(FrameKind::JoinRoom).await;
        conn.reply(
            &request,
            FrameBody::RoomJoined {
                room: room_info("r1", leader),
            },
        );
        conn
    });
    state.expect("join failed");
    conn
}

/// Polls `check` until it holds, letting other tasks run in between.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never held");
}
