//! In-memory server speaking the engine's protocol, for integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use im_protocol_engine::core::envelope::{self, EnvelopeOptions, KeyRing, Outgoing, Seal, SealKind};
use im_protocol_engine::core::framer::Framer;
use im_protocol_engine::core::packet::RawPacket;
use im_protocol_engine::core::tars::Structured;
use im_protocol_engine::protocol::handshake::{server_exchange_key, server_exchange_respond};
use im_protocol_engine::protocol::message::{commands, ExchangeRequest, ServerListPush};
use im_protocol_engine::transport::{MemoryAcceptor, MemoryConnector, SessionKeyMaterial};
use im_protocol_engine::utils::crypto::{generate_key_pair, KeyPair};
use im_protocol_engine::{ConnectionState, EngineConfig, ServerAddress, StateObserver};

/// Echoed back with the same command and sequence id
pub const ECHO: &str = "Test.Echo";
/// Recorded but never answered
pub const SILENT: &str = "Test.Silent";

const SESSION_TTL: Duration = Duration::from_secs(3600);

enum Control {
    Push(RawPacket),
    Hangup,
}

#[derive(Default)]
struct Shared {
    session: Option<Arc<SessionKeyMaterial>>,
    received: Vec<(String, i32)>,
    handshakes: usize,
    connections: Vec<mpsc::UnboundedSender<Control>>,
    ignore_heartbeats: bool,
    ignore_handshakes: bool,
}

#[derive(Clone)]
pub struct MockServer {
    keys: Arc<KeyPair>,
    shared: Arc<Mutex<Shared>>,
}

impl MockServer {
    /// Start serving every connection the returned connector opens
    pub fn start() -> (Self, MemoryConnector) {
        let (connector, acceptor) = MemoryConnector::pair(64 * 1024);
        let server = Self {
            keys: Arc::new(generate_key_pair()),
            shared: Arc::new(Mutex::new(Shared::default())),
        };
        tokio::spawn(server.clone().accept_loop(acceptor));
        (server, connector)
    }

    /// Engine configuration trusting this server's key
    pub fn config(&self) -> EngineConfig {
        let server_key = hex(self.keys.public());
        EngineConfig::default_with_overrides(|config| {
            config.client.account = "10001".into();
            config.client.response_timeout = Duration::from_millis(500);
            config.client.auto_reconnect = false;
            config.session.server_public_key = Some(server_key);
            config.session.servers = vec![ServerAddress::new("mock.primary", 8080)];
        })
    }

    pub fn handshakes(&self) -> usize {
        self.shared.lock().unwrap().handshakes
    }

    /// Sequence ids received for `command`, in arrival order
    pub fn received(&self, command: &str) -> Vec<i32> {
        self.shared
            .lock()
            .unwrap()
            .received
            .iter()
            .filter(|(c, _)| c == command)
            .map(|(_, seq)| *seq)
            .collect()
    }

    pub fn ignore_heartbeats(&self) {
        self.shared.lock().unwrap().ignore_heartbeats = true;
    }

    /// Leave key exchange requests unanswered while `ignore` is set
    pub fn ignore_handshakes(&self, ignore: bool) {
        self.shared.lock().unwrap().ignore_handshakes = ignore;
    }

    /// Send a session-sealed packet to every open connection
    pub fn push(&self, command: &str, sequence_id: i32, body: Bytes) {
        let shared = self.shared.lock().unwrap();
        let session = shared.session.clone().expect("no session established");
        let frame = session_frame(&session, command, sequence_id, "10001", body);
        for conn in &shared.connections {
            let _ = conn.send(Control::Push(frame.clone()));
        }
    }

    pub fn push_server_list(&self, sequence_id: i32, servers: Vec<ServerAddress>) {
        let body = ServerListPush { servers }.to_bytes();
        self.push(commands::SERVER_LIST_PUSH, sequence_id, body);
    }

    /// Close every open connection from the server side
    pub fn hang_up(&self) {
        let mut shared = self.shared.lock().unwrap();
        for conn in shared.connections.drain(..) {
            let _ = conn.send(Control::Hangup);
        }
    }

    async fn accept_loop(self, mut acceptor: MemoryAcceptor) {
        while let Some(accepted) = acceptor.accept().await {
            let (tx, rx) = mpsc::unbounded_channel();
            self.shared.lock().unwrap().connections.push(tx);
            tokio::spawn(self.clone().serve(accepted.stream, rx));
        }
    }

    async fn serve(self, mut stream: DuplexStream, mut control: mpsc::UnboundedReceiver<Control>) {
        let mut framer = Framer::new(1 << 20);
        let mut buf = vec![0u8; 4096];
        loop {
            let mut frames = Vec::new();
            tokio::select! {
                read = stream.read(&mut buf) => {
                    let n = match read {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    if framer.offer(&buf[..n], |f| frames.push(f)).is_err() {
                        return;
                    }
                }
                ctl = control.recv() => match ctl {
                    Some(Control::Push(frame)) => {
                        if stream.write_all(frame.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    Some(Control::Hangup) | None => return,
                },
            }
            for frame in frames {
                if let Some(reply) = self.respond(&frame) {
                    if stream.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn respond(&self, frame: &RawPacket) -> Option<RawPacket> {
        let header = envelope::peek_header(frame).ok()?;
        match header.seal {
            SealKind::Bootstrap => {
                if self.shared.lock().unwrap().ignore_handshakes {
                    return None;
                }
                let client_public: [u8; 32] = header.public_key?.as_ref().try_into().ok()?;
                let key = server_exchange_key(self.keys.private(), &client_public);
                let keys = KeyRing {
                    session: None,
                    bootstrap: Some(key),
                };
                let packet = envelope::unwrap(frame, &keys).ok()?;
                let request = ExchangeRequest::from_bytes(&packet.body).ok()?;
                let (response, material) =
                    server_exchange_respond(self.keys.private(), &client_public, &request, SESSION_TTL)
                        .ok()?;
                {
                    let mut shared = self.shared.lock().unwrap();
                    shared.session = Some(Arc::new(material));
                    shared.handshakes += 1;
                    shared.received.push((packet.command.clone(), packet.sequence_id));
                }
                let outgoing = Outgoing {
                    command: packet.command,
                    sequence_id: packet.sequence_id,
                    account: packet.account,
                    session_id: Bytes::new(),
                    body: response.to_bytes(),
                };
                let seal = Seal::Bootstrap {
                    public_key: self.keys.public(),
                    key: &key,
                };
                envelope::wrap(&outgoing, &seal, &EnvelopeOptions::default()).ok()
            }
            SealKind::Session => {
                let (session, ignore_heartbeats) = {
                    let shared = self.shared.lock().unwrap();
                    (shared.session.clone()?, shared.ignore_heartbeats)
                };
                let keys = KeyRing {
                    session: Some(session.clone()),
                    bootstrap: None,
                };
                let packet = envelope::unwrap(frame, &keys).ok()?;
                self.shared
                    .lock()
                    .unwrap()
                    .received
                    .push((packet.command.clone(), packet.sequence_id));

                let body = match packet.command.as_str() {
                    SILENT | commands::SERVER_LIST_ACK => return None,
                    commands::HEARTBEAT if ignore_heartbeats => return None,
                    commands::HEARTBEAT => Bytes::new(),
                    _ => packet.body,
                };
                Some(session_frame(
                    &session,
                    &packet.command,
                    packet.sequence_id,
                    &packet.account,
                    body,
                ))
            }
            SealKind::Plain => None,
        }
    }
}

fn session_frame(
    session: &SessionKeyMaterial,
    command: &str,
    sequence_id: i32,
    account: &str,
    body: Bytes,
) -> RawPacket {
    let outgoing = Outgoing {
        command: command.to_string(),
        sequence_id,
        account: account.to_string(),
        session_id: Bytes::copy_from_slice(&session.public_key),
        body,
    };
    envelope::wrap(
        &outgoing,
        &Seal::Session(&session.session_key),
        &EnvelopeOptions::default(),
    )
    .expect("wrap session frame")
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Records every state the engine moves to
#[derive(Default)]
pub struct RecordingObserver {
    pub states: Mutex<Vec<ConnectionState>>,
    pub failures: Mutex<Vec<String>>,
    pub resumes: Mutex<usize>,
}

impl RecordingObserver {
    pub fn states(&self) -> Vec<ConnectionState> {
        self.states.lock().unwrap().clone()
    }
}

impl StateObserver for RecordingObserver {
    fn state_changed(&self, _old: &ConnectionState, new: &ConnectionState) {
        self.states.lock().unwrap().push(new.clone());
    }

    fn exception_on_creating_state(&self, error: &im_protocol_engine::ProtocolError) {
        self.failures.lock().unwrap().push(error.to_string());
    }

    fn after_resume(&self, _result: &im_protocol_engine::Result<()>) {
        *self.resumes.lock().unwrap() += 1;
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
